use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Name of the workload to execute
    #[clap(short, long)]
    pub workload: String,
    /// Scratch directory for intermediate shards
    #[clap(short = 'd', long, default_value = "tmp")]
    pub scratch_dir: PathBuf,
    /// Directory for the final mr-out-* files
    #[clap(short, long, default_value = ".")]
    pub out_dir: PathBuf,
    /// [OPT] Connect to this socket instead of the per-user default
    #[clap(short, long, default_value = None)]
    pub socket: Option<PathBuf>,
    /// Auxiliary arguments to pass to the MapReduce application.
    #[clap(value_parser, last = true)]
    pub args: Vec<String>,
}
