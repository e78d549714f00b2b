use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Input files, one map task per file
    pub files: Vec<String>,
    /// Number of reduce partitions
    #[clap(short = 'r', long)]
    pub n_reduce: u32,
    /// Milliseconds an assigned task may run before it is reassigned
    #[clap(short, long, default_value = None)]
    pub timeout_ms: Option<i64>,
    /// [OPT] Listen on this socket instead of the per-user default
    #[clap(short, long, default_value = None)]
    pub socket: Option<PathBuf>,
}
