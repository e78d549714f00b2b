use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use mapred::standalone::{
    engine::{perform_map, perform_reduce},
    Args, Commands, Job,
};
use mapred::*;

fn parse_args() -> Job {
    let args = Args::parse();
    match args.command {
        Commands::Submit {
            input,
            workload,
            output,
            n_reduce,
            args,
        } => Job {
            input,
            workload,
            output,
            n_reduce,
            args,
        },
    }
}

fn run_standalone_mr_job(job: Job, engine: Workload) -> Result<()> {
    let serialized_args = Bytes::from(serde_json::to_string(&job.args)?);
    /*  The map logic carries out mapping and also the shuffle. This makes
     *  sense in the case of a standalone system.
     */
    let buckets = perform_map(&job, &engine, &serialized_args, job.n_reduce)?;
    // reduce phase
    perform_reduce(&job, &engine, &serialized_args, job.n_reduce, buckets)
}

fn main() -> Result<()> {
    let job = parse_args();
    let engine = workload::named(&job.workload)?;

    run_standalone_mr_job(job, engine)
}
