use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use mapred::cmd::worker::Args;
use mapred::rpc;
use mapred::worker::Worker;
use mapred::workload;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let engine = workload::named(&args.workload)?;
    let aux = Bytes::from(serde_json::to_string(&args.args)?);
    let sock = args.socket.unwrap_or_else(rpc::socket_path);

    let client = rpc::connect(&sock).await?;
    let worker = Worker::register(client, engine, aux, args.scratch_dir, args.out_dir).await?;
    worker.run().await
}
