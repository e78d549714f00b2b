use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mapred::cmd::coordinator::Args;
use mapred::coordinator::{CoordinatorService, TASK_TIMEOUT_MS};
use mapred::rpc::{self, CoordinatorServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let timeout_ms = args.timeout_ms.unwrap_or(TASK_TIMEOUT_MS);
    let sock = args.socket.unwrap_or_else(rpc::socket_path);

    let coordinator = CoordinatorService::new(args.files, args.n_reduce, timeout_ms);
    coordinator.start_reaper();

    let mut server = {
        let service = coordinator.clone();
        let sock = sock.clone();
        tokio::spawn(async move { rpc::serve(CoordinatorServer::new(service), &sock).await })
    };
    info!(socket = %sock.display(), "coordinator listening");

    while !coordinator.done() {
        if server.is_finished() {
            match (&mut server).await {
                Ok(Err(err)) => error!(%err, "coordinator server failed"),
                Err(err) => error!(%err, "coordinator server panicked"),
                Ok(Ok(())) => {}
            }
            anyhow::bail!("coordinator server exited before the job finished");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    info!("job complete");

    // Linger briefly so workers polling for tasks receive their EXIT reply
    // instead of a connection error.
    tokio::time::sleep(Duration::from_secs(2)).await;
    server.abort();
    let _ = std::fs::remove_file(&sock);
    Ok(())
}
