//! The coordinator RPC surface and its transport plumbing.
//!
//! The coordinator listens on a Unix domain socket namespaced by the
//! invoking user's uid, so several users can run jobs on the same host
//! without colliding.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tower::service_fn;

tonic::include_proto!("mapreduce");

pub use coordinator_client::CoordinatorClient;
pub use coordinator_server::CoordinatorServer;

/// Default coordinator endpoint for the invoking user.
pub fn socket_path() -> PathBuf {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/var/tmp/mr-{}.sock", uid))
}

/// Dial the coordinator at the given socket.
///
/// The http URI is a placeholder the HTTP/2 client requires; the connector
/// ignores it and dials `sock` instead.
pub async fn connect(sock: &Path) -> Result<CoordinatorClient<Channel>> {
    let sock = sock.to_path_buf();
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(sock.clone())))
        .await
        .context("cannot dial coordinator socket")?;
    Ok(CoordinatorClient::new(channel))
}

/// Serve `svc` on the socket at `sock`.
///
/// Any stale socket file left behind by a previous run is unlinked before
/// binding.
pub async fn serve<T: coordinator_server::Coordinator>(
    svc: CoordinatorServer<T>,
    sock: &Path,
) -> Result<()> {
    let _ = std::fs::remove_file(sock);
    let listener = UnixListener::bind(sock)
        .with_context(|| format!("cannot bind coordinator socket {}", sock.display()))?;
    Server::builder()
        .add_service(svc)
        .serve_with_incoming(UnixListenerStream::new(listener))
        .await?;
    Ok(())
}
