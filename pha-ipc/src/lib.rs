//! Local IPC transport (spec §6): frames `PolicyEngine` commands over a
//! named pipe (Windows) or Unix domain socket (everywhere else, for local
//! development and CI -- the agent's supported deployment target is
//! Windows, spec §1), authorizes callers by integrity level before a
//! mutating command runs, and streams `Apply` progress on the same
//! connection ahead of the terminal response.

pub mod auth;
pub mod dispatch;
pub mod server;

use std::sync::Arc;

use pha_engine::PolicyEngine;
use tokio_util::sync::CancellationToken;

pub use auth::CallerIdentity;

/// Runs the IPC server until `shutdown` is cancelled.
///
/// On Windows this listens on the named pipe `\\.\pipe\<IPC_ENDPOINT_NAME>`
/// (spec §6). Elsewhere it listens on `socket_path`, which callers should
/// place under a directory only the service account can write to.
/// `pool_size` is the number of concurrently-accepting listener instances
/// (spec §5: "a small fixed pool (default 4) of listener instances");
/// values below 1 are treated as 1.
#[cfg(windows)]
pub async fn serve(engine: Arc<PolicyEngine>, shutdown: CancellationToken, pool_size: usize) -> std::io::Result<()> {
    let pipe_name = server::transport::pipe_name();
    tracing::info!(%pipe_name, pool_size, "starting IPC server");
    server::transport::serve(engine, &pipe_name, shutdown, pool_size).await
}

#[cfg(not(windows))]
pub async fn serve(
    engine: Arc<PolicyEngine>,
    socket_path: &std::path::Path,
    shutdown: CancellationToken,
    pool_size: usize,
) -> std::io::Result<()> {
    tracing::info!(socket_path = %socket_path.display(), pool_size, "starting IPC server");
    server::transport::serve(engine, socket_path, shutdown, pool_size).await
}
