//! TCP accept loop.
//!
//! Connections are persistent and pipelined: one task per connection reads
//! framed requests and writes framed responses until the peer hangs up. A
//! semaphore sized to the worker pool bounds how many connections are
//! served at once; accept blocks while all permits are taken.

use crate::coordinator::Coordinator;
use quorumkv_cluster::PeerTransport;
use quorumkv_wire::{read_frame, write_frame, WireError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

const SOCKET_BACKLOG: u32 = 128;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Bind the listening socket with `SO_REUSEADDR`. A bind failure is fatal
/// at startup.
pub fn bind(port: u16) -> Result<TcpListener, ServerError> {
    let map_err = |source| ServerError::Bind { port, source };

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = TcpSocket::new_v4().map_err(map_err)?;
    socket.set_reuseaddr(true).map_err(map_err)?;
    socket.bind(addr).map_err(map_err)?;
    socket.listen(SOCKET_BACKLOG).map_err(map_err)
}

/// Run the accept loop until the shutdown flag flips, then close the
/// listener and stop the outstanding connection tasks.
pub async fn run<T: PeerTransport>(
    listener: TcpListener,
    coordinator: Arc<Coordinator<T>>,
    worker_pool_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let workers = Arc::new(Semaphore::new(worker_pool_size));
    let mut connections = JoinSet::new();

    tracing::info!(
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        workers = worker_pool_size,
        "server listening"
    );

    loop {
        let permit = tokio::select! {
            permit = workers.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, "set_nodelay failed: {e}");
        }

        let coordinator = coordinator.clone();
        connections.spawn(async move {
            let _permit = permit;
            match handle_connection(stream, coordinator).await {
                Ok(()) => tracing::debug!(%peer, "connection closed"),
                Err(e) => tracing::debug!(%peer, "connection dropped: {e}"),
            }
        });
    }

    // Closing the listener unblocks nothing further; in-flight connections
    // are stopped rather than drained, since a pipelined client may never
    // hang up on its own.
    drop(listener);
    connections.shutdown().await;
    tracing::info!("server stopped");
}

/// Serve one persistent connection: request frames in, response frames out,
/// until clean EOF. A framing error closes the connection; a malformed
/// request inside an intact frame only fails that request.
async fn handle_connection<T: PeerTransport>(
    mut stream: TcpStream,
    coordinator: Arc<Coordinator<T>>,
) -> Result<(), WireError> {
    loop {
        let Some(request) = read_frame(&mut stream).await? else {
            return Ok(());
        };
        let response = coordinator.handle_request(request).await;
        write_frame(&mut stream, &response).await?;
    }
}
