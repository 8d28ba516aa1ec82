//! TCP accept loop.
//!
//! Each connection carries any number of request/response frame pairs and is
//! served by its own task. Cancelling the shutdown token stops accepting;
//! connections already open finish their current request.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use cellfs_kernel::wire::{self, CellRequest, CellResponse};
use cellfs_kernel::{CellFsError, CellFsResult};

use crate::constants::SHUTDOWN_GRACE;
use crate::handler::CellServer;

/// Accept connections on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    server: Arc<CellServer>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(cell = %server.cell_name(), %local, "serving cell");
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let server = server.clone();
                let shutdown = shutdown.clone();
                tracker.spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, server, shutdown).await {
                        tracing::debug!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
        }
    }

    tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
        tracing::warn!(open = tracker.len(), "connections still open at shutdown");
    }
    tracing::info!(cell = %server.cell_name(), "stopped serving");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    server: Arc<CellServer>,
    shutdown: CancellationToken,
) -> CellFsResult<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| CellFsError::internal(format!("cannot configure socket: {e}")))?;
    let mut framed = Framed::new(stream, wire::frame_codec(server.config().max_message_bytes()));
    tracing::trace!(%peer, "connection opened");

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = wire::recv_frame::<_, CellRequest>(&mut framed) => next,
        };
        let response: CellResponse = match next {
            Ok(Some(request)) => server.handle(request).await,
            Ok(None) => break,
            Err(e @ CellFsError::InvalidArgument(_)) => {
                tracing::warn!(%peer, error = %e, "malformed request");
                wire::send_frame(&mut framed, &CellResponse::Err(e)).await?;
                break;
            }
            Err(e) => return Err(e),
        };
        wire::send_frame(&mut framed, &response).await?;
    }
    tracing::trace!(%peer, "connection closed");
    Ok(())
}
