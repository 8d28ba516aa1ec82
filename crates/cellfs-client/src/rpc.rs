//! TCP transport for cell requests.
//!
//! One connection per call: connect, send one request frame, read one
//! response frame, close. The whole exchange runs under the caller's
//! deadline.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use cellfs_kernel::wire::{self, CellRequest, CellResponse, Reply};
use cellfs_kernel::{CellConfig, CellFsError, CellFsResult, CellTransport};

use crate::constants::CONNECT_TIMEOUT;

/// Sends requests to cells over TCP.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn exchange(&self, cell: &CellConfig, request: &CellRequest) -> CellFsResult<Reply> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&cell.network_address),
        )
        .await
        .map_err(|_| {
            CellFsError::timeout(format!(
                "connecting to cell {} at {}",
                cell.cell_name, cell.network_address
            ))
        })?
        .map_err(|e| {
            CellFsError::internal(format!(
                "cannot reach cell {} at {}: {e}",
                cell.cell_name, cell.network_address
            ))
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| CellFsError::internal(format!("cannot configure socket: {e}")))?;

        let mut framed = Framed::new(stream, wire::frame_codec(cell.max_message_bytes()));
        wire::send_frame(&mut framed, request).await?;
        let response: CellResponse = wire::recv_frame(&mut framed).await?.ok_or_else(|| {
            CellFsError::internal(format!(
                "cell {} closed the connection without replying",
                cell.cell_name
            ))
        })?;
        response
    }
}

#[async_trait]
impl CellTransport for TcpTransport {
    async fn call(
        &self,
        cell: &CellConfig,
        request: CellRequest,
        deadline: Duration,
    ) -> CellFsResult<Reply> {
        let op = request.op.name();
        let outcome = tokio::time::timeout(deadline, self.exchange(cell, &request)).await;
        match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::debug!(cell = %cell.cell_name, op, error = %e, "remote call failed");
                }
                result
            }
            Err(_) => {
                tracing::warn!(cell = %cell.cell_name, op, ?deadline, "remote call timed out");
                Err(CellFsError::timeout(format!(
                    "{op} on cell {} exceeded {deadline:?}",
                    cell.cell_name
                )))
            }
        }
    }
}
