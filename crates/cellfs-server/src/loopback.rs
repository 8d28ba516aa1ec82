//! In-process transport between cell servers.
//!
//! Requests are encoded and decoded exactly as on the network, then handed
//! straight to the target [`CellServer`]. Used for tests and for hosting
//! several cells in one process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use cellfs_kernel::wire::{self, CellRequest, CellResponse, Reply};
use cellfs_kernel::{CellConfig, CellFsError, CellFsResult, CellTransport};

use crate::handler::CellServer;

#[derive(Default)]
pub struct LoopbackTransport {
    cells: DashMap<String, Arc<CellServer>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `server` reachable under its cell name.
    pub fn register(&self, server: Arc<CellServer>) {
        self.cells.insert(server.cell_name().to_string(), server);
    }

    pub fn unregister(&self, cell: &str) -> Option<Arc<CellServer>> {
        self.cells.remove(cell).map(|(_, server)| server)
    }

    /// Drop every registered server.
    pub fn clear(&self) {
        self.cells.clear();
    }
}

#[async_trait]
impl CellTransport for LoopbackTransport {
    async fn call(
        &self,
        cell: &CellConfig,
        request: CellRequest,
        deadline: Duration,
    ) -> CellFsResult<Reply> {
        let server = self
            .cells
            .get(&cell.cell_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                CellFsError::internal(format!("cell {} is not reachable", cell.cell_name))
            })?;

        let request: CellRequest = wire::decode(&wire::encode(&request)?)?;
        let response = tokio::time::timeout(deadline, server.handle(request))
            .await
            .map_err(|_| {
                CellFsError::timeout(format!("cell {} exceeded {deadline:?}", cell.cell_name))
            })?;
        let response: CellResponse = wire::decode(&wire::encode(&response)?)?;
        response
    }
}
