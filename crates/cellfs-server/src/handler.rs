//! Request handling for one cell.
//!
//! Checks the credential, then runs the operation against a store rooted at
//! the cell's physical root. Cross-cell envelopes go through a router that
//! executes inside this cell.

use std::sync::Arc;

use cellfs_kernel::wire::{CellRequest, CellResponse, CrossCellCall, Operation, Reply};
use cellfs_kernel::{
    CellConfig, CellContext, CellFsError, CellFsResult, CellRegistry, CellTransport, FileStore,
    ReadResults, Router, WriteResults,
};

/// Serves requests addressed to one cell.
pub struct CellServer {
    config: CellConfig,
    store: FileStore,
    router: Router,
}

impl CellServer {
    pub fn new(
        config: CellConfig,
        registry: Arc<dyn CellRegistry>,
        transport: Arc<dyn CellTransport>,
    ) -> Self {
        let store = FileStore::new(&config.physical_root);
        let router = Router::new(
            registry,
            CellContext::in_cell(config.cell_name.clone()),
            transport,
        )
        .with_local_store(store.clone());
        Self {
            config,
            store,
            router,
        }
    }

    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    pub fn cell_name(&self) -> &str {
        &self.config.cell_name
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Router executing inside this cell.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Answer one request.
    pub async fn handle(&self, request: CellRequest) -> CellResponse {
        let op = request.op.name();
        if request.credential != self.config.credential {
            tracing::warn!(
                cell = %self.config.cell_name,
                source = %request.source_cell,
                op,
                "rejected request with wrong credential"
            );
            return Err(CellFsError::permission_denied(format!(
                "wrong credential for cell {}",
                self.config.cell_name
            )));
        }

        tracing::debug!(cell = %self.config.cell_name, source = %request.source_cell, op, "handling");
        let result = self.execute(request.op).await;
        if let Err(e) = &result {
            tracing::debug!(cell = %self.config.cell_name, op, error = %e, "request failed");
        }
        result
    }

    async fn execute(&self, op: Operation) -> CellFsResult<Reply> {
        let store = &self.store;
        match op {
            Operation::GetAttributes { path } => store.get_attributes(&path).await.map(Reply::Attributes),
            Operation::CreateDir { path, mode } => {
                store.create_dir_if_not_exist(&path, mode).await.map(done)
            }
            Operation::DirOrDie { path } => store.dir_or_die(&path).await.map(Reply::Path),
            Operation::RemoveDir { path, include_hidden } => {
                store.remove_dir(&path, include_hidden).await.map(done)
            }
            Operation::RemoveDirRecursive { path, include_hidden } => {
                store.remove_dir_recursive(&path, include_hidden).await.map(done)
            }
            Operation::ListDirs { path, include_hidden } => store
                .list_dirs_in_dir(&path, include_hidden)
                .await
                .map(Reply::Listing),
            Operation::ListFiles { path, include_hidden } => store
                .list_files_in_dir(&path, include_hidden)
                .await
                .map(Reply::Listing),
            Operation::ListAllRecursive { path, include_hidden } => store
                .list_all_recursive(&path, include_hidden)
                .await
                .map(Reply::Recursive),
            Operation::CreateFile { path, mode } => {
                store.create_file_if_not_exist(&path, mode).await.map(done)
            }
            Operation::FileOrDie { path } => store.file_or_die(&path).await.map(Reply::Path),
            Operation::RemoveFile { path, require_lock } => {
                store.remove_file(&path, require_lock).await.map(done)
            }
            Operation::RenameFile { old, new } => store.rename_file(&old, &new).await.map(done),
            Operation::Read { path } => store.read(&path).await.map(Reply::Data),
            Operation::ReadMultiple { paths } => {
                let mut results = ReadResults::new();
                for path in paths {
                    let outcome = store.read(&path).await;
                    results.insert(path, outcome);
                }
                Ok(Reply::DataMany(results))
            }
            Operation::Write { path, data, mode } => {
                store.write(&path, &data, mode, true).await.map(done)
            }
            Operation::WriteMultiple { files, mode } => {
                let mut results = WriteResults::new();
                for (path, data) in files {
                    let outcome = store.write(&path, &data, mode, true).await;
                    results.insert(path, outcome);
                }
                Ok(Reply::WrittenMany(results))
            }
            Operation::CopyFile { from, to } => store.copy_file(&from, &to).await.map(done),
            Operation::CrossCell(envelope) => {
                let call = envelope.validate()?;
                tracing::info!(
                    cell = %self.config.cell_name,
                    request_type = %envelope.request_type,
                    "executing cross-cell request"
                );
                let outcome = match call {
                    CrossCellCall::CopyFile { from, to } => self.router.copy_file(from, to).await,
                    CrossCellCall::MoveFile { from, to } => self.router.move_file(from, to).await,
                };
                outcome.map(done)
            }
            Operation::CheckHealth => store.health(&self.config.cell_name).await.map(Reply::Health),
        }
    }
}

fn done(_: ()) -> Reply {
    Reply::Done
}
