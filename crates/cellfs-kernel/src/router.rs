//! Dispatch router.
//!
//! Every public file operation takes caller paths, resolves them, and either
//! runs the matching [`FileStore`] primitive locally or sends one request to
//! the owning cell through a [`CellTransport`]. Batch operations split their
//! paths into one local group and at most one remote group; operations that
//! span two foreign cells travel inside a [`CrossCellEnvelope`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{CellConfig, CellContext, CellRegistry};
use crate::constants::DEFAULT_RPC_DEADLINE;
use crate::error::{CellFsError, CellFsResult};
use crate::resolver::{PathResolution, PathResolver, to_virtual_path};
use crate::store::{
    FileAttributes, FileStore, HealthReport, Listing, RecursiveListing, WriteMode,
};
use crate::wire::{
    CellRequest, CrossCellCall, CrossCellEnvelope, Operation, ReadResults, Reply, WriteResults,
};

/// Carries one request to a remote cell.
#[async_trait]
pub trait CellTransport: Send + Sync {
    /// Deliver `request` to `cell` and wait at most `deadline` for its reply.
    ///
    /// Fails `Timeout` past the deadline and `Internal` when the cell cannot
    /// be reached; errors raised by the remote cell come back unchanged.
    async fn call(
        &self,
        cell: &CellConfig,
        request: CellRequest,
        deadline: Duration,
    ) -> CellFsResult<Reply>;
}

/// Resolves paths and routes operations to the local store or a remote cell.
#[derive(Clone)]
pub struct Router {
    resolver: PathResolver,
    context: CellContext,
    local: FileStore,
    transport: Arc<dyn CellTransport>,
    deadline: Duration,
}

impl Router {
    pub fn new(
        registry: Arc<dyn CellRegistry>,
        context: CellContext,
        transport: Arc<dyn CellTransport>,
    ) -> Self {
        Self {
            resolver: PathResolver::new(registry),
            context,
            local: FileStore::unconfined(),
            transport,
            deadline: DEFAULT_RPC_DEADLINE,
        }
    }

    /// Deadline applied to each remote call.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Store used for local execution.
    pub fn with_local_store(mut self, store: FileStore) -> Self {
        self.local = store;
        self
    }

    pub fn context(&self) -> &CellContext {
        &self.context
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn local_store(&self) -> &FileStore {
        &self.local
    }

    /// Resolve a caller path from this router's context.
    pub fn resolve(&self, path: &str) -> CellFsResult<PathResolution> {
        self.resolver.resolve(&self.context, path)
    }

    /// Resolve a path that an operation is about to act on.
    fn target(&self, path: &str) -> CellFsResult<PathResolution> {
        let res = self.resolve(path)?;
        if res.is_shared {
            return Err(CellFsError::invalid_argument(format!(
                "{path} must be expanded per cell before use"
            )));
        }
        Ok(res)
    }

    async fn remote(&self, res: &PathResolution, op: Operation) -> CellFsResult<Reply> {
        let cfg = res.destination_config()?;
        self.send(cfg, op).await
    }

    async fn send(&self, cfg: &CellConfig, op: Operation) -> CellFsResult<Reply> {
        tracing::debug!(cell = %cfg.cell_name, op = op.name(), "remote call");
        let request = CellRequest {
            credential: cfg.credential.clone(),
            source_cell: self.context.cell().unwrap_or_default().to_string(),
            op,
        };
        self.transport.call(cfg, request, self.deadline).await
    }

    pub async fn create_dir_if_not_exist(&self, path: &str, mode: u32) -> CellFsResult<()> {
        let res = self.target(path)?;
        if res.is_remote {
            let op = Operation::CreateDir {
                path: res.physical_path.clone(),
                mode,
            };
            return self.remote(&res, op).await?.into_done();
        }
        self.local.create_dir_if_not_exist(&res.physical_path, mode).await
    }

    pub async fn dir_or_die(&self, path: &str) -> CellFsResult<PathBuf> {
        let res = self.target(path)?;
        if res.is_remote {
            let op = Operation::DirOrDie {
                path: res.physical_path.clone(),
            };
            return self.remote(&res, op).await?.into_path();
        }
        self.local.dir_or_die(&res.physical_path).await
    }

    pub async fn remove_dir(&self, path: &str, include_hidden: bool) -> CellFsResult<()> {
        let res = self.target(path)?;
        if res.is_remote {
            let op = Operation::RemoveDir {
                path: res.physical_path.clone(),
                include_hidden,
            };
            return self.remote(&res, op).await?.into_done();
        }
        self.local.remove_dir(&res.physical_path, include_hidden).await
    }

    pub async fn remove_dir_recursive(&self, path: &str, include_hidden: bool) -> CellFsResult<()> {
        let res = self.target(path)?;
        if res.is_remote {
            let op = Operation::RemoveDirRecursive {
                path: res.physical_path.clone(),
                include_hidden,
            };
            return self.remote(&res, op).await?.into_done();
        }
        self.local
            .remove_dir_recursive(&res.physical_path, include_hidden)
            .await
    }

    pub async fn list_dirs_in_dir(&self, path: &str, include_hidden: bool) -> CellFsResult<Listing> {
        let res = self.target(path)?;
        if res.is_remote {
            let op = Operation::ListDirs {
                path: res.physical_path.clone(),
                include_hidden,
            };
            return self.remote(&res, op).await?.into_listing();
        }
        self.local
            .list_dirs_in_dir(&res.physical_path, include_hidden)
            .await
    }

    pub async fn list_files_in_dir(&self, path: &str, include_hidden: bool) -> CellFsResult<Listing> {
        let res = self.target(path)?;
        if res.is_remote {
            let op = Operation::ListFiles {
                path: res.physical_path.clone(),
                include_hidden,
            };
            return self.remote(&res, op).await?.into_listing();
        }
        self.local
            .list_files_in_dir(&res.physical_path, include_hidden)
            .await
    }

    pub async fn list_all_recursive(
        &self,
        path: &str,
        include_hidden: bool,
    ) -> CellFsResult<RecursiveListing> {
        let res = self.target(path)?;
        if res.is_remote {
            let op = Operation::ListAllRecursive {
                path: res.physical_path.clone(),
                include_hidden,
            };
            return self.remote(&res, op).await?.into_recursive();
        }
        self.local
            .list_all_recursive(&res.physical_path, include_hidden)
            .await
    }

    pub async fn create_file_if_not_exist(&self, path: &str, mode: u32) -> CellFsResult<()> {
        let res = self.target(path)?;
        if res.is_remote {
            let op = Operation::CreateFile {
                path: res.physical_path.clone(),
                mode,
            };
            return self.remote(&res, op).await?.into_done();
        }
        self.local.create_file_if_not_exist(&res.physical_path, mode).await
    }

    pub async fn file_or_die(&self, path: &str) -> CellFsResult<PathBuf> {
        let res = self.target(path)?;
        if res.is_remote {
            let op = Operation::FileOrDie {
                path: res.physical_path.clone(),
            };
            return self.remote(&res, op).await?.into_path();
        }
        self.local.file_or_die(&res.physical_path).await
    }

    pub async fn remove_file(&self, path: &str, require_lock: bool) -> CellFsResult<()> {
        let res = self.target(path)?;
        self.remove_resolved(&res, require_lock).await
    }

    async fn remove_resolved(&self, res: &PathResolution, require_lock: bool) -> CellFsResult<()> {
        if res.is_remote {
            let op = Operation::RemoveFile {
                path: res.physical_path.clone(),
                require_lock,
            };
            return self.remote(res, op).await?.into_done();
        }
        self.local.remove_file(&res.physical_path, require_lock).await
    }

    /// Rename within one cell. Fails `PreconditionFailed` when the two names
    /// live in different cells.
    pub async fn rename_file(&self, old: &str, new: &str) -> CellFsResult<()> {
        let from = self.target(old)?;
        let to = self.target(new)?;
        match (from.is_remote, to.is_remote) {
            (false, false) => {
                self.local
                    .rename_file(&from.physical_path, &to.physical_path)
                    .await
            }
            (true, true) if from.destination_cell == to.destination_cell => {
                let op = Operation::RenameFile {
                    old: from.physical_path.clone(),
                    new: to.physical_path.clone(),
                };
                self.remote(&to, op).await?.into_done()
            }
            _ => Err(CellFsError::precondition_failed(format!(
                "cannot rename {old} to {new}: names live in different cells"
            ))),
        }
    }

    #[tracing::instrument(skip(self), name = "router.read")]
    pub async fn read(&self, path: &str) -> CellFsResult<Vec<u8>> {
        let res = self.target(path)?;
        self.read_resolved(&res).await
    }

    async fn read_resolved(&self, res: &PathResolution) -> CellFsResult<Vec<u8>> {
        if res.is_remote {
            let op = Operation::Read {
                path: res.physical_path.clone(),
            };
            return self.remote(res, op).await?.into_data();
        }
        self.local.read(&res.physical_path).await
    }

    #[tracing::instrument(skip(self, data), fields(bytes = data.len()), name = "router.write")]
    pub async fn write(&self, path: &str, data: &[u8], mode: WriteMode) -> CellFsResult<()> {
        let res = self.target(path)?;
        self.write_resolved(&res, data, mode).await
    }

    async fn write_resolved(
        &self,
        res: &PathResolution,
        data: &[u8],
        mode: WriteMode,
    ) -> CellFsResult<()> {
        if res.is_remote {
            let op = Operation::Write {
                path: res.physical_path.clone(),
                data: data.to_vec(),
                mode,
            };
            return self.remote(res, op).await?.into_done();
        }
        self.local.write(&res.physical_path, data, mode, true).await
    }

    pub async fn get_attributes(&self, path: &str) -> CellFsResult<FileAttributes> {
        let res = self.target(path)?;
        if res.is_remote {
            let op = Operation::GetAttributes {
                path: res.physical_path.clone(),
            };
            return self.remote(&res, op).await?.into_attributes();
        }
        self.local.get_attributes(&res.physical_path).await
    }

    /// Read many files, with one outcome per physical path.
    ///
    /// Paths may be local or belong to a single remote cell, which receives
    /// one batched request. A failed remote call marks each remote item with
    /// that error; local items are unaffected.
    #[tracing::instrument(skip(self, paths), fields(count = paths.len()), name = "router.read_multiple")]
    pub async fn read_multiple(&self, paths: &[&str]) -> CellFsResult<ReadResults> {
        let batch = self.partition(paths.iter().copied())?;
        let mut results = ReadResults::new();

        if let Some(remote) = &batch.remote {
            let op = Operation::ReadMultiple {
                paths: remote.paths.clone(),
            };
            match self.send(&remote.cell, op).await.and_then(Reply::into_data_many) {
                Ok(items) => results.extend(items),
                Err(e) => {
                    tracing::warn!(cell = %remote.cell.cell_name, error = %e, "batched read failed");
                    for path in &remote.paths {
                        results.insert(path.clone(), Err(e.clone()));
                    }
                }
            }
        }

        for path in batch.local {
            let outcome = self.local.read(&path).await;
            results.insert(path, outcome);
        }
        Ok(results)
    }

    /// Write many files; same grouping rules as [`read_multiple`](Self::read_multiple).
    #[tracing::instrument(skip(self, files), fields(count = files.len()), name = "router.write_multiple")]
    pub async fn write_multiple(
        &self,
        files: &BTreeMap<String, Vec<u8>>,
        mode: WriteMode,
    ) -> CellFsResult<WriteResults> {
        let batch = self.partition(files.keys().map(String::as_str))?;
        let mut results = WriteResults::new();

        if let Some(remote) = &batch.remote {
            let payload: BTreeMap<PathBuf, Vec<u8>> = remote
                .paths
                .iter()
                .cloned()
                .zip(remote.sources.iter().map(|src| files[src].clone()))
                .collect();
            let op = Operation::WriteMultiple {
                files: payload,
                mode,
            };
            match self.send(&remote.cell, op).await.and_then(Reply::into_written_many) {
                Ok(items) => results.extend(items),
                Err(e) => {
                    tracing::warn!(cell = %remote.cell.cell_name, error = %e, "batched write failed");
                    for path in &remote.paths {
                        results.insert(path.clone(), Err(e.clone()));
                    }
                }
            }
        }

        for (path, source) in batch.local.into_iter().zip(batch.local_sources) {
            let outcome = self.local.write(&path, &files[&source], mode, true).await;
            results.insert(path, outcome);
        }
        Ok(results)
    }

    /// Split caller paths into local and remote groups. Every path resolves
    /// before anything touches disk or network.
    fn partition<'a>(&self, paths: impl Iterator<Item = &'a str>) -> CellFsResult<Batch> {
        let mut batch = Batch::default();
        for raw in paths {
            let res = self.target(raw)?;
            if !res.is_remote {
                batch.local.push(res.physical_path);
                batch.local_sources.push(raw.to_string());
                continue;
            }
            let cfg = res.destination_config()?.clone();
            let group = batch.remote.get_or_insert_with(|| RemoteGroup {
                cell: cfg.clone(),
                paths: Vec::new(),
                sources: Vec::new(),
            });
            if group.cell.cell_name != cfg.cell_name {
                return Err(CellFsError::precondition_failed(format!(
                    "batch spans remote cells {} and {}",
                    group.cell.cell_name, cfg.cell_name
                )));
            }
            group.paths.push(res.physical_path);
            group.sources.push(raw.to_string());
        }

        if let Some(remote) = &batch.remote {
            if let Some(clash) = remote.paths.iter().find(|p| batch.local.contains(*p)) {
                return Err(CellFsError::precondition_failed(format!(
                    "{} names both a local and a remote file",
                    clash.display()
                )));
            }
        }
        Ok(batch)
    }

    /// Copy across any pair of cells.
    #[tracing::instrument(skip(self), name = "router.copy_file")]
    pub async fn copy_file(&self, from: &str, to: &str) -> CellFsResult<()> {
        let src = self.target(from)?;
        let dst = self.target(to)?;
        match (src.is_remote, dst.is_remote) {
            (false, false) => {
                self.local
                    .copy_file(&src.physical_path, &dst.physical_path)
                    .await
            }
            (false, true) | (true, false) => {
                let data = self.read_resolved(&src).await?;
                self.write_resolved(&dst, &data, WriteMode::Overwrite).await
            }
            (true, true) if src.destination_cell == dst.destination_cell => {
                let op = Operation::CopyFile {
                    from: src.physical_path.clone(),
                    to: dst.physical_path.clone(),
                };
                self.remote(&dst, op).await?.into_done()
            }
            (true, true) => {
                let call = CrossCellCall::CopyFile {
                    from: virtual_of(&src)?,
                    to: virtual_of(&dst)?,
                };
                self.cross_cell(&dst, call).await
            }
        }
    }

    /// Copy, then remove the source. A failed copy leaves the source alone;
    /// a failed removal is reported even though the copy exists.
    #[tracing::instrument(skip(self), name = "router.move_file")]
    pub async fn move_file(&self, from: &str, to: &str) -> CellFsResult<()> {
        let src = self.target(from)?;
        let dst = self.target(to)?;
        if src.is_remote && dst.is_remote && src.destination_cell != dst.destination_cell {
            let call = CrossCellCall::MoveFile {
                from: virtual_of(&src)?,
                to: virtual_of(&dst)?,
            };
            return self.cross_cell(&dst, call).await;
        }
        if !src.is_remote && !dst.is_remote {
            return self
                .local
                .move_file(&src.physical_path, &dst.physical_path)
                .await;
        }

        self.copy_file(from, to).await?;
        self.remove_resolved(&src, true).await.map_err(|e| {
            e.context(format!("copied {from} to {to} but could not remove the source"))
        })
    }

    async fn cross_cell(&self, dst: &PathResolution, call: CrossCellCall) -> CellFsResult<()> {
        let envelope = CrossCellEnvelope::new(call);
        tracing::debug!(
            cell = %dst.destination_cell,
            request_type = %envelope.request_type,
            "forwarding cross-cell request"
        );
        self.remote(dst, Operation::CrossCell(envelope))
            .await?
            .into_done()
    }

    /// Disk and memory usage of `cell`.
    pub async fn check_health(&self, cell: &str) -> CellFsResult<HealthReport> {
        let cfg = self.resolver.registry().lookup(cell)?;
        if self.context.cell() == Some(cell) {
            return FileStore::new(&cfg.physical_root).health(cell).await;
        }
        self.send(&cfg, Operation::CheckHealth).await?.into_health()
    }

    /// Names of every cell that is not disabled.
    pub fn list_cells(&self) -> Vec<String> {
        self.resolver.registry().active_cell_names()
    }
}

#[derive(Default)]
struct Batch {
    local: Vec<PathBuf>,
    local_sources: Vec<String>,
    remote: Option<RemoteGroup>,
}

struct RemoteGroup {
    cell: CellConfig,
    paths: Vec<PathBuf>,
    sources: Vec<String>,
}

/// Cell-qualified form of a resolved remote path.
fn virtual_of(res: &PathResolution) -> CellFsResult<String> {
    Ok(to_virtual_path(&res.physical_path, res.destination_config()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticRegistry;
    use parking_lot::Mutex;
    use std::path::Path;
    use tempfile::TempDir;

    type Responder = Box<dyn Fn(&CellConfig, &CellRequest) -> CellFsResult<Reply> + Send + Sync>;

    struct RecordingTransport {
        calls: Mutex<Vec<(String, CellRequest)>>,
        respond: Responder,
    }

    impl RecordingTransport {
        fn new(respond: Responder) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond,
            })
        }

        fn ok() -> Arc<Self> {
            Self::new(Box::new(|_, req| {
                Ok(match &req.op {
                    Operation::Read { .. } => Reply::Data(b"remote".to_vec()),
                    Operation::ReadMultiple { paths } => Reply::DataMany(
                        paths.iter().map(|p| (p.clone(), Ok(b"remote".to_vec()))).collect(),
                    ),
                    Operation::WriteMultiple { files, .. } => {
                        Reply::WrittenMany(files.keys().map(|p| (p.clone(), Ok(()))).collect())
                    }
                    _ => Reply::Done,
                })
            }))
        }

        fn calls(&self) -> Vec<(String, CellRequest)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CellTransport for RecordingTransport {
        async fn call(
            &self,
            cell: &CellConfig,
            request: CellRequest,
            _deadline: Duration,
        ) -> CellFsResult<Reply> {
            let reply = (self.respond)(cell, &request);
            self.calls.lock().push((cell.cell_name.clone(), request));
            reply
        }
    }

    struct Fixture {
        router: Router,
        transport: Arc<RecordingTransport>,
        root: TempDir,
    }

    fn fixture_with(transport: Arc<RecordingTransport>) -> Fixture {
        let root = TempDir::new().unwrap();
        let registry = StaticRegistry::from_cells([
            CellConfig::new("aa", root.path(), "127.0.0.1:7001", "pw-aa"),
            CellConfig::new("bb", "/data/bb", "127.0.0.1:7002", "pw-bb"),
            CellConfig::new("cc", "/data/cc", "127.0.0.1:7003", "pw-cc"),
        ]);
        let router = Router::new(
            Arc::new(registry),
            CellContext::in_cell("aa"),
            transport.clone(),
        );
        Fixture {
            router,
            transport,
            root,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingTransport::ok())
    }

    #[tokio::test]
    async fn local_paths_never_touch_the_transport() {
        let f = fixture();
        f.router.write("/LOCAL/a/x.txt", b"hi", WriteMode::Overwrite).await.unwrap();
        assert_eq!(f.router.read("/galaxy/aa-d/a/x.txt").await.unwrap(), b"hi");
        assert!(f.root.path().join("a/x.txt").is_file());
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn remote_write_carries_destination_credential_and_physical_path() {
        let f = fixture();
        f.router
            .write("/galaxy/bb-d/y.txt", b"data", WriteMode::Append)
            .await
            .unwrap();
        let calls = f.transport.calls();
        assert_eq!(calls.len(), 1);
        let (cell, req) = &calls[0];
        assert_eq!(cell, "bb");
        assert_eq!(req.credential, "pw-bb");
        assert_eq!(req.source_cell, "aa");
        assert_eq!(
            req.op,
            Operation::Write {
                path: PathBuf::from("/data/bb/y.txt"),
                data: b"data".to_vec(),
                mode: WriteMode::Append,
            }
        );
    }

    #[tokio::test]
    async fn batch_write_sends_one_remote_request() {
        let f = fixture();
        let mut files = BTreeMap::new();
        files.insert("/LOCAL/x".to_string(), b"A".to_vec());
        files.insert("/galaxy/bb-d/y".to_string(), b"B".to_vec());
        files.insert("/galaxy/bb-d/z".to_string(), b"C".to_vec());

        let results = f.router.write_multiple(&files, WriteMode::Overwrite).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| r.is_ok()));
        assert_eq!(std::fs::read(f.root.path().join("x")).unwrap(), b"A");

        let calls = f.transport.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0].1.op {
            Operation::WriteMultiple { files, .. } => {
                assert_eq!(files[Path::new("/data/bb/y")], b"B");
                assert_eq!(files[Path::new("/data/bb/z")], b"C");
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[tokio::test]
    async fn batch_read_merges_local_and_remote() {
        let f = fixture();
        std::fs::write(f.root.path().join("l"), b"local").unwrap();
        let results = f
            .router
            .read_multiple(&["/LOCAL/l", "/galaxy/bb-d/r", "/LOCAL/missing"])
            .await
            .unwrap();
        assert_eq!(results[&f.root.path().join("l")].as_deref().unwrap(), b"local");
        assert_eq!(results[Path::new("/data/bb/r")].as_deref().unwrap(), b"remote");
        assert!(matches!(
            results[&f.root.path().join("missing")],
            Err(CellFsError::NotFound(_))
        ));
        assert_eq!(f.transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn batch_spanning_two_remote_cells_is_rejected_up_front() {
        let f = fixture();
        let err = f
            .router
            .read_multiple(&["/galaxy/bb-d/r", "/galaxy/cc-d/r"])
            .await
            .unwrap_err();
        assert!(matches!(err, CellFsError::PreconditionFailed(_)));
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_batch_path_fails_before_any_write() {
        let f = fixture();
        let mut files = BTreeMap::new();
        files.insert("/LOCAL/x".to_string(), b"A".to_vec());
        files.insert("/galaxy/nope-d/y".to_string(), b"B".to_vec());
        let err = f.router.write_multiple(&files, WriteMode::Overwrite).await.unwrap_err();
        assert!(matches!(err, CellFsError::ConfigNotFound(_)));
        assert!(!f.root.path().join("x").exists());
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_remote_batch_marks_only_remote_items() {
        let f = fixture_with(RecordingTransport::new(Box::new(|_, _| {
            Err(CellFsError::timeout("deadline exceeded"))
        })));
        std::fs::write(f.root.path().join("l"), b"local").unwrap();
        let results = f
            .router
            .read_multiple(&["/LOCAL/l", "/galaxy/bb-d/r"])
            .await
            .unwrap();
        assert!(results[&f.root.path().join("l")].is_ok());
        assert!(matches!(
            results[Path::new("/data/bb/r")],
            Err(CellFsError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn remote_permission_denied_is_surfaced_once() {
        let f = fixture_with(RecordingTransport::new(Box::new(|_, _| {
            Err(CellFsError::permission_denied("wrong credential"))
        })));
        let err = f.router.read("/galaxy/bb-d/r").await.unwrap_err();
        assert!(matches!(err, CellFsError::PermissionDenied(_)));
        assert_eq!(f.transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn rename_across_cells_is_precondition_failed() {
        let f = fixture();
        std::fs::write(f.root.path().join("a"), b"").unwrap();
        for (old, new) in [
            ("/LOCAL/a", "/galaxy/bb-d/a"),
            ("/galaxy/bb-d/a", "/galaxy/cc-d/a"),
        ] {
            let err = f.router.rename_file(old, new).await.unwrap_err();
            assert!(matches!(err, CellFsError::PreconditionFailed(_)));
        }
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn rename_inside_one_remote_cell_is_forwarded() {
        let f = fixture();
        f.router
            .rename_file("/galaxy/bb-d/a", "/galaxy/bb-d/b")
            .await
            .unwrap();
        let calls = f.transport.calls();
        assert_eq!(
            calls[0].1.op,
            Operation::RenameFile {
                old: PathBuf::from("/data/bb/a"),
                new: PathBuf::from("/data/bb/b"),
            }
        );
    }

    #[tokio::test]
    async fn copy_between_two_foreign_cells_uses_envelope() {
        let f = fixture();
        f.router
            .copy_file("/galaxy/bb-d/src", "/galaxy/cc-d/dst")
            .await
            .unwrap();
        let calls = f.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "cc");
        assert_eq!(calls[0].1.credential, "pw-cc");
        match &calls[0].1.op {
            Operation::CrossCell(env) => {
                assert_eq!(env.request_type, "COPYFILE");
                assert_eq!(
                    env.inner,
                    CrossCellCall::CopyFile {
                        from: "/galaxy/bb-d/src".into(),
                        to: "/galaxy/cc-d/dst".into(),
                    }
                );
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[tokio::test]
    async fn copy_within_one_foreign_cell_stays_there() {
        let f = fixture();
        f.router
            .copy_file("/galaxy/bb-d/src", "/galaxy/bb-d/dst")
            .await
            .unwrap();
        assert_eq!(
            f.transport.calls()[0].1.op,
            Operation::CopyFile {
                from: PathBuf::from("/data/bb/src"),
                to: PathBuf::from("/data/bb/dst"),
            }
        );
    }

    #[tokio::test]
    async fn move_local_to_remote_removes_source_after_upload() {
        let f = fixture();
        std::fs::write(f.root.path().join("m"), b"moving").unwrap();
        f.router.move_file("/LOCAL/m", "/galaxy/bb-d/m").await.unwrap();
        assert!(!f.root.path().join("m").exists());
        let calls = f.transport.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0].1.op, Operation::Write { data, .. } if data == b"moving"));
    }

    #[tokio::test]
    async fn move_keeps_source_when_upload_fails() {
        let f = fixture_with(RecordingTransport::new(Box::new(|_, _| {
            Err(CellFsError::internal("connection refused"))
        })));
        std::fs::write(f.root.path().join("m"), b"moving").unwrap();
        assert!(f.router.move_file("/LOCAL/m", "/galaxy/bb-d/m").await.is_err());
        assert!(f.root.path().join("m").exists());
    }

    #[tokio::test]
    async fn move_remote_to_local_downloads_then_deletes_remote() {
        let f = fixture();
        f.router.move_file("/galaxy/bb-d/r", "/LOCAL/got").await.unwrap();
        assert_eq!(std::fs::read(f.root.path().join("got")).unwrap(), b"remote");
        let ops: Vec<_> = f.transport.calls().into_iter().map(|(_, r)| r.op).collect();
        assert!(matches!(ops[0], Operation::Read { .. }));
        assert_eq!(
            ops[1],
            Operation::RemoveFile {
                path: PathBuf::from("/data/bb/r"),
                require_lock: true,
            }
        );
    }

    #[tokio::test]
    async fn move_reports_a_source_that_could_not_be_removed() {
        let f = fixture_with(RecordingTransport::new(Box::new(|_, req| match &req.op {
            Operation::Read { .. } => Ok(Reply::Data(b"remote".to_vec())),
            Operation::RemoveFile { .. } => Err(CellFsError::permission_denied("read-only")),
            _ => Ok(Reply::Done),
        })));
        let err = f.router.move_file("/galaxy/bb-d/r", "/LOCAL/got").await.unwrap_err();
        assert!(matches!(err, CellFsError::PermissionDenied(_)));
        assert!(err.to_string().contains("could not remove the source"));
        assert_eq!(std::fs::read(f.root.path().join("got")).unwrap(), b"remote");

        let ops: Vec<_> = f.transport.calls().into_iter().map(|(_, r)| r.op).collect();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[1], Operation::RemoveFile { .. }));
    }

    #[tokio::test]
    async fn shared_paths_must_be_expanded_first() {
        let f = fixture();
        let err = f.router.read("/SHARED/x").await.unwrap_err();
        assert!(matches!(err, CellFsError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn health_of_own_cell_is_local() {
        let f = fixture();
        let report = f.router.check_health("aa").await.unwrap();
        assert_eq!(report.cell, "aa");
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn list_cells_reports_active_cells() {
        let f = fixture();
        assert_eq!(f.router.list_cells(), vec!["aa", "bb", "cc"]);
    }
}
