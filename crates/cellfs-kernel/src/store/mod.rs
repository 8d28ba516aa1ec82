//! Lock-protected file store.
//!
//! Primitive operations against the physical filesystem. Reads, writes,
//! renames and removals of a file hold that file's advisory lock (see
//! [`lock`]) for their whole duration, so two cooperating writers never
//! interleave.
//!
//! A store is rooted. Relative paths are joined under the root; absolute
//! paths must already lie under it. `..` components are rejected outright.

pub mod lock;
pub mod types;

use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::constants::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use crate::error::{CellFsError, CellFsResult};

pub use lock::{LockGuard, LockLease, LockOptions};
pub use types::{FileAttributes, FileType, HealthReport, Listing, RecursiveListing, WriteMode};

const MIB: f64 = 1024.0 * 1024.0;

/// Filesystem access with per-file advisory locking.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    lock: LockOptions,
}

impl FileStore {
    /// Store confined to `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: LockOptions::default(),
        }
    }

    /// Store over the whole filesystem, for paths already made physical.
    pub fn unconfined() -> Self {
        Self::new("/")
    }

    pub fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock
    }

    /// Map a caller path onto the filesystem, refusing to leave the root.
    pub fn resolve(&self, path: &Path) -> CellFsResult<PathBuf> {
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(CellFsError::invalid_argument(format!(
                "{} contains '..'",
                path.display()
            )));
        }
        if path.is_absolute() {
            if !path.starts_with(&self.root) {
                return Err(CellFsError::invalid_argument(format!(
                    "{} is not under {}",
                    path.display(),
                    self.root.display()
                )));
            }
            return Ok(path.to_path_buf());
        }
        if path.as_os_str().is_empty() {
            return Ok(self.root.clone());
        }
        Ok(self.root.join(path))
    }

    /// Hold the lock guarding `path` until the guard drops.
    pub async fn lock(&self, path: &Path) -> CellFsResult<LockGuard> {
        let full = self.resolve(path)?;
        lock::acquire(&full, &self.lock).await
    }

    /// Create `path` and any missing parents. Succeeds if it already is a
    /// directory.
    pub async fn create_dir_if_not_exist(&self, path: &Path, mode: u32) -> CellFsResult<()> {
        let full = self.resolve(path)?;
        create_dir_all(&full, mode).await
    }

    /// Canonical path of an existing directory, `NotFound` otherwise.
    pub async fn dir_or_die(&self, path: &Path) -> CellFsResult<PathBuf> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| CellFsError::io(&full, e))?;
        if !meta.is_dir() {
            return Err(CellFsError::not_found(format!(
                "{} is not a directory",
                full.display()
            )));
        }
        dunce::canonicalize(&full).map_err(|e| CellFsError::io(&full, e))
    }

    /// Canonical path of an existing regular file, `NotFound` otherwise.
    pub async fn file_or_die(&self, path: &Path) -> CellFsResult<PathBuf> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| CellFsError::io(&full, e))?;
        if !meta.is_file() {
            return Err(CellFsError::not_found(format!(
                "{} is not a regular file",
                full.display()
            )));
        }
        dunce::canonicalize(&full).map_err(|e| CellFsError::io(&full, e))
    }

    /// Subdirectories of `path`, keyed by full path.
    pub async fn list_dirs_in_dir(&self, path: &Path, include_hidden: bool) -> CellFsResult<Listing> {
        let full = self.existing_dir(path).await?;
        Ok(scan_dir(&full, include_hidden).await?.0)
    }

    /// Regular files in `path`, keyed by full path.
    pub async fn list_files_in_dir(&self, path: &Path, include_hidden: bool) -> CellFsResult<Listing> {
        let full = self.existing_dir(path).await?;
        Ok(scan_dir(&full, include_hidden).await?.1)
    }

    /// Every directory and file below `path`.
    pub async fn list_all_recursive(
        &self,
        path: &Path,
        include_hidden: bool,
    ) -> CellFsResult<RecursiveListing> {
        let full = self.existing_dir(path).await?;
        let mut out = RecursiveListing::default();
        let mut pending = vec![full];
        while let Some(dir) = pending.pop() {
            let (dirs, files) = scan_dir(&dir, include_hidden).await?;
            pending.extend(dirs.keys().cloned());
            out.dirs.extend(dirs);
            out.files.extend(files);
        }
        Ok(out)
    }

    /// Remove the files directly inside `path`, each under its own lock, then
    /// the directory itself.
    ///
    /// Fails `PreconditionFailed` without touching anything when `path` has
    /// subdirectories. Hidden files stay unless `include_hidden`, which then
    /// keeps the directory from being removed.
    pub async fn remove_dir(&self, path: &Path, include_hidden: bool) -> CellFsResult<()> {
        let full = self.existing_dir(path).await?;
        self.remove_dir_at(&full, include_hidden).await
    }

    /// Depth-first [`remove_dir`](Self::remove_dir) over the whole subtree.
    pub async fn remove_dir_recursive(&self, path: &Path, include_hidden: bool) -> CellFsResult<()> {
        let full = self.existing_dir(path).await?;
        self.remove_tree(full, include_hidden).await
    }

    /// Create an empty file (and its parents) unless it exists.
    pub async fn create_file_if_not_exist(&self, path: &Path, mode: u32) -> CellFsResult<()> {
        let full = self.resolve(path)?;
        create_parent(&full).await?;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .mode(mode)
            .open(&full)
            .await
            .map_err(|e| CellFsError::io(&full, e))?;
        Ok(())
    }

    /// Remove one file. `require_lock = false` skips the lock, for callers
    /// that already hold it.
    pub async fn remove_file(&self, path: &Path, require_lock: bool) -> CellFsResult<()> {
        let full = self.resolve(path)?;
        let guard = if require_lock {
            Some(lock::acquire(&full, &self.lock).await?)
        } else {
            None
        };
        remove_file_unlocked(&full).await?;
        tracing::debug!(path = %full.display(), "removed file");
        release(guard).await
    }

    /// Rename under the locks of both names. Parents of `new` are created.
    pub async fn rename_file(&self, old: &Path, new: &Path) -> CellFsResult<()> {
        let old_full = self.resolve(old)?;
        let new_full = self.resolve(new)?;
        if old_full == new_full {
            return Err(CellFsError::invalid_argument(format!(
                "cannot rename {} onto itself",
                old_full.display()
            )));
        }
        create_parent(&new_full).await?;

        let (first, second) = self.lock_pair(&old_full, &new_full).await?;
        let meta = fs::metadata(&old_full)
            .await
            .map_err(|e| CellFsError::io(&old_full, e))?;
        if !meta.is_file() {
            return Err(CellFsError::not_found(format!(
                "{} is not a regular file",
                old_full.display()
            )));
        }
        fs::rename(&old_full, &new_full)
            .await
            .map_err(|e| CellFsError::io(&old_full, e))?;
        tracing::debug!(from = %old_full.display(), to = %new_full.display(), "renamed file");
        second.release().await?;
        first.release().await
    }

    /// Whole content of a file, read under its lock.
    pub async fn read(&self, path: &Path) -> CellFsResult<Vec<u8>> {
        let full = self.resolve(path)?;
        let guard = lock::acquire(&full, &self.lock).await?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| CellFsError::io(&full, e))?;
        if !meta.is_file() {
            return Err(CellFsError::not_found(format!(
                "{} is not a regular file",
                full.display()
            )));
        }
        let data = fs::read(&full).await.map_err(|e| CellFsError::io(&full, e))?;
        guard.release().await?;
        Ok(data)
    }

    /// Write `data`, creating the file and its parents when absent.
    pub async fn write(
        &self,
        path: &Path,
        data: &[u8],
        mode: WriteMode,
        require_lock: bool,
    ) -> CellFsResult<()> {
        let full = self.resolve(path)?;
        create_parent(&full).await?;
        let guard = if require_lock {
            Some(lock::acquire(&full, &self.lock).await?)
        } else {
            None
        };
        write_unlocked(&full, data, mode).await?;
        tracing::debug!(path = %full.display(), bytes = data.len(), %mode, "wrote file");
        release(guard).await
    }

    /// `stat` of `path`, following symlinks.
    pub async fn get_attributes(&self, path: &Path) -> CellFsResult<FileAttributes> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| CellFsError::io(&full, e))?;
        Ok(metadata_to_attributes(&meta))
    }

    /// Copy content from `from` to `to`, each under its own lock.
    pub async fn copy_file(&self, from: &Path, to: &Path) -> CellFsResult<()> {
        let from_full = self.resolve(from)?;
        let to_full = self.resolve(to)?;
        if from_full == to_full {
            return Err(CellFsError::invalid_argument(format!(
                "cannot copy {} onto itself",
                from_full.display()
            )));
        }
        let data = self.read(&from_full).await?;
        self.write(&to_full, &data, WriteMode::Overwrite, true).await
    }

    /// Copy then remove the source. The source stays when the copy fails.
    pub async fn move_file(&self, from: &Path, to: &Path) -> CellFsResult<()> {
        self.copy_file(from, to).await?;
        self.remove_file(from, true).await.map_err(|e| {
            e.context(format!(
                "copied {} to {} but could not remove the source",
                from.display(),
                to.display()
            ))
        })
    }

    /// Disk usage of the root's filesystem and host memory usage.
    pub async fn health(&self, cell: &str) -> CellFsResult<HealthReport> {
        let (total_disk_mb, used_disk_mb) = disk_usage_mb(&self.root)?;
        let (total_ram_mb, used_ram_mb) = ram_usage_mb().await?;
        Ok(HealthReport {
            cell: cell.to_string(),
            healthy: true,
            timestamp_ms: lock::now_ms(),
            total_disk_mb,
            used_disk_mb,
            total_ram_mb,
            used_ram_mb,
        })
    }

    async fn existing_dir(&self, path: &Path) -> CellFsResult<PathBuf> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| CellFsError::io(&full, e))?;
        if !meta.is_dir() {
            return Err(CellFsError::not_found(format!(
                "{} is not a directory",
                full.display()
            )));
        }
        Ok(full)
    }

    async fn lock_pair(&self, a: &Path, b: &Path) -> CellFsResult<(LockGuard, LockGuard)> {
        // Fixed order so two opposite renames cannot deadlock.
        let (first, second) = if lock::lock_marker_path(a)? <= lock::lock_marker_path(b)? {
            (a, b)
        } else {
            (b, a)
        };
        let first = lock::acquire(first, &self.lock).await?;
        let second = lock::acquire(second, &self.lock).await?;
        Ok((first, second))
    }

    async fn remove_dir_at(&self, dir: &Path, include_hidden: bool) -> CellFsResult<()> {
        let (dirs, files) = scan_dir(dir, true).await?;
        if let Some(sub) = dirs.keys().next() {
            return Err(CellFsError::precondition_failed(format!(
                "{} still contains directory {}",
                dir.display(),
                sub.display()
            )));
        }

        for file in files.keys() {
            let name = file_name(file);
            if lock::is_lock_marker(&name) || (!include_hidden && name.starts_with('.')) {
                continue;
            }
            let guard = lock::acquire(file, &self.lock).await?;
            remove_file_unlocked(file).await?;
            guard.release().await?;
        }

        lock::sweep_expired_locks(dir, &self.lock).await?;
        fs::remove_dir(dir)
            .await
            .map_err(|e| CellFsError::io(dir, e))?;
        tracing::debug!(path = %dir.display(), "removed directory");
        Ok(())
    }

    fn remove_tree(&self, dir: PathBuf, include_hidden: bool) -> BoxFuture<'_, CellFsResult<()>> {
        async move {
            let (dirs, _) = scan_dir(&dir, include_hidden).await?;
            for sub in dirs.into_keys() {
                self.remove_tree(sub, include_hidden).await?;
            }
            self.remove_dir_at(&dir, include_hidden).await
        }
        .boxed()
    }
}

async fn release(guard: Option<LockGuard>) -> CellFsResult<()> {
    match guard {
        Some(guard) => guard.release().await,
        None => Ok(()),
    }
}

async fn create_dir_all(full: &Path, mode: u32) -> CellFsResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(mode);
    builder
        .create(full)
        .await
        .map_err(|e| CellFsError::io(full, e))
}

async fn create_parent(full: &Path) -> CellFsResult<()> {
    match full.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => create_dir_all(parent, DEFAULT_DIR_MODE).await,
        _ => Ok(()),
    }
}

async fn remove_file_unlocked(full: &Path) -> CellFsResult<()> {
    let meta = fs::symlink_metadata(full)
        .await
        .map_err(|e| CellFsError::io(full, e))?;
    if meta.is_dir() {
        return Err(CellFsError::invalid_argument(format!(
            "{} is a directory",
            full.display()
        )));
    }
    fs::remove_file(full)
        .await
        .map_err(|e| CellFsError::io(full, e))
}

async fn write_unlocked(full: &Path, data: &[u8], mode: WriteMode) -> CellFsResult<()> {
    let mut options = fs::OpenOptions::new();
    options.create(true).mode(DEFAULT_FILE_MODE);
    match mode {
        WriteMode::Overwrite => options.write(true).truncate(true),
        WriteMode::Append => options.append(true),
    };
    let mut file = options
        .open(full)
        .await
        .map_err(|e| CellFsError::io(full, e))?;
    file.write_all(data)
        .await
        .map_err(|e| CellFsError::io(full, e))?;
    file.flush().await.map_err(|e| CellFsError::io(full, e))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// One level of `dir`, split into (directories, regular files).
async fn scan_dir(dir: &Path, include_hidden: bool) -> CellFsResult<(Listing, Listing)> {
    let mut dirs = Listing::new();
    let mut files = Listing::new();
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| CellFsError::io(dir, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CellFsError::io(dir, e))?
    {
        let path = entry.path();
        if !include_hidden && file_name(&path).starts_with('.') {
            continue;
        }
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "skipping dangling entry");
                continue;
            }
            Err(e) => return Err(CellFsError::io(&path, e)),
        };
        if meta.is_dir() {
            dirs.insert(path, metadata_to_attributes(&meta));
        } else if meta.is_file() {
            files.insert(path, metadata_to_attributes(&meta));
        }
    }
    Ok((dirs, files))
}

fn metadata_to_attributes(meta: &std::fs::Metadata) -> FileAttributes {
    let file_type = meta.file_type();
    let kind = if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_file() {
        FileType::File
    } else {
        FileType::Other
    };

    FileAttributes {
        kind,
        dev: meta.dev(),
        ino: meta.ino(),
        mode: meta.mode(),
        nlink: meta.nlink(),
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev(),
        size: meta.size(),
        blksize: meta.blksize(),
        blocks: meta.blocks(),
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
    }
}

/// Modification time as a `SystemTime`.
pub fn modified_time(attrs: &FileAttributes) -> SystemTime {
    let secs = attrs.mtime.max(0) as u64;
    SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs)
}

fn disk_usage_mb(root: &Path) -> CellFsResult<(f64, f64)> {
    let stat = rustix::fs::statvfs(root)
        .map_err(|e| CellFsError::io(root, std::io::Error::from(e)))?;
    let frsize = stat.f_frsize as f64;
    let total = stat.f_blocks as f64 * frsize / MIB;
    let free = stat.f_bfree as f64 * frsize / MIB;
    Ok((total, total - free))
}

async fn ram_usage_mb() -> CellFsResult<(f64, f64)> {
    let path = Path::new("/proc/meminfo");
    let meminfo = fs::read_to_string(path)
        .await
        .map_err(|e| CellFsError::io(path, e))?;
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|kb| kb.parse::<f64>().ok())
    };
    let (Some(total_kb), Some(free_kb)) = (field("MemTotal"), field("MemFree")) else {
        return Err(CellFsError::internal("cannot parse /proc/meminfo"));
    };
    let total = total_kb / 1024.0;
    Ok((total, total - free_kb / 1024.0))
}
