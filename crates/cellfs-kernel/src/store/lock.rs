//! Advisory per-file locks.
//!
//! The lock for `dir/name` is the marker file `dir/.name.lock`, created with
//! `O_CREAT | O_EXCL`. The marker holds a JSON [`LockLease`] naming its owner
//! and when the lease runs out. Contenders retry until the marker is gone,
//! reclaim it once its lease has expired, and give up after the acquire
//! timeout.
//!
//! Locks are cooperative: only code that goes through [`acquire`] honours
//! them.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::constants::{
    DEFAULT_LOCK_ACQUIRE_TIMEOUT, DEFAULT_LOCK_LEASE, LOCK_RETRY_INTERVAL, LOCK_SUFFIX,
};
use crate::error::{CellFsError, CellFsResult};

/// Contents of a lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    /// Random token identifying one acquisition.
    pub owner: String,
    pub pid: u32,
    pub host: String,
    pub acquired_at_ms: u64,
    pub lease_ms: u64,
}

impl LockLease {
    fn fresh(lease: Duration) -> Self {
        Self {
            owner: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            host: host_name().to_string(),
            acquired_at_ms: now_ms(),
            lease_ms: lease.as_millis() as u64,
        }
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.acquired_at_ms.saturating_add(self.lease_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms()
    }
}

/// Tuning for [`acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Lease written into markers this process creates. Also the assumed
    /// lease of a marker whose contents cannot be read.
    pub lease: Duration,
    /// `None` waits until the marker disappears or expires.
    pub acquire_timeout: Option<Duration>,
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LOCK_LEASE,
            acquire_timeout: Some(DEFAULT_LOCK_ACQUIRE_TIMEOUT),
            retry_interval: LOCK_RETRY_INTERVAL,
        }
    }
}

/// Marker path guarding `path`: `/home/test` → `/home/.test.lock`.
///
/// Fails `InvalidArgument` when `path` has no final file name.
pub fn lock_marker_path(path: &Path) -> CellFsResult<PathBuf> {
    let raw = path.to_string_lossy();
    if raw.is_empty() || raw.ends_with('/') {
        return Err(CellFsError::invalid_argument(format!(
            "cannot lock {raw:?}: no file name"
        )));
    }
    let name = path.file_name().ok_or_else(|| {
        CellFsError::invalid_argument(format!("cannot lock {raw:?}: no file name"))
    })?;
    let marker = format!(".{}{}", name.to_string_lossy(), LOCK_SUFFIX);
    Ok(match path.parent() {
        Some(parent) => parent.join(marker),
        None => PathBuf::from(marker),
    })
}

/// Whether a directory entry name looks like a lock marker.
pub fn is_lock_marker(name: &str) -> bool {
    name.len() > 1 + LOCK_SUFFIX.len() && name.starts_with('.') && name.ends_with(LOCK_SUFFIX)
}

/// Held lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    marker: PathBuf,
    owner: String,
    released: bool,
}

impl LockGuard {
    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Release now, reporting failure. Releasing twice is a no-op.
    pub async fn release(mut self) -> CellFsResult<()> {
        if std::mem::replace(&mut self.released, true) {
            return Ok(());
        }
        if !self.still_ours(tokio::fs::read(&self.marker).await)? {
            return Ok(());
        }
        self.removed(tokio::fs::remove_file(&self.marker).await)
    }

    /// Blocking release for `Drop`, which cannot await.
    fn release_blocking(&mut self) -> CellFsResult<()> {
        if std::mem::replace(&mut self.released, true) {
            return Ok(());
        }
        if !self.still_ours(std::fs::read(&self.marker))? {
            return Ok(());
        }
        self.removed(std::fs::remove_file(&self.marker))
    }

    /// Whether the marker still carries this guard's lease.
    fn still_ours(&self, read: std::io::Result<Vec<u8>>) -> CellFsResult<bool> {
        match read {
            Ok(bytes) => match serde_json::from_slice::<LockLease>(&bytes) {
                Ok(lease) if lease.owner == self.owner => Ok(true),
                Ok(lease) => {
                    tracing::warn!(
                        marker = %self.marker.display(),
                        holder = %lease.owner,
                        "lock was reclaimed by another owner, leaving it in place"
                    );
                    Ok(false)
                }
                Err(_) => {
                    tracing::warn!(
                        marker = %self.marker.display(),
                        "lock marker no longer holds our lease, leaving it in place"
                    );
                    Ok(false)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(marker = %self.marker.display(), "lock marker already removed");
                Ok(false)
            }
            Err(e) => Err(CellFsError::io(&self.marker, e)),
        }
    }

    fn removed(&self, result: std::io::Result<()>) -> CellFsResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(marker = %self.marker.display(), "lock marker already removed");
                Ok(())
            }
            Err(e) => Err(CellFsError::io(&self.marker, e)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_blocking() {
            tracing::error!(marker = %self.marker.display(), error = %e, "failed to release lock");
        }
    }
}

/// Acquire the lock guarding `path`.
///
/// The directory holding `path` must exist; otherwise this fails `NotFound`.
#[tracing::instrument(level = "trace", skip_all, fields(path = %path.display()))]
pub async fn acquire(path: &Path, opts: &LockOptions) -> CellFsResult<LockGuard> {
    let marker = lock_marker_path(path)?;
    let started = Instant::now();

    loop {
        let lease = LockLease::fresh(opts.lease);
        match create_marker(&marker, &lease).await {
            Ok(()) => {
                return Ok(LockGuard {
                    marker,
                    owner: lease.owner,
                    released: false,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if reclaim_if_expired(&marker, opts.lease).await? {
                    continue;
                }
            }
            Err(e) => return Err(CellFsError::io(&marker, e)),
        }

        if let Some(timeout) = opts.acquire_timeout {
            if started.elapsed() >= timeout {
                return Err(CellFsError::timeout(format!(
                    "lock {} still held after {:?}",
                    marker.display(),
                    timeout
                )));
            }
        }
        tokio::time::sleep(opts.retry_interval).await;
    }
}

async fn create_marker(marker: &Path, lease: &LockLease) -> std::io::Result<()> {
    let body = serde_json::to_vec(lease).map_err(std::io::Error::other)?;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(marker)
        .await?;
    let written = async {
        file.write_all(&body).await?;
        file.flush().await
    }
    .await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(marker).await;
        return Err(e);
    }
    Ok(())
}

/// What a marker on disk says about its holder.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MarkerState {
    Lease(LockLease),
    /// Empty or partially written marker; aged by its mtime.
    Unreadable { modified_ms: u64 },
}

impl MarkerState {
    fn is_expired(&self, now_ms: u64, fallback_lease: Duration) -> bool {
        match self {
            MarkerState::Lease(lease) => lease.is_expired(now_ms),
            MarkerState::Unreadable { modified_ms } => {
                now_ms >= modified_ms.saturating_add(fallback_lease.as_millis() as u64)
            }
        }
    }
}

async fn inspect_marker(marker: &Path) -> std::io::Result<MarkerState> {
    let bytes = tokio::fs::read(marker).await?;
    if let Ok(lease) = serde_json::from_slice::<LockLease>(&bytes) {
        return Ok(MarkerState::Lease(lease));
    }
    let modified = tokio::fs::metadata(marker).await?.modified()?;
    Ok(MarkerState::Unreadable {
        modified_ms: system_time_ms(modified),
    })
}

/// Remove `marker` if its lease ran out. Returns true when the caller should
/// retry creation immediately.
async fn reclaim_if_expired(marker: &Path, fallback_lease: Duration) -> CellFsResult<bool> {
    let state = match inspect_marker(marker).await {
        Ok(state) => state,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(CellFsError::io(marker, e)),
    };
    if !state.is_expired(now_ms(), fallback_lease) {
        return Ok(false);
    }

    // Best effort against a concurrent reclaimer: only remove what we judged.
    match inspect_marker(marker).await {
        Ok(again) if again == state => {}
        Ok(_) => return Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(CellFsError::io(marker, e)),
    }

    match tokio::fs::remove_file(marker).await {
        Ok(()) => {
            let holder = match &state {
                MarkerState::Lease(lease) => format!("{}@{}:{}", lease.owner, lease.host, lease.pid),
                MarkerState::Unreadable { .. } => "unknown".to_string(),
            };
            tracing::warn!(marker = %marker.display(), holder = %holder, "reclaimed expired lock");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(CellFsError::io(marker, e)),
    }
}

/// Remove every lock marker under `root` whose lease has expired.
///
/// Crash recovery: markers left behind by a dead holder stop blocking once
/// swept. Returns the markers removed.
pub async fn sweep_expired_locks(root: &Path, opts: &LockOptions) -> CellFsResult<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir != root => continue,
            Err(e) => {
                if dir == root {
                    return Err(CellFsError::io(&dir, e));
                }
                tracing::warn!(dir = %dir.display(), error = %e, "lock sweep skipped directory");
                continue;
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CellFsError::io(&dir, e))?
        {
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(_) => continue,
            };
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !is_lock_marker(&entry.file_name().to_string_lossy()) {
                continue;
            }
            let state = match inspect_marker(&path).await {
                Ok(state) => state,
                Err(_) => continue,
            };
            if state.is_expired(now_ms(), opts.lease) && reclaim_if_expired(&path, opts.lease).await? {
                removed.push(path);
            }
        }
    }

    if !removed.is_empty() {
        tracing::info!(root = %root.display(), count = removed.len(), "swept expired locks");
    }
    Ok(removed)
}

fn host_name() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    })
}

fn system_time_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn now_ms() -> u64 {
    system_time_ms(SystemTime::now())
}
