//! Periodic housekeeping for a cell: expired lock markers, expired TTL
//! files and old log files.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use cellfs_kernel::store::lock;
use cellfs_kernel::{CellConfig, CellFsError, CellFsResult, FileStore, ttl};

use crate::constants::SERVICE_NAME;

/// What one pass removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub locks: Vec<PathBuf>,
    pub expired_files: Vec<PathBuf>,
    pub logs: Vec<PathBuf>,
}

pub struct Maintenance {
    store: FileStore,
    log_directory: Option<PathBuf>,
    log_service: String,
    log_ttl_days: u32,
}

impl Maintenance {
    pub fn new(config: &CellConfig, store: FileStore) -> Self {
        Self {
            store,
            log_directory: config.log_directory.clone(),
            log_service: service_name(&config.cell_name),
            log_ttl_days: config.log_ttl_days,
        }
    }

    /// Reclaim lock markers whose lease ran out. Run once at startup before
    /// serving, then on every pass.
    pub async fn sweep_locks(&self) -> CellFsResult<Vec<PathBuf>> {
        let removed = lock::sweep_expired_locks(self.store.root(), self.store.lock_options()).await?;
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "reclaimed expired lock markers");
        }
        Ok(removed)
    }

    /// One full pass as of `now`.
    pub async fn run_once(&self, now: SystemTime) -> CellFsResult<SweepReport> {
        let locks = self.sweep_locks().await?;
        let expired_files = ttl::sweep_expired_files(&self.store, self.store.root(), now).await?;
        let logs = self.prune_logs(now).await?;
        Ok(SweepReport {
            locks,
            expired_files,
            logs,
        })
    }

    async fn prune_logs(&self, now: SystemTime) -> CellFsResult<Vec<PathBuf>> {
        let Some(dir) = self.log_directory.clone() else {
            return Ok(Vec::new());
        };
        let service = self.log_service.clone();
        let ttl_days = self.log_ttl_days;
        tokio::task::spawn_blocking(move || {
            cellfs_telemetry::prune_old_logs(&dir, &service, ttl_days, now)
                .map_err(|e| CellFsError::io(&dir, e))
        })
        .await
        .map_err(|e| CellFsError::internal(format!("log pruning task failed: {e}")))?
    }

    /// Run a pass every `interval` until `shutdown` is cancelled. A failed
    /// pass is logged and the next one still runs.
    pub async fn run_periodically(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_once(SystemTime::now()).await {
                Ok(report) => tracing::debug!(
                    locks = report.locks.len(),
                    files = report.expired_files.len(),
                    logs = report.logs.len(),
                    "maintenance pass"
                ),
                Err(e) => tracing::error!(error = %e, "maintenance pass failed"),
            }
        }
    }
}

/// Service name for a cell's logs.
pub fn service_name(cell: &str) -> String {
    format!("{SERVICE_NAME}-{cell}")
}
