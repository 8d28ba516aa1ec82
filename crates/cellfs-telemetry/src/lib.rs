//! Logging for cellfs processes.
//!
//! Installs a `tracing` subscriber with an env filter, a stderr layer and
//! an optional daily-rolling file layer. `RUST_LOG` overrides the verbosity
//! from configuration:
//!
//! ```bash
//! RUST_LOG=cellfs_kernel::store::lock=trace cellfs-server --cell aa
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("cannot prepare log directory {path}: {source}")]
    LogDirectory { path: PathBuf, source: io::Error },
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// How a process wants its logs.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// File name prefix for rolling logs, usually the binary plus cell name.
    pub service_name: String,
    /// 0 = info, 1 = debug, 2+ = trace.
    pub verbosity: u8,
    /// Write daily-rolling files here when set.
    pub log_directory: Option<PathBuf>,
    /// Mirror to stderr even when logging to files.
    pub also_log_to_console: bool,
}

impl LogSettings {
    pub fn console(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            verbosity: 0,
            log_directory: None,
            also_log_to_console: true,
        }
    }

    fn wants_console(&self) -> bool {
        self.also_log_to_console || self.log_directory.is_none()
    }
}

/// Keeps the background file writer alive; drop it last to flush.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Default filter directive for a verbosity level.
pub fn verbosity_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber described by `settings`.
pub fn init_logging(settings: &LogSettings) -> Result<LogGuard, TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_filter(settings.verbosity)));

    let console = settings
        .wants_console()
        .then(|| fmt::layer().with_writer(io::stderr));

    let (file, guard) = match &settings.log_directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| TelemetryError::LogDirectory {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(dir, log_prefix(&settings.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))?;

    Ok(LogGuard { _file: guard })
}

fn log_prefix(service_name: &str) -> String {
    format!("{service_name}.log")
}

/// Delete log files of `service_name` in `dir` older than `ttl_days`.
///
/// `ttl_days == 0` keeps everything. Files that fail to delete are logged
/// and skipped; failing to list `dir` is an error.
pub fn prune_old_logs(
    dir: &Path,
    service_name: &str,
    ttl_days: u32,
    now: SystemTime,
) -> io::Result<Vec<PathBuf>> {
    if ttl_days == 0 {
        return Ok(Vec::new());
    }
    let ttl = Duration::from_secs(u64::from(ttl_days) * SECS_PER_DAY);
    let prefix = log_prefix(service_name);
    let mut removed = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "cannot stat log file");
                continue;
            }
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if modified + ttl >= now {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed.push(entry.path()),
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "cannot remove old log")
            }
        }
    }
    removed.sort();
    Ok(removed)
}
