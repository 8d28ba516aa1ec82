//! Server configuration constants.

use std::time::Duration;

/// Seconds between maintenance passes (lock, TTL and log sweeps).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Prefix of the service name used for log files.
pub const SERVICE_NAME: &str = "cellfs-server";

/// Grace period for in-flight connections after shutdown is requested.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
