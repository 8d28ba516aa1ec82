//! cellfs server library
//!
//! Serves one cell over TCP: credential check, dispatch into a store rooted
//! at the cell's physical root, cross-cell forwarding and housekeeping.

pub mod constants;
pub mod handler;
pub mod loopback;
pub mod maintenance;
pub mod net;

use cellfs_kernel::CellConfig;
use cellfs_telemetry::LogSettings;

pub use handler::CellServer;
pub use loopback::LoopbackTransport;
pub use maintenance::{Maintenance, SweepReport};
pub use net::serve;

/// Logging settings taken from a cell's configuration.
pub fn log_settings(config: &CellConfig) -> LogSettings {
    LogSettings {
        service_name: maintenance::service_name(&config.cell_name),
        verbosity: config.verbosity,
        log_directory: config.log_directory.clone(),
        also_log_to_console: config.also_log_to_console,
    }
}
