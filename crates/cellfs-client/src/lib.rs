//! cellfs client library
//!
//! Builds a [`Router`] that reaches remote cells over TCP. The cell table
//! comes from `$CELLFS_CONFIG`, or `cellfs/cells.json` under the user's
//! config directory; the execution context comes from `$CELLFS_CELL` and
//! `$CELLFS_LOCAL_ROOT`.

pub mod constants;
pub mod rpc;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cellfs_kernel::constants::ENV_CONFIG;
use cellfs_kernel::{CellContext, CellFsError, CellFsResult, Router, StaticRegistry};

use crate::constants::{CONFIG_DIR_NAME, CONFIG_FILE_NAME};

pub use rpc::TcpTransport;

/// Where the cell table lives when no path is given.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(ENV_CONFIG) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load the cell table from `path`, or from [`default_config_path`].
pub fn load_registry(path: Option<&Path>) -> CellFsResult<StaticRegistry> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()
            .ok_or_else(|| CellFsError::config_not_found("no config directory for cell table"))?,
    };
    tracing::debug!(path = %path.display(), "loading cell table");
    StaticRegistry::load(&path)
}

/// Router over TCP for an explicit registry and context.
pub fn connect(registry: StaticRegistry, context: CellContext) -> Router {
    Router::new(Arc::new(registry), context, Arc::new(TcpTransport::new()))
}

/// Router configured entirely from the environment.
pub fn connect_from_env() -> CellFsResult<Router> {
    let registry = load_registry(None)?;
    Ok(connect(registry, CellContext::from_env()))
}
