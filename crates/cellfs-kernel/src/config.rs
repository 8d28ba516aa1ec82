//! Cell configuration, the registry of cells, and the caller's cell context.
//!
//! The global configuration is a JSON document keyed by cell name:
//!
//! ```json
//! { "aa": { "fs_root": "/data/aa", "fs_ip": "10.0.0.1", "fs_port": 50051,
//!           "fs_password": "secret" } }
//! ```
//!
//! `fs_root`, `fs_ip`, `fs_port` and `fs_password` are required; a lookup of a
//! cell missing any of them fails with `ConfigIncomplete`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_MAX_MESSAGE_SIZE_MB, ENV_CELL, ENV_LOCAL_ROOT};
use crate::error::{CellFsError, CellFsResult};

/// Fully validated configuration of one cell.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellConfig {
    pub cell_name: String,
    /// Directory every `/galaxy/<cell>-d/` path of this cell maps under.
    pub physical_root: PathBuf,
    /// `ip:port` of the cell's server.
    pub network_address: String,
    /// `ip:port` of the stats endpoint, empty when not configured.
    pub stats_address: String,
    /// Shared secret presented on every remote call into this cell.
    pub credential: String,
    pub log_directory: Option<PathBuf>,
    /// Days to keep server logs; 0 keeps them forever.
    pub log_ttl_days: u32,
    pub verbosity: u8,
    pub also_log_to_console: bool,
    /// 0 lets the runtime pick.
    pub worker_thread_count: usize,
    pub max_message_size_mb: usize,
    /// Disabled cells stay addressable but are left out of broadcasts.
    pub disabled: bool,
}

impl CellConfig {
    /// Minimal config with defaults for every optional field.
    pub fn new(
        cell_name: impl Into<String>,
        physical_root: impl Into<PathBuf>,
        network_address: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            cell_name: cell_name.into(),
            physical_root: physical_root.into(),
            network_address: network_address.into(),
            stats_address: String::new(),
            credential: credential.into(),
            log_directory: None,
            log_ttl_days: 0,
            verbosity: 0,
            also_log_to_console: false,
            worker_thread_count: 0,
            max_message_size_mb: DEFAULT_MAX_MESSAGE_SIZE_MB,
            disabled: false,
        }
    }

    /// Port component of `network_address`.
    pub fn port(&self) -> CellFsResult<u16> {
        self.network_address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .ok_or_else(|| {
                CellFsError::config_incomplete(format!(
                    "cell {} has no port in address {:?}",
                    self.cell_name, self.network_address
                ))
            })
    }

    /// Address a server for this cell listens on: every interface, same port.
    pub fn listen_address(&self) -> CellFsResult<String> {
        Ok(format!("0.0.0.0:{}", self.port()?))
    }

    /// Frame limit in bytes.
    pub fn max_message_bytes(&self) -> usize {
        self.max_message_size_mb.max(1) * 1024 * 1024
    }
}

impl fmt::Debug for CellConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellConfig")
            .field("cell_name", &self.cell_name)
            .field("physical_root", &self.physical_root)
            .field("network_address", &self.network_address)
            .field("stats_address", &self.stats_address)
            .field("credential", &"<redacted>")
            .field("log_directory", &self.log_directory)
            .field("log_ttl_days", &self.log_ttl_days)
            .field("verbosity", &self.verbosity)
            .field("also_log_to_console", &self.also_log_to_console)
            .field("worker_thread_count", &self.worker_thread_count)
            .field("max_message_size_mb", &self.max_message_size_mb)
            .field("disabled", &self.disabled)
            .finish()
    }
}

/// One cell entry as written in the global JSON configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_stats_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_log_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_log_ttl: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_verbose_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_alsologtostderr: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_num_thread: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_max_msg_size: Option<usize>,
    #[serde(default)]
    pub disabled: bool,
}

impl CellEntry {
    /// Validate into a [`CellConfig`], expanding `~` in directory fields.
    pub fn to_config(&self, cell: &str) -> CellFsResult<CellConfig> {
        let (Some(root), Some(ip), Some(port), Some(password)) = (
            self.fs_root.as_deref(),
            self.fs_ip.as_deref(),
            self.fs_port,
            self.fs_password.as_deref(),
        ) else {
            return Err(CellFsError::config_incomplete(format!(
                "cell {cell} must define fs_root, fs_ip, fs_port and fs_password"
            )));
        };

        let stats_address = self
            .fs_stats_port
            .map(|p| format!("{ip}:{p}"))
            .unwrap_or_default();

        Ok(CellConfig {
            cell_name: cell.to_string(),
            physical_root: expand(root),
            network_address: format!("{ip}:{port}"),
            stats_address,
            credential: password.to_string(),
            log_directory: self.fs_log_dir.as_deref().map(expand),
            log_ttl_days: self.fs_log_ttl.unwrap_or(0),
            verbosity: self.fs_verbose_level.unwrap_or(0),
            also_log_to_console: self.fs_alsologtostderr.unwrap_or(false),
            worker_thread_count: self.fs_num_thread.unwrap_or(0),
            max_message_size_mb: self.fs_max_msg_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_MB),
            disabled: self.disabled,
        })
    }
}

impl From<&CellConfig> for CellEntry {
    fn from(cfg: &CellConfig) -> Self {
        let (ip, port) = match cfg.network_address.rsplit_once(':') {
            Some((ip, port)) => (Some(ip.to_string()), port.parse().ok()),
            None => (Some(cfg.network_address.clone()), None),
        };
        let stats_port = cfg
            .stats_address
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok());

        Self {
            fs_root: Some(cfg.physical_root.to_string_lossy().into_owned()),
            fs_ip: ip,
            fs_port: port,
            fs_password: Some(cfg.credential.clone()),
            fs_stats_port: stats_port,
            fs_log_dir: cfg
                .log_directory
                .as_ref()
                .map(|d| d.to_string_lossy().into_owned()),
            fs_log_ttl: Some(cfg.log_ttl_days),
            fs_verbose_level: Some(cfg.verbosity),
            fs_alsologtostderr: Some(cfg.also_log_to_console),
            fs_num_thread: Some(cfg.worker_thread_count),
            fs_max_msg_size: Some(cfg.max_message_size_mb),
            disabled: cfg.disabled,
        }
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Maps cell names to their configuration.
pub trait CellRegistry: Send + Sync {
    /// Fails `ConfigNotFound` for an unknown cell, `ConfigIncomplete` for an
    /// entry missing required fields.
    fn lookup(&self, cell: &str) -> CellFsResult<CellConfig>;

    /// Every configured cell name, sorted.
    fn cell_names(&self) -> Vec<String>;

    /// Cell names that are complete and not disabled.
    fn active_cell_names(&self) -> Vec<String> {
        self.cell_names()
            .into_iter()
            .filter(|name| matches!(self.lookup(name), Ok(cfg) if !cfg.disabled))
            .collect()
    }
}

/// In-memory registry, usually parsed from the global JSON file.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    cells: BTreeMap<String, CellEntry>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the global JSON configuration.
    pub fn from_json(json: &str) -> CellFsResult<Self> {
        let cells: BTreeMap<String, CellEntry> = serde_json::from_str(json)
            .map_err(|e| CellFsError::internal(format!("cannot parse cell config: {e}")))?;
        Ok(Self { cells })
    }

    /// Load the global JSON configuration from disk.
    pub fn load(path: impl AsRef<Path>) -> CellFsResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                CellFsError::config_not_found(format!("{} does not exist", path.display()))
            }
            _ => CellFsError::io(path, e),
        })?;
        let registry = Self::from_json(&json)?;
        tracing::debug!(path = %path.display(), cells = registry.cells.len(), "loaded cell config");
        Ok(registry)
    }

    pub fn from_cells(cells: impl IntoIterator<Item = CellConfig>) -> Self {
        let mut registry = Self::new();
        for cell in cells {
            registry.insert(cell);
        }
        registry
    }

    pub fn insert(&mut self, cfg: CellConfig) {
        self.cells.insert(cfg.cell_name.clone(), CellEntry::from(&cfg));
    }

    /// Insert a raw entry, validated only on lookup.
    pub fn insert_entry(&mut self, cell: impl Into<String>, entry: CellEntry) {
        self.cells.insert(cell.into(), entry);
    }

    pub fn to_json(&self) -> CellFsResult<String> {
        serde_json::to_string_pretty(&self.cells)
            .map_err(|e| CellFsError::internal(format!("cannot encode cell config: {e}")))
    }
}

impl CellRegistry for StaticRegistry {
    fn lookup(&self, cell: &str) -> CellFsResult<CellConfig> {
        self.cells
            .get(cell)
            .ok_or_else(|| CellFsError::config_not_found(cell))?
            .to_config(cell)
    }

    fn cell_names(&self) -> Vec<String> {
        self.cells.keys().cloned().collect()
    }
}

/// Where a call executes: inside a named cell, or outside any cell.
///
/// Built once at process start; resolution never consults the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellContext {
    cell: Option<String>,
    local_root: Option<PathBuf>,
}

impl CellContext {
    /// Caller outside any cell.
    pub fn outside() -> Self {
        Self::default()
    }

    /// Caller executing inside `cell`.
    pub fn in_cell(cell: impl Into<String>) -> Self {
        Self {
            cell: Some(cell.into()),
            local_root: None,
        }
    }

    /// Root substituted for `/LOCAL/` when no cell is current.
    pub fn with_local_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local_root = Some(root.into());
        self
    }

    /// Read `CELLFS_CELL` and `CELLFS_LOCAL_ROOT`. Empty values count as unset.
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            cell: var(ENV_CELL),
            local_root: var(ENV_LOCAL_ROOT).map(|r| expand(&r)),
        }
    }

    pub fn cell(&self) -> Option<&str> {
        self.cell.as_deref()
    }

    pub fn local_root(&self) -> Option<&Path> {
        self.local_root.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "zz": { "fs_root": "/home/galaxy", "fs_ip": "127.0.0.1", "fs_port": 50051,
                "fs_password": "test", "fs_log_ttl": 3, "fs_verbose_level": 1 },
        "zzz": { "fs_root": "/home/galaxy2", "fs_ip": "127.0.0.1", "fs_port": 50052,
                 "fs_password": "test2", "disabled": true },
        "broken": { "fs_root": "/tmp", "fs_ip": "127.0.0.1" }
    }"#;

    #[test]
    fn lookup_parses_required_and_optional_fields() {
        let registry = StaticRegistry::from_json(CONFIG).unwrap();
        let cfg = registry.lookup("zz").unwrap();
        assert_eq!(cfg.physical_root, PathBuf::from("/home/galaxy"));
        assert_eq!(cfg.network_address, "127.0.0.1:50051");
        assert_eq!(cfg.credential, "test");
        assert_eq!(cfg.log_ttl_days, 3);
        assert_eq!(cfg.verbosity, 1);
        assert_eq!(cfg.port().unwrap(), 50051);
        assert_eq!(cfg.listen_address().unwrap(), "0.0.0.0:50051");
    }

    #[test]
    fn unknown_cell_is_config_not_found() {
        let registry = StaticRegistry::from_json(CONFIG).unwrap();
        assert!(matches!(
            registry.lookup("yz"),
            Err(CellFsError::ConfigNotFound(_))
        ));
    }

    #[test]
    fn missing_required_field_is_config_incomplete() {
        let registry = StaticRegistry::from_json(CONFIG).unwrap();
        assert!(matches!(
            registry.lookup("broken"),
            Err(CellFsError::ConfigIncomplete(_))
        ));
    }

    #[test]
    fn active_cells_skip_disabled_and_incomplete() {
        let registry = StaticRegistry::from_json(CONFIG).unwrap();
        assert_eq!(registry.cell_names(), vec!["broken", "zz", "zzz"]);
        assert_eq!(registry.active_cell_names(), vec!["zz"]);
    }

    #[test]
    fn from_cells_round_trips_through_entries() {
        let mut cfg = CellConfig::new("aa", "/data/aa", "10.0.0.1:7000", "pw");
        cfg.stats_address = "10.0.0.1:7001".into();
        let registry = StaticRegistry::from_cells([cfg.clone()]);
        assert_eq!(registry.lookup("aa").unwrap(), cfg);

        let reparsed = StaticRegistry::from_json(&registry.to_json().unwrap()).unwrap();
        assert_eq!(reparsed.lookup("aa").unwrap(), cfg);
    }

    #[test]
    fn load_missing_file_is_config_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = StaticRegistry::load(dir.path().join("nope.json"));
        assert!(matches!(result, Err(CellFsError::ConfigNotFound(_))));
    }

    #[test]
    fn debug_redacts_credential() {
        let cfg = CellConfig::new("aa", "/data/aa", "10.0.0.1:7000", "hunter2");
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("hunter2"));
    }
}
