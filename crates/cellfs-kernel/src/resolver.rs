//! Path resolution between the virtual namespace and physical paths.
//!
//! Three path forms exist:
//!
//! - `/LOCAL/<rest>`: relative to the executing cell's physical root
//! - `/galaxy/<cell>-d/<rest>`: relative to the named cell's physical root
//! - any other absolute path: already physical
//!
//! `/SHARED/<rest>` is recognized as well; it is never remote and is expanded
//! per cell with [`broadcast_shared_path`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{CellConfig, CellContext, CellRegistry};
use crate::constants::{CELL_PREFIX, CELL_SUFFIX, LOCAL_PREFIX, SEPARATOR, SHARED_PREFIX};
use crate::error::{CellFsError, CellFsResult};

/// Outcome of resolving one caller-supplied path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathResolution {
    /// Path on the destination cell's filesystem.
    pub physical_path: PathBuf,
    /// Cell the caller executes in, empty outside any cell.
    pub source_cell: String,
    /// Cell that owns `physical_path`, empty for plain paths outside any cell.
    pub destination_cell: String,
    /// `destination_cell` differs from the caller's cell.
    pub is_remote: bool,
    /// Path is a `/SHARED/` path.
    pub is_shared: bool,
    pub source_cell_config: Option<CellConfig>,
    pub destination_cell_config: Option<CellConfig>,
}

impl PathResolution {
    /// Config of the destination, required for any remote dispatch.
    pub fn destination_config(&self) -> CellFsResult<&CellConfig> {
        self.destination_cell_config.as_ref().ok_or_else(|| {
            CellFsError::config_not_found(format!(
                "no config resolved for destination of {}",
                self.physical_path.display()
            ))
        })
    }
}

/// Resolves virtual paths against a cell registry.
#[derive(Clone)]
pub struct PathResolver {
    registry: Arc<dyn CellRegistry>,
}

impl PathResolver {
    pub fn new(registry: Arc<dyn CellRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<dyn CellRegistry> {
        &self.registry
    }

    /// Resolve `raw` as seen from `ctx`.
    ///
    /// Pure apart from registry lookups; does not touch the filesystem.
    pub fn resolve(&self, ctx: &CellContext, raw: &str) -> CellFsResult<PathResolution> {
        let source_cell = ctx.cell().unwrap_or_default().to_string();
        let source_cfg = match ctx.cell() {
            Some(cell) => Some(self.registry.lookup(cell)?),
            None => None,
        };

        if strip_segment_prefix(raw, SHARED_PREFIX).is_some() {
            return Ok(PathResolution {
                physical_path: PathBuf::from(raw),
                destination_cell: source_cell.clone(),
                source_cell,
                is_remote: false,
                is_shared: true,
                destination_cell_config: source_cfg.clone(),
                source_cell_config: source_cfg,
            });
        }

        let mut path = PathBuf::from(raw);
        match &source_cfg {
            Some(cfg) => {
                if let Some(rest) = strip_segment_prefix(raw, LOCAL_PREFIX) {
                    path = join_root(&cfg.physical_root, rest);
                } else if let Ok((cell, rest)) = split_cell_path(raw) {
                    if cell == cfg.cell_name {
                        path = join_root(&cfg.physical_root, &rest);
                    }
                }
            }
            None => {
                if let Some(rest) = strip_segment_prefix(raw, LOCAL_PREFIX) {
                    let root = ctx.local_root().ok_or_else(|| {
                        CellFsError::invalid_path(format!(
                            "{raw}: {LOCAL_PREFIX} used outside any cell without a local root"
                        ))
                    })?;
                    path = join_root(root, rest);
                }
            }
        }

        let mut resolution = PathResolution {
            physical_path: path,
            destination_cell: source_cell.clone(),
            source_cell,
            is_remote: false,
            is_shared: false,
            destination_cell_config: source_cfg.clone(),
            source_cell_config: source_cfg,
        };

        let rewritten = resolution.physical_path.to_string_lossy().into_owned();
        if strip_segment_prefix(&rewritten, CELL_PREFIX).is_some() {
            let (cell, rest) = split_cell_path(&rewritten)?;
            let cfg = self.registry.lookup(&cell)?;
            resolution.physical_path = join_root(&cfg.physical_root, &rest);
            resolution.is_remote = cell != resolution.source_cell;
            resolution.destination_cell = cell;
            resolution.destination_cell_config = Some(cfg);
        }

        tracing::trace!(
            raw,
            physical = %resolution.physical_path.display(),
            destination = %resolution.destination_cell,
            remote = resolution.is_remote,
            "resolved path"
        );
        Ok(resolution)
    }

    /// Rewrite a physical path of `cell` back into its cell-qualified form.
    pub fn to_virtual(&self, physical: &Path, cell: &str) -> CellFsResult<String> {
        let cfg = self.registry.lookup(cell)?;
        Ok(to_virtual_path(physical, &cfg))
    }
}

/// `path` minus `prefix`, when `prefix` is a whole leading segment.
///
/// `/LOCAL` and `/LOCAL/x` match `/LOCAL`; `/LOCALX/x` does not.
pub fn strip_segment_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix(SEPARATOR)
    }
}

/// Split `/galaxy/<cell>-d/<rest>` into `(cell, rest)`.
pub fn split_cell_path(path: &str) -> CellFsResult<(String, String)> {
    let invalid = || CellFsError::invalid_path(format!("{path} is not a cell path"));
    let after = strip_segment_prefix(path, CELL_PREFIX).ok_or_else(invalid)?;
    let (segment, rest) = after.split_once(SEPARATOR).unwrap_or((after, ""));
    let cell = segment
        .strip_suffix(CELL_SUFFIX)
        .filter(|c| !c.is_empty())
        .ok_or_else(invalid)?;
    Ok((cell.to_string(), rest.to_string()))
}

/// Join a root and a relative remainder. An empty remainder is the root.
pub fn join_root(root: &Path, rest: &str) -> PathBuf {
    let rest = rest.trim_start_matches(SEPARATOR);
    if rest.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rest)
    }
}

/// `/galaxy/<cell>-d/<rest>`.
pub fn cell_path(cell: &str, rest: &str) -> String {
    let rest = rest.trim_start_matches(SEPARATOR);
    if rest.is_empty() {
        format!("{CELL_PREFIX}/{cell}{CELL_SUFFIX}")
    } else {
        format!("{CELL_PREFIX}/{cell}{CELL_SUFFIX}/{rest}")
    }
}

/// Inverse of resolution: a path under the cell's root becomes
/// `/galaxy/<cell>-d/<rest>`, anything else is returned unchanged.
pub fn to_virtual_path(physical: &Path, cfg: &CellConfig) -> String {
    match physical.strip_prefix(&cfg.physical_root) {
        Ok(rest) => cell_path(&cfg.cell_name, &rest.to_string_lossy()),
        Err(_) => physical.to_string_lossy().into_owned(),
    }
}

/// Expand a `/SHARED/<rest>` path into one path per cell, or into
/// `/LOCAL/<rest>` when no cells are given.
pub fn broadcast_shared_path(path: &str, cells: &[String]) -> CellFsResult<Vec<String>> {
    let rest = strip_segment_prefix(path, SHARED_PREFIX).ok_or_else(|| {
        CellFsError::invalid_argument(format!("{path} is not a {SHARED_PREFIX} path"))
    })?;
    if cells.is_empty() {
        return Ok(vec![format!("{LOCAL_PREFIX}/{rest}")]);
    }
    Ok(cells.iter().map(|cell| cell_path(cell, rest)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticRegistry;

    fn resolver() -> PathResolver {
        let registry = StaticRegistry::from_cells([
            CellConfig::new("zz", "/home/galaxy", "127.0.0.1:50051", "test"),
            CellConfig::new("zzz", "/data/zzz", "127.0.0.1:50052", "test2"),
        ]);
        PathResolver::new(Arc::new(registry))
    }

    #[test]
    fn plain_path_in_cell_is_local() {
        let r = resolver().resolve(&CellContext::in_cell("zz"), "/home/test").unwrap();
        assert_eq!(r.physical_path, PathBuf::from("/home/test"));
        assert!(!r.is_remote);
        assert_eq!(r.source_cell, "zz");
        assert_eq!(r.destination_cell, "zz");
    }

    #[test]
    fn own_cell_path_maps_to_root() {
        let r = resolver()
            .resolve(&CellContext::in_cell("zz"), "/galaxy/zz-d/test")
            .unwrap();
        assert_eq!(r.physical_path, PathBuf::from("/home/galaxy/test"));
        assert!(!r.is_remote);
    }

    #[test]
    fn relative_path_is_untouched() {
        let r = resolver().resolve(&CellContext::in_cell("zz"), "test").unwrap();
        assert_eq!(r.physical_path, PathBuf::from("test"));
    }

    #[test]
    fn other_cell_path_is_remote() {
        let r = resolver()
            .resolve(&CellContext::in_cell("zz"), "/galaxy/zzz-d/test")
            .unwrap();
        assert_eq!(r.physical_path, PathBuf::from("/data/zzz/test"));
        assert!(r.is_remote);
        assert_eq!(r.destination_cell, "zzz");
        assert_eq!(r.destination_cell_config.unwrap().credential, "test2");
    }

    #[test]
    fn unknown_cell_is_config_not_found() {
        let err = resolver()
            .resolve(&CellContext::in_cell("zz"), "/galaxy/yz-d/test")
            .unwrap_err();
        assert!(matches!(err, CellFsError::ConfigNotFound(_)));
    }

    #[test]
    fn unknown_current_cell_is_config_not_found() {
        let err = resolver()
            .resolve(&CellContext::in_cell("nope"), "/home/test")
            .unwrap_err();
        assert!(matches!(err, CellFsError::ConfigNotFound(_)));
    }

    #[test]
    fn local_prefix_maps_to_current_root() {
        let r = resolver()
            .resolve(&CellContext::in_cell("zz"), "/LOCAL/a/b.txt")
            .unwrap();
        assert_eq!(r.physical_path, PathBuf::from("/home/galaxy/a/b.txt"));
        assert!(!r.is_remote);
    }

    #[test]
    fn local_prefix_outside_cell_uses_hint() {
        let ctx = CellContext::outside().with_local_root("/scratch");
        let r = resolver().resolve(&ctx, "/LOCAL/x").unwrap();
        assert_eq!(r.physical_path, PathBuf::from("/scratch/x"));
        assert!(!r.is_remote);
        assert!(r.destination_cell.is_empty());
    }

    #[test]
    fn local_prefix_outside_cell_without_hint_is_invalid() {
        let err = resolver()
            .resolve(&CellContext::outside(), "/LOCAL/x")
            .unwrap_err();
        assert!(matches!(err, CellFsError::InvalidPath(_)));
    }

    #[test]
    fn cell_path_outside_any_cell_is_remote() {
        let r = resolver()
            .resolve(&CellContext::outside(), "/galaxy/zz-d/x")
            .unwrap();
        assert_eq!(r.physical_path, PathBuf::from("/home/galaxy/x"));
        assert!(r.is_remote);
        assert!(r.source_cell.is_empty());
    }

    #[test]
    fn local_hint_may_itself_name_a_cell() {
        let ctx = CellContext::outside().with_local_root("/galaxy/zzz-d/scratch");
        let r = resolver().resolve(&ctx, "/LOCAL/x").unwrap();
        assert_eq!(r.physical_path, PathBuf::from("/data/zzz/scratch/x"));
        assert_eq!(r.destination_cell, "zzz");
    }

    #[test]
    fn malformed_cell_segments_are_invalid_path() {
        let resolver = resolver();
        let ctx = CellContext::in_cell("zz");
        for raw in ["/galaxy", "/galaxy/", "/galaxy/zzz/x", "/galaxy/-d/x"] {
            let err = resolver.resolve(&ctx, raw).unwrap_err();
            assert!(matches!(err, CellFsError::InvalidPath(_)), "{raw}: {err}");
        }
    }

    #[test]
    fn prefix_must_be_a_whole_segment() {
        let resolver = resolver();
        let ctx = CellContext::in_cell("zz");
        let r = resolver.resolve(&ctx, "/galaxyfoo/zzz-d/x").unwrap();
        assert_eq!(r.physical_path, PathBuf::from("/galaxyfoo/zzz-d/x"));
        let r = resolver.resolve(&ctx, "/LOCALX/y").unwrap();
        assert_eq!(r.physical_path, PathBuf::from("/LOCALX/y"));
    }

    #[test]
    fn resolution_is_deterministic() {
        let resolver = resolver();
        let ctx = CellContext::in_cell("zz");
        let a = resolver.resolve(&ctx, "/galaxy/zzz-d/same").unwrap();
        let b = resolver.resolve(&ctx, "/galaxy/zzz-d/same").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn shared_path_is_flagged_and_untouched() {
        let r = resolver()
            .resolve(&CellContext::in_cell("zz"), "/SHARED/test")
            .unwrap();
        assert_eq!(r.physical_path, PathBuf::from("/SHARED/test"));
        assert!(r.is_shared);
        assert!(!r.is_remote);
    }

    #[test]
    fn split_cell_path_extracts_cell_and_rest() {
        assert_eq!(
            split_cell_path("/galaxy/aa-d/x/y").unwrap(),
            ("aa".to_string(), "x/y".to_string())
        );
        assert_eq!(
            split_cell_path("/galaxy/aa-d").unwrap(),
            ("aa".to_string(), String::new())
        );
    }

    #[test]
    fn to_virtual_inverts_resolution() {
        let resolver = resolver();
        assert_eq!(
            resolver.to_virtual(Path::new("/home/galaxy/test"), "zz").unwrap(),
            "/galaxy/zz-d/test"
        );
        assert_eq!(
            resolver.to_virtual(Path::new("/elsewhere/test"), "zz").unwrap(),
            "/elsewhere/test"
        );

        let ctx = CellContext::in_cell("zzz");
        let virt = resolver
            .to_virtual(Path::new("/data/zzz/a/b"), "zzz")
            .unwrap();
        let back = resolver.resolve(&ctx, &virt).unwrap();
        assert_eq!(back.physical_path, PathBuf::from("/data/zzz/a/b"));
    }

    #[test]
    fn broadcast_shared_expands_per_cell() {
        assert_eq!(
            broadcast_shared_path("/SHARED/test", &[]).unwrap(),
            vec!["/LOCAL/test"]
        );
        let cells = resolver().registry().active_cell_names();
        assert_eq!(
            broadcast_shared_path("/SHARED/test", &cells).unwrap(),
            vec!["/galaxy/zz-d/test", "/galaxy/zzz-d/test"]
        );
        assert!(broadcast_shared_path("/home/test", &cells).is_err());
    }
}
