//! Expiry of files that carry a TTL in their path.
//!
//! Any path containing `ttl=<N><unit>` (case-insensitive; unit `m`, `h` or
//! `d`) expires `N` units after its last modification, e.g.
//! `/data/ttl=3d/report.csv` or `/data/cache.ttl=30m`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use regex::Regex;

use crate::error::{CellFsError, CellFsResult};
use crate::store::{self, FileStore, lock};

fn ttl_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i-u)ttl=([0-9]+)([mhd])").ok())
        .as_ref()
}

/// TTL encoded in `path`, if any well-formed one is present.
pub fn ttl_from_path(path: &str) -> Option<Duration> {
    let caps = ttl_pattern()?.captures(path)?;
    let count: u64 = caps.get(1)?.as_str().parse().ok()?;
    if count == 0 {
        return None;
    }
    let secs: u64 = match caps.get(2)?.as_str() {
        "m" | "M" => 60,
        "h" | "H" => 60 * 60,
        "d" | "D" => 24 * 60 * 60,
        _ => return None,
    };
    Some(Duration::from_secs(count.checked_mul(secs)?))
}

/// Whether a file last modified at `modified` with `ttl` has expired by `now`.
///
/// A deadline past the end of representable time never expires.
pub fn is_expired(modified: SystemTime, ttl: Duration, now: SystemTime) -> bool {
    modified.checked_add(ttl).is_some_and(|deadline| deadline < now)
}

/// Remove every expired TTL file below `dir`. Returns the removed paths.
#[tracing::instrument(skip_all, fields(dir = %dir.display()))]
pub async fn sweep_expired_files(
    store: &FileStore,
    dir: &Path,
    now: SystemTime,
) -> CellFsResult<Vec<PathBuf>> {
    let listing = store.list_all_recursive(dir, true).await?;
    let mut removed = Vec::new();

    for (path, attrs) in listing.files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if lock::is_lock_marker(&name) {
            continue;
        }
        let Some(ttl) = ttl_from_path(&path.to_string_lossy()) else {
            continue;
        };
        if !is_expired(store::modified_time(&attrs), ttl, now) {
            continue;
        }
        match store.remove_file(&path, true).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), ttl_secs = ttl.as_secs(), "expired file removed");
                removed.push(path);
            }
            Err(CellFsError::NotFound(_)) => {
                tracing::debug!(path = %path.display(), "expired file already gone");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WriteMode;

    #[test]
    fn parses_units_case_insensitively() {
        assert_eq!(ttl_from_path("/a/ttl=5m/x"), Some(Duration::from_secs(300)));
        assert_eq!(ttl_from_path("/a/TTL=2H/x"), Some(Duration::from_secs(7200)));
        assert_eq!(ttl_from_path("/a/b.ttl=1d"), Some(Duration::from_secs(86400)));
    }

    #[test]
    fn rejects_malformed_ttls() {
        assert_eq!(ttl_from_path("/a/b"), None);
        assert_eq!(ttl_from_path("/a/ttl=0d"), None);
        assert_eq!(ttl_from_path("/a/ttl=5x"), None);
        assert_eq!(ttl_from_path("/a/ttl=d"), None);
        assert_eq!(ttl_from_path("/a/ttl=/b"), None);
        assert_eq!(ttl_from_path("/a/ttl=5\u{212A}/x"), None);
        assert_eq!(ttl_from_path("/a/ttl=5\u{017F}/x"), None);
        assert_eq!(ttl_from_path("/a/ttl=999999999999999999d/x"), None);
        assert_eq!(ttl_from_path("/a/ttl=99999999999999999999999m/x"), None);
    }

    #[test]
    fn expiry_compares_against_now() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let ttl = Duration::from_secs(60);
        assert!(!is_expired(t0, ttl, t0 + Duration::from_secs(30)));
        assert!(is_expired(t0, ttl, t0 + Duration::from_secs(61)));
        assert!(!is_expired(t0, Duration::MAX, t0 + Duration::from_secs(61)));
    }

    #[tokio::test]
    async fn sweep_skips_names_with_non_ascii_or_huge_ttls() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let p = Path::new;
        store.write(p("ttl=5\u{212A}/a"), b"a", WriteMode::Overwrite, true).await.unwrap();
        store.write(p("ttl=999999999999999999d/b"), b"b", WriteMode::Overwrite, true).await.unwrap();

        let later = SystemTime::now() + Duration::from_secs(3600);
        let removed = sweep_expired_files(&store, dir.path(), later).await.unwrap();

        assert!(removed.is_empty());
        assert!(dir.path().join("ttl=5\u{212A}/a").exists());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_ttl_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let p = Path::new;
        store.write(p("ttl=1m/a"), b"a", WriteMode::Overwrite, true).await.unwrap();
        store.write(p("keep/b.ttl=2d"), b"b", WriteMode::Overwrite, true).await.unwrap();
        store.write(p("plain/c"), b"c", WriteMode::Overwrite, true).await.unwrap();

        let later = SystemTime::now() + Duration::from_secs(3600);
        let removed = sweep_expired_files(&store, dir.path(), later).await.unwrap();

        assert_eq!(removed, vec![dir.path().join("ttl=1m/a")]);
        assert!(dir.path().join("keep/b.ttl=2d").exists());
        assert!(dir.path().join("plain/c").exists());
    }
}
