//! File store types.
//!
//! Plain data, serializable so they travel inside wire replies unchanged.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::CellFsError;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Other,
}

impl FileType {
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// `stat(2)`-style attributes of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub kind: FileType,
    pub dev: u64,
    pub ino: u64,
    /// Full `st_mode`, type bits included.
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    /// Seconds since the epoch.
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileAttributes {
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Permission bits only.
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Directory listing keyed by full physical path.
pub type Listing = BTreeMap<PathBuf, FileAttributes>;

/// Result of a recursive listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecursiveListing {
    pub dirs: Listing,
    pub files: Listing,
}

/// How `write` treats existing content.
///
/// Parses from the wire mode strings `"w"` and `"a"`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
pub enum WriteMode {
    #[default]
    #[strum(serialize = "w")]
    Overwrite,
    #[strum(serialize = "a")]
    Append,
}

impl WriteMode {
    /// Parse a mode string; anything but `w` or `a` is `InvalidArgument`.
    pub fn parse(mode: &str) -> Result<Self, CellFsError> {
        mode.parse()
            .map_err(|_| CellFsError::invalid_argument(format!("unsupported write mode {mode:?}")))
    }
}

/// Disk and memory usage of a cell, in MiB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub cell: String,
    pub healthy: bool,
    /// Milliseconds since the epoch.
    pub timestamp_ms: u64,
    pub total_disk_mb: f64,
    pub used_disk_mb: f64,
    pub total_ram_mb: f64,
    pub used_ram_mb: f64,
}
