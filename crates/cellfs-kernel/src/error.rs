//! Error taxonomy shared by every cellfs layer.
//!
//! `CellFsError` is serializable so a failure raised inside a remote cell
//! reaches the caller with its kind intact.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// cellfs error type.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CellFsError {
    /// Malformed virtual path (bad `/galaxy/` segment).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Referenced cell is absent from the global configuration.
    #[error("cell config not found: {0}")]
    ConfigNotFound(String),

    /// Cell entry exists but lacks a required field.
    #[error("cell config incomplete: {0}")]
    ConfigIncomplete(String),

    /// Target file or directory does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Credential mismatch at a remote cell.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Unsupported mode, empty lock name, path escaping a root.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// OS call or transport failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// Deadline or lock acquisition timeout exceeded.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Operation not expressible for this combination of cells.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
}

impl CellFsError {
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    pub fn config_not_found(cell: impl Into<String>) -> Self {
        Self::ConfigNotFound(cell.into())
    }

    pub fn config_incomplete(msg: impl Into<String>) -> Self {
        Self::ConfigIncomplete(msg.into())
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn precondition_failed(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    /// Map an I/O error raised while touching `path`.
    pub fn io(path: impl AsRef<std::path::Path>, err: io::Error) -> Self {
        let msg = format!("{}: {}", path.as_ref().display(), err);
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(msg),
            _ => Self::Internal(msg),
        }
    }

    /// Prefix the message, keeping the kind.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        let wrap = |m: String| format!("{ctx}: {m}");
        match self {
            Self::InvalidPath(m) => Self::InvalidPath(wrap(m)),
            Self::ConfigNotFound(m) => Self::ConfigNotFound(wrap(m)),
            Self::ConfigIncomplete(m) => Self::ConfigIncomplete(wrap(m)),
            Self::NotFound(m) => Self::NotFound(wrap(m)),
            Self::PermissionDenied(m) => Self::PermissionDenied(wrap(m)),
            Self::InvalidArgument(m) => Self::InvalidArgument(wrap(m)),
            Self::Internal(m) => Self::Internal(wrap(m)),
            Self::Timeout(m) => Self::Timeout(wrap(m)),
            Self::PreconditionFailed(m) => Self::PreconditionFailed(wrap(m)),
        }
    }

    /// Stable short name of the kind, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPath(_) => "invalid_path",
            Self::ConfigNotFound(_) => "config_not_found",
            Self::ConfigIncomplete(_) => "config_incomplete",
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Internal(_) => "internal",
            Self::Timeout(_) => "timeout",
            Self::PreconditionFailed(_) => "precondition_failed",
        }
    }
}

impl From<io::Error> for CellFsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

/// Convert CellFsError to std::io::Error for compatibility.
impl From<CellFsError> for io::Error {
    fn from(e: CellFsError) -> Self {
        match e {
            CellFsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            CellFsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            CellFsError::InvalidPath(msg) | CellFsError::InvalidArgument(msg) => {
                io::Error::new(io::ErrorKind::InvalidInput, msg)
            }
            CellFsError::Timeout(msg) => io::Error::new(io::ErrorKind::TimedOut, msg),
            other => io::Error::other(other.to_string()),
        }
    }
}

/// cellfs result type.
pub type CellFsResult<T> = Result<T, CellFsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_keeps_kind() {
        let err = CellFsError::io("/x", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, CellFsError::NotFound(_)));

        let err = CellFsError::io("/x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, CellFsError::Internal(_)));
    }

    #[test]
    fn context_preserves_kind() {
        let err = CellFsError::not_found("/a").context("move left a duplicate");
        assert_eq!(err.kind(), "not_found");
        assert!(err.to_string().contains("move left a duplicate"));
    }

    #[test]
    fn postcard_round_trip_keeps_variant() {
        let err = CellFsError::permission_denied("bad credential");
        let bytes = postcard::to_allocvec(&err).unwrap();
        let back: CellFsError = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, err);
    }
}
