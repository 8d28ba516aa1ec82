//! # cellfs-kernel
//!
//! Core crate of cellfs, a virtual file namespace sharded across cells.
//!
//! Each cell owns a physical root and a network endpoint. Callers name files
//! through virtual paths:
//! - `/LOCAL/<rest>` is under the caller's own cell root
//! - `/galaxy/<cell>-d/<rest>` is under the named cell's root
//! - `/SHARED/<rest>` stands for the same path in every cell
//!
//! The [`PathResolver`] maps those onto physical paths, the [`FileStore`]
//! runs lock-protected primitives on disk, and the [`Router`] sends each
//! operation either to the local store or to the owning cell through a
//! [`CellTransport`].

pub mod config;
pub mod constants;
pub mod error;
pub mod resolver;
pub mod router;
pub mod store;
pub mod ttl;
pub mod wire;

pub use config::{CellConfig, CellContext, CellEntry, CellRegistry, StaticRegistry};
pub use error::{CellFsError, CellFsResult};
pub use resolver::{
    PathResolution, PathResolver, broadcast_shared_path, cell_path, split_cell_path,
    to_virtual_path,
};
pub use router::{CellTransport, Router};
pub use store::{
    FileAttributes, FileStore, FileType, HealthReport, Listing, LockGuard, LockOptions,
    RecursiveListing, WriteMode,
};
pub use wire::{
    CellRequest, CellResponse, CrossCellCall, CrossCellEnvelope, Operation, ReadResults, Reply,
    WriteResults,
};
