//! Wire protocol between cells.
//!
//! One [`CellRequest`] per length-delimited frame, answered by one
//! [`CellResponse`] frame. Both are `postcard` encoded. Paths inside
//! operations are physical paths of the receiving cell, except inside a
//! [`CrossCellEnvelope`], which carries cell-qualified virtual paths for the
//! receiver to resolve itself.

use std::collections::BTreeMap;
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::{CellFsError, CellFsResult};
use crate::store::{FileAttributes, HealthReport, Listing, RecursiveListing, WriteMode};

/// A call into a remote cell.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRequest {
    /// Credential of the destination cell.
    pub credential: String,
    /// Cell the caller executes in, empty outside any cell.
    pub source_cell: String,
    pub op: Operation,
}

impl std::fmt::Debug for CellRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellRequest")
            .field("source_cell", &self.source_cell)
            .field("op", &self.op.name())
            .finish_non_exhaustive()
    }
}

/// File store primitive to run at the receiving cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
pub enum Operation {
    GetAttributes { path: PathBuf },
    CreateDir { path: PathBuf, mode: u32 },
    DirOrDie { path: PathBuf },
    RemoveDir { path: PathBuf, include_hidden: bool },
    RemoveDirRecursive { path: PathBuf, include_hidden: bool },
    ListDirs { path: PathBuf, include_hidden: bool },
    ListFiles { path: PathBuf, include_hidden: bool },
    ListAllRecursive { path: PathBuf, include_hidden: bool },
    CreateFile { path: PathBuf, mode: u32 },
    FileOrDie { path: PathBuf },
    RemoveFile { path: PathBuf, require_lock: bool },
    RenameFile { old: PathBuf, new: PathBuf },
    Read { path: PathBuf },
    ReadMultiple { paths: Vec<PathBuf> },
    Write { path: PathBuf, data: Vec<u8>, mode: WriteMode },
    WriteMultiple { files: BTreeMap<PathBuf, Vec<u8>>, mode: WriteMode },
    CopyFile { from: PathBuf, to: PathBuf },
    CrossCell(CrossCellEnvelope),
    CheckHealth,
}

impl Operation {
    /// Variant name, for logs.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// Per-item outcomes of a batch read.
pub type ReadResults = BTreeMap<PathBuf, Result<Vec<u8>, CellFsError>>;

/// Per-item outcomes of a batch write.
pub type WriteResults = BTreeMap<PathBuf, Result<(), CellFsError>>;

/// Successful outcome of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
pub enum Reply {
    Done,
    Path(PathBuf),
    Attributes(FileAttributes),
    Listing(Listing),
    Recursive(RecursiveListing),
    Data(Vec<u8>),
    DataMany(ReadResults),
    WrittenMany(WriteResults),
    Health(HealthReport),
}

/// What travels back for every request.
pub type CellResponse = Result<Reply, CellFsError>;

impl Reply {
    fn unexpected(self, wanted: &str) -> CellFsError {
        let got: &'static str = (&self).into();
        CellFsError::internal(format!("expected {wanted} reply, got {got}"))
    }

    pub fn into_done(self) -> CellFsResult<()> {
        match self {
            Reply::Done => Ok(()),
            other => Err(other.unexpected("Done")),
        }
    }

    pub fn into_path(self) -> CellFsResult<PathBuf> {
        match self {
            Reply::Path(p) => Ok(p),
            other => Err(other.unexpected("Path")),
        }
    }

    pub fn into_attributes(self) -> CellFsResult<FileAttributes> {
        match self {
            Reply::Attributes(a) => Ok(a),
            other => Err(other.unexpected("Attributes")),
        }
    }

    pub fn into_listing(self) -> CellFsResult<Listing> {
        match self {
            Reply::Listing(l) => Ok(l),
            other => Err(other.unexpected("Listing")),
        }
    }

    pub fn into_recursive(self) -> CellFsResult<RecursiveListing> {
        match self {
            Reply::Recursive(l) => Ok(l),
            other => Err(other.unexpected("Recursive")),
        }
    }

    pub fn into_data(self) -> CellFsResult<Vec<u8>> {
        match self {
            Reply::Data(d) => Ok(d),
            other => Err(other.unexpected("Data")),
        }
    }

    pub fn into_data_many(self) -> CellFsResult<ReadResults> {
        match self {
            Reply::DataMany(d) => Ok(d),
            other => Err(other.unexpected("DataMany")),
        }
    }

    pub fn into_written_many(self) -> CellFsResult<WriteResults> {
        match self {
            Reply::WrittenMany(w) => Ok(w),
            other => Err(other.unexpected("WrittenMany")),
        }
    }

    pub fn into_health(self) -> CellFsResult<HealthReport> {
        match self {
            Reply::Health(h) => Ok(h),
            other => Err(other.unexpected("Health")),
        }
    }
}

/// Request asking a cell to carry out an operation spanning two other
/// cells' namespaces on the caller's behalf.
///
/// `request_type` names the inner variant; a receiver rejects an envelope
/// whose tag does not match what it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossCellEnvelope {
    pub request_type: String,
    pub inner: CrossCellCall,
}

/// Operations that can travel inside a [`CrossCellEnvelope`]. Paths are
/// cell-qualified virtual paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
pub enum CrossCellCall {
    #[strum(serialize = "COPYFILE")]
    CopyFile { from: String, to: String },
    #[strum(serialize = "MOVEFILE")]
    MoveFile { from: String, to: String },
}

impl CrossCellCall {
    pub fn request_type(&self) -> &'static str {
        self.into()
    }
}

impl CrossCellEnvelope {
    pub fn new(inner: CrossCellCall) -> Self {
        Self {
            request_type: inner.request_type().to_string(),
            inner,
        }
    }

    /// The inner call, provided the tag names it.
    pub fn validate(&self) -> CellFsResult<&CrossCellCall> {
        if self.request_type != self.inner.request_type() {
            return Err(CellFsError::invalid_argument(format!(
                "cross-cell request_type {:?} does not match {} payload",
                self.request_type,
                self.inner.request_type()
            )));
        }
        Ok(&self.inner)
    }
}

/// Codec framing one message per length-prefixed frame.
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

pub fn encode<T: Serialize>(msg: &T) -> CellFsResult<Bytes> {
    postcard::to_allocvec(msg)
        .map(Bytes::from)
        .map_err(|e| CellFsError::internal(format!("cannot encode message: {e}")))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> CellFsResult<T> {
    postcard::from_bytes(frame)
        .map_err(|e| CellFsError::invalid_argument(format!("malformed message: {e}")))
}

/// Encode `msg` and write it as one frame.
pub async fn send_frame<S, T>(sink: &mut S, msg: &T) -> CellFsResult<()>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
    T: Serialize,
{
    let frame = encode(msg)?;
    sink.send(frame)
        .await
        .map_err(|e| CellFsError::internal(format!("send failed: {e}")))
}

/// Read and decode the next frame; `None` when the peer closed cleanly.
pub async fn recv_frame<S, T>(stream: &mut S) -> CellFsResult<Option<T>>
where
    S: Stream<Item = Result<BytesMut, std::io::Error>> + Unpin,
    T: DeserializeOwned,
{
    match stream.next().await {
        None => Ok(None),
        Some(Ok(frame)) => decode(&frame).map(Some),
        Some(Err(e)) => Err(CellFsError::internal(format!("receive failed: {e}"))),
    }
}
