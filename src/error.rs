//! Crate-wide error taxonomy for the storage node.
//!
//! Every subsystem returns [`StorageError`] through the shared [`Result`]
//! alias rather than ad-hoc string errors, so that the file service state
//! machine can map failures onto the numeric status byte defined in the
//! wire protocol (`spec.md` §7) without re-deriving intent from an error
//! message.

use std::fmt;
use std::io;

/// Convenient result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors a storage node can observe while servicing clients, replicating,
/// or recovering a path.
#[derive(Debug)]
pub enum StorageError {
    /// Malformed header, unsupported command, or body-length mismatch.
    /// The connection that produced it must be closed.
    Protocol(String),
    /// The requested file does not exist locally.
    NotFound,
    /// The file already exists. For `SYNC_CREATE_FILE` with an identical
    /// size this is treated as success by the caller; see `fsm::commands`.
    AlreadyExists,
    /// A logical filename failed to decode.
    InvalidFilename(String),
    /// No store path satisfies the free-space reservation for a write.
    NoSpace,
    /// A trunk slot could not be located or its header is corrupt.
    CorruptTrunkHeader,
    /// A referenced trunk file does not exist.
    TrunkNotFound,
    /// Read/write/fsync failed for a reason other than ENOSPC/EEXIST.
    DiskIo(io::Error),
    /// A replication send to a peer failed; the caller should rewind and
    /// retry after backoff. Never escalated to [`StorageError::Fatal`].
    RemotePeerDown(String),
    /// An unrecoverable condition (binlog flush failure, mark-file write
    /// failure, trunk-binlog write failure). The node must stop.
    Fatal(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            StorageError::NotFound => write!(f, "no such file"),
            StorageError::AlreadyExists => write!(f, "file already exists"),
            StorageError::InvalidFilename(msg) => write!(f, "invalid filename: {msg}"),
            StorageError::NoSpace => write!(f, "no store path has enough free space"),
            StorageError::CorruptTrunkHeader => write!(f, "corrupt trunk file header"),
            StorageError::TrunkNotFound => write!(f, "trunk file not found"),
            StorageError::DiskIo(err) => write!(f, "disk i/o error: {err}"),
            StorageError::RemotePeerDown(msg) => write!(f, "peer unreachable: {msg}"),
            StorageError::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::DiskIo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound,
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists,
            _ => StorageError::DiskIo(err),
        }
    }
}

/// Numeric status byte reported on the wire, matching `spec.md` §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Success = 0,
    Again = 11,       // EAGAIN
    NoEntity = 2,      // ENOENT
    Exists = 17,       // EEXIST
    NoSpace = 28,      // ENOSPC
    Invalid = 22,      // EINVAL
    NotPermitted = 1,  // EPERM
    IoError = 5,       // EIO
}

impl StorageError {
    /// Maps this error to the wire status byte a response header should carry.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StorageError::NotFound | StorageError::TrunkNotFound => StatusCode::NoEntity,
            StorageError::AlreadyExists => StatusCode::Exists,
            StorageError::NoSpace => StatusCode::NoSpace,
            StorageError::InvalidFilename(_) | StorageError::Protocol(_) => StatusCode::Invalid,
            StorageError::CorruptTrunkHeader => StatusCode::IoError,
            StorageError::DiskIo(_) => StatusCode::IoError,
            StorageError::RemotePeerDown(_) => StatusCode::Again,
            StorageError::Fatal(_) => StatusCode::IoError,
        }
    }

    /// Whether this error must stop the whole node (`spec.md` §7 propagation policy).
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::Fatal(_))
    }
}
