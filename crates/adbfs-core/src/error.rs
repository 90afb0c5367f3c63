//! Error types for adbfs
//!
//! Three layers:
//! - [`ClientError`]: what a device session or client reports
//! - [`PathError`]: local validation failures, never sent to the device
//! - [`FsError`]: the POSIX status returned by the filesystem adapter

use thiserror::Error;

/// Errors reported by the device-bridge client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    #[error("file exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("read-only file system: {0}")]
    ReadOnly(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("command failed with status {status}: {message}")]
    Command { status: i32, message: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("command timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session pool closed")]
    PoolClosed,
}

impl ClientError {
    /// Whether the session that produced this error must be discarded.
    ///
    /// After a timeout or a garbled response the session's command stream is
    /// in an unknown state and cannot be handed to another caller.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_) | ClientError::Timeout | ClientError::Protocol(_)
        )
    }
}

/// Local path validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("path traversal blocked: {0}")]
    Traversal(String),

    #[error("path contains null byte")]
    NullByte,

    #[error("path too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("invalid file name: {0}")]
    InvalidName(String),
}

/// Status returned by the filesystem adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("read-only file system")]
    ReadOnly,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("bad file handle")]
    BadHandle,
    #[error("name too long")]
    NameTooLong,
    #[error("not supported")]
    NotSupported,
    #[error("I/O error: {0}")]
    Io(String),
}

impl FsError {
    /// Convert to libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EACCES,
            FsError::NotPermitted => libc::EPERM,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::ReadOnly => libc::EROFS,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::BadHandle => libc::EBADF,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::Io(_) => libc::EIO,
        }
    }

    /// Validation failures are expected user input errors, not device failures
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FsError::InvalidArgument(_) | FsError::NameTooLong | FsError::BadHandle
        )
    }
}

impl From<ClientError> for FsError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::NotFound(_) => FsError::NotFound,
            ClientError::PermissionDenied(_) => FsError::PermissionDenied,
            ClientError::NotPermitted(_) => FsError::NotPermitted,
            ClientError::AlreadyExists(_) => FsError::AlreadyExists,
            ClientError::NotEmpty(_) => FsError::NotEmpty,
            ClientError::NotADirectory(_) => FsError::NotADirectory,
            ClientError::IsADirectory(_) => FsError::IsADirectory,
            ClientError::ReadOnly(_) => FsError::ReadOnly,
            ClientError::InvalidArgument(ref msg) => FsError::InvalidArgument(msg.clone()),
            ClientError::Unsupported(_) => FsError::NotSupported,
            ClientError::Command { .. }
            | ClientError::Connection(_)
            | ClientError::Timeout
            | ClientError::Protocol(_)
            | ClientError::PoolClosed => FsError::Io(e.to_string()),
        }
    }
}

impl From<PathError> for FsError {
    fn from(e: PathError) -> Self {
        match e {
            PathError::TooLong { .. } => FsError::NameTooLong,
            other => FsError::InvalidArgument(other.to_string()),
        }
    }
}
