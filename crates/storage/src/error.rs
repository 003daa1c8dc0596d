//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// File does not exist
    #[display("file not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Access denied (permissions or credentials)
    #[display("permission denied: {_0}")]
    PermissionDenied(#[error(not(source))] String),
    /// File already exists (for operations that require new files)
    #[display("file already exists: {_0}")]
    AlreadyExists(#[error(not(source))] String),
    /// The backend copy changed since the version the caller last saw.
    #[display("version conflict: {_0}")]
    Conflict(#[error(not(source))] String),
    /// Content exceeds the backend's maximum file size.
    #[display("file too large: {size} bytes exceeds limit of {max} bytes")]
    TooLarge { size: u64, max: u64 },
    /// The backend has no way of performing this operation.
    #[display("unsupported operation: {_0}")]
    Unsupported(#[error(not(source))] &'static str),
    /// No usable credentials (missing, expired, or rejected token).
    #[display("unauthenticated")]
    Unauthenticated,
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Network-related error (connections, timeouts, etc.)
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// Path contains invalid characters or escapes root
    #[display("invalid path: {_0}")]
    InvalidPath(#[error(not(source))] String),
    /// Backend-specific error
    #[display("backend error: {_0}")]
    BackendError(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Network(_) | Self::BackendError(_) | Self::Unauthenticated)
    }
}
