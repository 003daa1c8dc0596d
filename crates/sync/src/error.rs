//! Sync Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Failures from the cache and from
//! storage backends are raised into these kinds, so the full chain stays
//! available for diagnostics.

use derive_more::{Display, Error};
use verve_cache::error::{Error as CacheError, ErrorKind as CacheErrorKind};

/// A sync error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No live cache record at the referenced path or id.
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// A create targeted a path that is already occupied.
    #[display("already exists: {_0}")]
    AlreadyExists(#[error(not(source))] String),
    /// The backend copy changed since it was last synced.
    #[display("version conflict: {_0}")]
    Conflict(#[error(not(source))] String),
    /// No adapter is registered for the workspace.
    #[display("no adapter registered for {_0}")]
    AdapterUnavailable(#[error(not(source))] String),
    /// An adapter call failed.
    #[display("backend failure")]
    BackendFailure,
    /// The cache store could not be reached.
    #[display("cache store unavailable")]
    StoreUnavailable,
    /// The workspace is not known to the [`WorkspaceResolver`], or none is
    /// active.
    ///
    /// [`WorkspaceResolver`]: crate::WorkspaceResolver
    #[display("unknown workspace: {_0}")]
    UnknownWorkspace(#[error(not(source))] String),
    #[display("invalid path: {_0}")]
    InvalidPath(#[error(not(source))] String),
    /// The cache store is reachable but the operation failed (corrupt row,
    /// constraint violation).
    #[display("cache error")]
    Cache,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendFailure | Self::StoreUnavailable)
    }
}

/// Raise cache errors, keeping store availability distinguishable.
pub(crate) trait CacheResultExt<T> {
    fn or_store(self) -> Result<T>;
}

impl<T> CacheResultExt<T> for std::result::Result<T, CacheError> {
    #[track_caller]
    fn or_store(self) -> Result<T> {
        self.map_err(|err| {
            let kind = match &*err {
                CacheErrorKind::Unavailable => ErrorKind::StoreUnavailable,
                _ => ErrorKind::Cache,
            };
            err.raise(kind)
        })
    }
}
