//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The store could not be opened or reached (not initialized, pool
    /// closed, timed out waiting for a connection). Nothing was written.
    #[display("cache store unavailable")]
    Unavailable,
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// A write would break a uniqueness rule, such as two live entries
    /// sharing a path in the same workspace.
    #[display("constraint violation")]
    Constraint,
    /// Serialization/deserialization error.
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    /// Classify a driver error, keeping it as the child of the raised frame.
    #[track_caller]
    pub(crate) fn database(err: sqlx::Error) -> Error {
        let kind = match &err {
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Self::Unavailable,
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Constraint,
            _ => Self::Database,
        };
        exn::Exn::new(err).raise(kind)
    }
}
