//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, the adapter contract every
//! workspace backend (browser storage, local filesystem, cloud drive,
//! S3-compatible object storage) satisfies.

mod browser;
#[cfg(feature = "drive")]
mod drive;
mod local;
#[cfg(feature = "mock")]
mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use self::browser::BrowserBackend;
#[cfg(feature = "drive")]
pub use self::drive::{DriveBackend, EnvToken, StaticToken, TokenProvider};
pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::memory::MemoryBackend;
#[cfg(feature = "s3")]
pub use self::s3::{S3Backend, S3Settings};
use crate::error::{ErrorKind, Result};
use crate::{Capabilities, FileDescriptor, RemoteEntry};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::pin::Pin;

pub type RemoteEntryStream<'a> = Pin<Box<dyn Stream<Item = Result<RemoteEntry>> + Send + 'a>>;

/// Uniform interface over heterogeneous storage.
///
/// All operations are asynchronous and address files by logical workspace
/// path (see [`FileDescriptor`]). Implementations are expected to apply their
/// own network deadlines.
///
/// # Examples
///
/// ```
/// use verve_storage::{FileDescriptor, backend::StorageBackend, error::Result};
///
/// async fn copy_note(backend: &dyn StorageBackend, from: &str, to: &str) -> Result<bool> {
///     match backend.pull(&FileDescriptor::at(from)).await? {
///         Some(content) => {
///             backend.push(&FileDescriptor::at(to), &content).await?;
///             Ok(true)
///         },
///         None => Ok(false),
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend (used for logging only).
    fn name(&self) -> &str;

    /// Optional behaviour this backend supports.
    fn capabilities(&self) -> Capabilities;

    /// Write (or overwrite) `content` at the descriptor's path.
    ///
    /// Must be idempotent: pushing the same content twice leaves the backend
    /// in the same state. Implementations should create parent directories
    /// as needed. Failure is always an `Err`.
    async fn push(&self, file: &FileDescriptor, content: &str) -> Result<()>;

    /// Fetch the current backend content. `None` means the file does not
    /// exist at the backend.
    async fn pull(&self, file: &FileDescriptor) -> Result<Option<String>>;

    /// Remove the backend object.
    ///
    /// Returns `false` if it was already absent, which callers treat as
    /// success.
    async fn delete(&self, file: &FileDescriptor) -> Result<bool>;

    /// Stream every entry the backend knows about for a workspace.
    fn list_stream<'a>(&'a self, workspace_id: Option<&'a str>) -> RemoteEntryStream<'a>;

    /// Enumerate backend entries, for reconciliation and hydration.
    ///
    /// Default implementation of this method is to collect all the results
    /// from [`list_stream()`](Self::list_stream) into a [`Vec`].
    async fn list_workspace_files(&self, workspace_id: Option<&str>) -> Result<Vec<RemoteEntry>> {
        self.list_stream(workspace_id).try_collect().await
    }

    /// Create a directory. Backends without real directories (see
    /// [`Capabilities::directories`]) have nothing to do.
    async fn create_directory(&self, _dir: &FileDescriptor) -> Result<()> {
        Ok(())
    }

    /// Move a file without re-uploading it.
    ///
    /// Only available when [`Capabilities::rename`] is set. Returns
    /// [`NotFound`](ErrorKind::NotFound) if the source does not exist.
    async fn rename(&self, _from: &FileDescriptor, _to: &FileDescriptor) -> Result<()> {
        exn::bail!(ErrorKind::Unsupported("rename"))
    }

    /// Current backend version of a file, when [`Capabilities::versioning`]
    /// is set. `None` if the file does not exist or versions are unsupported.
    async fn version(&self, _file: &FileDescriptor) -> Result<Option<String>> {
        Ok(None)
    }
}
