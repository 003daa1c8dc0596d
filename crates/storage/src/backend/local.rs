//! Local filesystem storage backend.
//!
//! This module provides a storage backend implementation for a workspace that
//! lives in a directory on the local filesystem. Files are accessed using
//! `tokio::fs` for async I/O.

use super::RemoteEntryStream;
use crate::error::{ErrorKind, Result};
use crate::path::validate as validate_path;
use crate::{Capabilities, FileDescriptor, RemoteEntry, StorageBackend};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::create_dir_all as sync_create_dir;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    File(RemoteEntry),
    Dir(RemoteEntry, PathBuf),
    Skip,
}

/// Local filesystem storage backend.
///
/// Stores files in a directory on the local filesystem. All paths are relative
/// to the configured root directory. The file modification time serves as its
/// version.
///
/// # Examples
///
/// ```no_run
/// use verve_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("notes", "/home/me/notes")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory for the workspace
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists but is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root.display().to_string()));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root.display().to_string()));
            }
        } else {
            // Use non-async here; it'll only happen once on workspace
            // initialization and it's not worth making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root.display().to_string()))?;
        }
        Ok(Self { name: name.into(), root })
    }

    /// Get the absolute path for a logical path.
    ///
    /// Validates the path and joins it with the root directory.
    fn absolute_path(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_path(path)?))
    }

    /// Convert an absolute path back to a storage key.
    fn relative_key(&self, absolute: &Path) -> Result<String> {
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{}` is not within root `{}`", absolute.display(), self.root.display()))
        })?;
        let relative = relative
            .to_str()
            .ok_or_else(|| exn::Exn::from(ErrorKind::InvalidPath(relative.display().to_string())))?;
        validate_path(relative)
    }

    fn map_io_error(e: std::io::Error, path: &str) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_string()),
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists(path.to_string()),
            _ => ErrorKind::Io(e),
        }
    }

    fn modified_version(metadata: &std::fs::Metadata) -> Result<String> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?;
        let since_epoch = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
        Ok(since_epoch.as_nanos().to_string())
    }

    /// Keeps the stream loop free of error juggling: convert, yield, continue.
    async fn process_entry(&self, entry: DirEntry) -> Result<WalkEntry> {
        let path = entry.path();
        let display = path.display().to_string();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &display))?;
        let key = self.relative_key(&path)?;
        if metadata.is_dir() {
            return Ok(WalkEntry::Dir(RemoteEntry::directory(format!("/{key}"), &key), path));
        }
        if metadata.is_file() {
            let entry = RemoteEntry::file(format!("/{key}"), &key).with_version(Self::modified_version(&metadata)?);
            return Ok(WalkEntry::File(entry));
        }
        // Note: silently drop what is most likely a broken symlink.
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            watch: false,
            versioning: true,
            rename: true,
            directories: true,
            batch: false,
            max_file_size: None,
        }
    }

    async fn push(&self, file: &FileDescriptor, content: &str) -> Result<()> {
        let abs_path = self.absolute_path(&file.path)?;
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, &file.path))?;
        }
        Ok(fs::write(&abs_path, content).await.map_err(|e| Self::map_io_error(e, &file.path))?)
    }

    async fn pull(&self, file: &FileDescriptor) -> Result<Option<String>> {
        let abs_path = self.absolute_path(&file.path)?;
        match fs::read_to_string(&abs_path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => exn::bail!(Self::map_io_error(e, &file.path)),
        }
    }

    async fn delete(&self, file: &FileDescriptor) -> Result<bool> {
        let abs_path = self.absolute_path(&file.path)?;
        let metadata = match fs::symlink_metadata(&abs_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => exn::bail!(Self::map_io_error(e, &file.path)),
        };
        // Directories are removed only once empty; their children are queued
        // for deletion ahead of them.
        let removed = match metadata.is_dir() {
            true => fs::remove_dir(&abs_path).await,
            false => fs::remove_file(&abs_path).await,
        };
        match removed {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => exn::bail!(Self::map_io_error(e, &file.path)),
        }
    }

    fn list_stream<'a>(&'a self, _workspace_id: Option<&'a str>) -> RemoteEntryStream<'a> {
        let mut stack = vec![self.root.clone()];
        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // A directory removed mid-walk is simply empty.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current.display().to_string())));
                        continue 'dirs;
                    }
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => {
                            yield Err(exn::Exn::from(Self::map_io_error(e, &current.display().to_string())));
                            continue 'entries;
                        },
                    };
                    match self.process_entry(entry).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Dir(d, path)) => {
                            stack.push(path);
                            yield Ok(d);
                        },
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn create_directory(&self, dir: &FileDescriptor) -> Result<()> {
        let abs_path = self.absolute_path(&dir.path)?;
        Ok(fs::create_dir_all(&abs_path).await.map_err(|e| Self::map_io_error(e, &dir.path))?)
    }

    async fn rename(&self, from: &FileDescriptor, to: &FileDescriptor) -> Result<()> {
        let from_path = self.absolute_path(&from.path)?;
        let to_path = self.absolute_path(&to.path)?;
        // Create parent directories for destination if needed
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, &to.path))?;
        }
        Ok(fs::rename(&from_path, &to_path).await.map_err(|e| Self::map_io_error(e, &from.path))?)
    }

    async fn version(&self, file: &FileDescriptor) -> Result<Option<String>> {
        let abs_path = self.absolute_path(&file.path)?;
        match fs::metadata(&abs_path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(Self::modified_version(&metadata)?)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => exn::bail!(Self::map_io_error(e, &file.path)),
        }
    }
}
