//! In-memory storage backend for testing.

use super::RemoteEntryStream;
use crate::error::{ErrorKind, Result};
use crate::path::validate as validate_path;
use crate::{Capabilities, FileDescriptor, RemoteEntry, StorageBackend};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
enum Stored {
    File { version: u64, content: String },
    Dir,
}

/// In-memory storage backend for testing.
///
/// Entries are stored in a map behind a [`RwLock`], so all trait methods can
/// operate on `&self` without external synchronisation. Every write bumps a
/// per-file version, which makes it usable for exercising optimistic
/// concurrency checks.
///
/// # Examples
///
/// ```
/// use verve_storage::{FileDescriptor, backend::{MemoryBackend, StorageBackend}};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MemoryBackend::with_files([("/notes/a.md", "# A")]);
/// assert_eq!(backend.pull(&FileDescriptor::at("/notes/a.md")).await?.as_deref(), Some("# A"));
///
/// backend.push(&FileDescriptor::at("/b.md"), "data...").await?;
/// assert_eq!(backend.content("/b.md").await.as_deref(), Some("data..."));
/// # Ok(())
/// # }
/// ```
pub struct MemoryBackend {
    name: String,
    capabilities: Capabilities,
    storage: RwLock<BTreeMap<String, Stored>>,
    versions: AtomicU64,
}

impl MemoryBackend {
    /// Create a memory backend pre-populated with files.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
        let mut map = BTreeMap::new();
        let mut version = 0;
        for (path, content) in files {
            let path = path.into();
            let Ok(key) = validate_path(&path) else {
                // The panic here is DELIBERATE. MemoryBackend is intended to be
                // used in tests; panics are expected. There is no error result.
                panic!("MemoryBackend::with_files: invalid path {path}");
            };
            version += 1;
            map.insert(key, Stored::File { version, content: content.into() });
        }
        Self {
            name: "memory".to_string(),
            capabilities: Capabilities {
                watch: false,
                versioning: true,
                rename: true,
                directories: true,
                batch: false,
                max_file_size: None,
            },
            storage: RwLock::new(map),
            versions: AtomicU64::new(version),
        }
    }

    /// Change the name of the memory backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Pretend to be a backend with different abilities.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Content currently stored at a path, bypassing the trait.
    pub async fn content(&self, path: &str) -> Option<String> {
        let key = validate_path(path).ok()?;
        match self.storage.read().await.get(&key) {
            Some(Stored::File { content, .. }) => Some(content.clone()),
            _ => None,
        }
    }

    /// Whether a directory exists at a path.
    pub async fn has_directory(&self, path: &str) -> bool {
        let Ok(key) = validate_path(path) else { return false };
        matches!(self.storage.read().await.get(&key), Some(Stored::Dir))
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }
}
impl Default for MemoryBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn push(&self, file: &FileDescriptor, content: &str) -> Result<()> {
        let key = file.key()?;
        self.capabilities.check_size(content.len() as u64)?;
        let version = self.next_version();
        let mut guard = self.storage.write().await;
        if let Some(Stored::Dir) = guard.get(&key) {
            exn::bail!(ErrorKind::AlreadyExists(file.path.clone()));
        }
        guard.insert(key, Stored::File { version, content: content.to_string() });
        Ok(())
    }

    async fn pull(&self, file: &FileDescriptor) -> Result<Option<String>> {
        let key = file.key()?;
        Ok(match self.storage.read().await.get(&key) {
            Some(Stored::File { content, .. }) => Some(content.clone()),
            _ => None,
        })
    }

    async fn delete(&self, file: &FileDescriptor) -> Result<bool> {
        let key = file.key()?;
        Ok(self.storage.write().await.remove(&key).is_some())
    }

    fn list_stream<'a>(&'a self, _workspace_id: Option<&'a str>) -> RemoteEntryStream<'a> {
        Box::pin(stream! {
            // Snapshot entries under the read lock, then drop it before
            // yielding to avoid holding the lock across yield points.
            let entries: Vec<RemoteEntry> = {
                let guard = self.storage.read().await;
                guard
                    .iter()
                    .map(|(key, stored)| match stored {
                        Stored::File { version, .. } => RemoteEntry::file(key.clone(), key).with_version(version.to_string()),
                        Stored::Dir => RemoteEntry::directory(key.clone(), key),
                    })
                    .collect()
            };
            for entry in entries {
                yield Ok(entry);
            }
        })
    }

    async fn create_directory(&self, dir: &FileDescriptor) -> Result<()> {
        let key = dir.key()?;
        let mut guard = self.storage.write().await;
        match guard.get(&key) {
            Some(Stored::File { .. }) => exn::bail!(ErrorKind::AlreadyExists(dir.path.clone())),
            Some(Stored::Dir) => Ok(()),
            None => {
                guard.insert(key, Stored::Dir);
                Ok(())
            },
        }
    }

    async fn rename(&self, from: &FileDescriptor, to: &FileDescriptor) -> Result<()> {
        let (from_key, to_key) = (from.key()?, to.key()?);
        let mut guard = self.storage.write().await;
        let stored = guard.remove(&from_key).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(from.path.clone())))?;
        guard.insert(to_key, stored);
        Ok(())
    }

    async fn version(&self, file: &FileDescriptor) -> Result<Option<String>> {
        let key = file.key()?;
        Ok(match self.storage.read().await.get(&key) {
            Some(Stored::File { version, .. }) => Some(version.to_string()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_and_pull() {
        let backend = MemoryBackend::default();
        backend.push(&FileDescriptor::at("/test.md"), "hello").await.unwrap();
        let data = backend.pull(&FileDescriptor::at("test.md")).await.unwrap();
        assert_eq!(data.as_deref(), Some("hello"));
        assert!(backend.pull(&FileDescriptor::at("/missing.md")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_bumps_version() {
        let backend = MemoryBackend::with_files([("/a.md", "one")]);
        let file = FileDescriptor::at("/a.md");
        let before = backend.version(&file).await.unwrap().unwrap();
        backend.push(&file, "two").await.unwrap();
        let after = backend.version(&file).await.unwrap().unwrap();
        assert_ne!(before, after);
        assert!(backend.version(&FileDescriptor::at("/b.md")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_reports_absence() {
        let backend = MemoryBackend::with_files([("/a.md", "x")]);
        assert!(backend.delete(&FileDescriptor::at("/a.md")).await.unwrap());
        assert!(!backend.delete(&FileDescriptor::at("/a.md")).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename() {
        let backend = MemoryBackend::with_files([("/old.md", "data")]);
        backend.rename(&FileDescriptor::at("/old.md"), &FileDescriptor::at("/new.md")).await.unwrap();
        assert!(backend.content("/old.md").await.is_none());
        assert_eq!(backend.content("/new.md").await.as_deref(), Some("data"));
        let err = backend.rename(&FileDescriptor::at("/old.md"), &FileDescriptor::at("/x.md")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_directories() {
        let backend = MemoryBackend::default();
        backend.create_directory(&FileDescriptor::at("/notes")).await.unwrap();
        // Idempotent.
        backend.create_directory(&FileDescriptor::at("/notes")).await.unwrap();
        assert!(backend.has_directory("/notes").await);
        let err = backend.push(&FileDescriptor::at("/notes"), "x").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_list() {
        let backend = MemoryBackend::with_files([("/b.md", "b"), ("/a/c.md", "c")]);
        backend.create_directory(&FileDescriptor::at("/a")).await.unwrap();
        let entries = backend.list_workspace_files(None).await.unwrap();
        let paths: Vec<_> = entries.iter().map(|e| (e.path.as_str(), e.is_dir)).collect();
        assert_eq!(paths, vec![("/a", true), ("/a/c.md", false), ("/b.md", false)]);
        assert!(entries[1].version().is_some());
    }

    #[tokio::test]
    async fn test_max_file_size() {
        let caps = Capabilities { max_file_size: Some(3), ..Default::default() };
        let backend = MemoryBackend::default().with_capabilities(caps);
        let err = backend.push(&FileDescriptor::at("/a.md"), "toolong").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::TooLarge { size: 7, max: 3 }));
    }
}
