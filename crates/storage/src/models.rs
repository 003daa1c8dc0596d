//! Types exchanged between the sync core and backends.

use serde_json::{Map, Value};

/// What a backend needs to know to locate a file.
///
/// Backends address files by `path` (logical workspace path); `id` is the
/// cache identity, which stays the same across renames.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDescriptor {
    pub id: String,
    pub path: String,
    pub workspace_id: Option<String>,
    /// Backend-specific hints (e.g. the last synced version).
    pub metadata: Map<String, Value>,
}
impl FileDescriptor {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            workspace_id: None,
            metadata: Map::new(),
        }
    }

    /// Descriptor whose id is its path, for entries that have no cache
    /// record (yet, or any more).
    pub fn at(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(path.clone(), path)
    }

    pub fn with_workspace(mut self, workspace_id: Option<String>) -> Self {
        self.workspace_id = workspace_id;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The version of the backend copy the caller last synchronised with.
    pub fn expected_version(&self) -> Option<&str> {
        self.metadata.get("synced_version").and_then(Value::as_str)
    }

    /// Storage key relative to the backend root.
    pub fn key(&self) -> crate::error::Result<String> {
        crate::path::validate(&self.path)
    }
}

/// An entry the backend knows about.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    /// Backend identity (may equal the path).
    pub id: String,
    /// Logical path, with a leading slash.
    pub path: String,
    pub is_dir: bool,
    pub metadata: Map<String, Value>,
}
impl RemoteEntry {
    pub fn file(id: impl Into<String>, key: &str) -> Self {
        Self::new(id, key, false)
    }

    pub fn directory(id: impl Into<String>, key: &str) -> Self {
        Self::new(id, key, true)
    }

    fn new(id: impl Into<String>, key: &str, is_dir: bool) -> Self {
        Self {
            id: id.into(),
            path: format!("/{}", key.trim_start_matches('/')),
            is_dir,
            metadata: Map::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.metadata.insert("version".to_string(), Value::String(version.into()));
        self
    }

    pub fn version(&self) -> Option<&str> {
        self.metadata.get("version").and_then(Value::as_str)
    }
}

/// What a backend can do. Callers check these before relying on optional
/// behaviour instead of assuming every backend is the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Pushes change notifications, so polling is unnecessary.
    pub watch: bool,
    /// Exposes a version per file for optimistic concurrency checks.
    pub versioning: bool,
    /// Supports moving a file without re-uploading it.
    pub rename: bool,
    /// Has real directories (rather than key prefixes).
    pub directories: bool,
    /// Accepts several operations in one request.
    pub batch: bool,
    /// Largest accepted file, in bytes.
    pub max_file_size: Option<u64>,
}
impl Capabilities {
    /// Check a push against [`max_file_size`](Self::max_file_size).
    pub fn check_size(&self, size: u64) -> crate::error::Result<()> {
        match self.max_file_size {
            Some(max) if size > max => exn::bail!(crate::error::ErrorKind::TooLarge { size, max }),
            _ => Ok(()),
        }
    }
}
