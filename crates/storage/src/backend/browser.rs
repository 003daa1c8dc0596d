//! Browser-style persistent keyed storage.
//!
//! Mirrors the storage a browser workspace gets: one keyed document per
//! workspace (`verve_files_<workspace>`), holding every file and folder of
//! that workspace. Documents are JSON files in a directory, rewritten
//! atomically on every change.

use super::RemoteEntryStream;
use crate::error::{ErrorKind, Result};
use crate::{Capabilities, FileDescriptor, RemoteEntry, StorageBackend};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// Prefix of every storage key.
const STORAGE_KEY_PREFIX: &str = "verve_files";
/// Browser storage quotas make large documents impractical.
const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    id: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(rename = "type")]
    kind: EntryKind,
    version: u64,
    /// Unix timestamp, in milliseconds.
    last_modified: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    File,
    Dir,
}

/// One workspace's document, keyed by storage key.
type Document = BTreeMap<String, StoredEntry>;

/// Persistent keyed storage backend.
///
/// Pushes are checked against the version the caller last synced with (the
/// `synced_version` descriptor hint) and rejected with
/// [`Conflict`](ErrorKind::Conflict) if the stored copy moved on.
pub struct BrowserBackend {
    name: String,
    dir: PathBuf,
    /// Serialises read-modify-write cycles on documents.
    lock: Mutex<()>,
}

impl BrowserBackend {
    /// Store workspace documents in `dir` (created if missing).
    pub fn new(name: impl Into<String>, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| exn::Exn::new(ErrorKind::Io(e)))?;
        Ok(Self { name: name.into(), dir, lock: Mutex::new(()) })
    }

    /// Storage key of a workspace's document. Anything that is not safe in a
    /// file name is replaced.
    pub fn storage_key(workspace_id: Option<&str>) -> String {
        let scope: String = workspace_id
            .unwrap_or("default")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{STORAGE_KEY_PREFIX}_{scope}")
    }

    fn document_path(&self, workspace_id: Option<&str>) -> PathBuf {
        self.dir.join(format!("{}.json", Self::storage_key(workspace_id)))
    }

    async fn load(&self, workspace_id: Option<&str>) -> Result<Document> {
        let path = self.document_path(workspace_id);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .or_raise(|| ErrorKind::BackendError(format!("corrupt document {}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::new()),
            Err(e) => exn::bail!(ErrorKind::Io(e)),
        }
    }

    async fn save(&self, workspace_id: Option<&str>, document: &Document) -> Result<()> {
        let path = self.document_path(workspace_id);
        let json = serde_json::to_vec(document).or_raise(|| ErrorKind::BackendError("unserializable document".to_string()))?;
        // Write-then-rename so that a crash never leaves half a document.
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json).await.map_err(ErrorKind::Io)?;
        fs::rename(&staging, &path).await.map_err(ErrorKind::Io)?;
        debug!(document = %path.display(), entries = document.len(), "browser document saved");
        Ok(())
    }

    fn now_millis() -> i64 {
        (UtcDateTime::now().unix_timestamp_nanos() / 1_000_000) as i64
    }
}

#[async_trait]
impl StorageBackend for BrowserBackend {
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
            max_file_size: Some(MAX_FILE_SIZE),
        }
    }

    async fn push(&self, file: &FileDescriptor, content: &str) -> Result<()> {
        let key = file.key()?;
        self.capabilities().check_size(content.len() as u64)?;
        let _guard = self.lock.lock().await;
        let mut document = self.load(file.workspace_id.as_deref()).await?;
        let version = match document.get(&key) {
            Some(existing) if existing.kind == EntryKind::Dir => {
                exn::bail!(ErrorKind::AlreadyExists(file.path.clone()))
            },
            Some(existing) => {
                if let Some(expected) = file.expected_version()
                    && expected != existing.version.to_string()
                {
                    exn::bail!(ErrorKind::Conflict(file.path.clone()));
                }
                existing.version + 1
            },
            None => 1,
        };
        let name = crate::path::file_name(&file.path).to_string();
        document.insert(
            key,
            StoredEntry {
                id: file.id.clone(),
                name,
                content: Some(content.to_string()),
                kind: EntryKind::File,
                version,
                last_modified: Self::now_millis(),
            },
        );
        self.save(file.workspace_id.as_deref(), &document).await
    }

    async fn pull(&self, file: &FileDescriptor) -> Result<Option<String>> {
        let key = file.key()?;
        let document = self.load(file.workspace_id.as_deref()).await?;
        Ok(document.get(&key).and_then(|entry| entry.content.clone()))
    }

    async fn delete(&self, file: &FileDescriptor) -> Result<bool> {
        let key = file.key()?;
        let _guard = self.lock.lock().await;
        let mut document = self.load(file.workspace_id.as_deref()).await?;
        if document.remove(&key).is_none() {
            return Ok(false);
        }
        self.save(file.workspace_id.as_deref(), &document).await?;
        Ok(true)
    }

    fn list_stream<'a>(&'a self, workspace_id: Option<&'a str>) -> RemoteEntryStream<'a> {
        Box::pin(stream! {
            let document = match self.load(workspace_id).await {
                Ok(document) => document,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for (key, entry) in document {
                yield Ok(match entry.kind {
                    EntryKind::File => RemoteEntry::file(entry.id, &key).with_version(entry.version.to_string()),
                    EntryKind::Dir => RemoteEntry::directory(entry.id, &key),
                });
            }
        })
    }

    async fn create_directory(&self, dir: &FileDescriptor) -> Result<()> {
        let key = dir.key()?;
        let _guard = self.lock.lock().await;
        let mut document = self.load(dir.workspace_id.as_deref()).await?;
        match document.get(&key) {
            Some(existing) if existing.kind == EntryKind::File => exn::bail!(ErrorKind::AlreadyExists(dir.path.clone())),
            Some(_) => return Ok(()),
            None => {},
        }
        let entry = StoredEntry {
            id: dir.id.clone(),
            name: crate::path::file_name(&dir.path).to_string(),
            content: None,
            kind: EntryKind::Dir,
            version: 1,
            last_modified: Self::now_millis(),
        };
        document.insert(key, entry);
        self.save(dir.workspace_id.as_deref(), &document).await
    }

    async fn rename(&self, from: &FileDescriptor, to: &FileDescriptor) -> Result<()> {
        let (from_key, to_key) = (from.key()?, to.key()?);
        let _guard = self.lock.lock().await;
        let mut document = self.load(from.workspace_id.as_deref()).await?;
        if document.contains_key(&to_key) {
            exn::bail!(ErrorKind::AlreadyExists(to.path.clone()));
        }
        let mut entry = document.remove(&from_key).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(from.path.clone())))?;
        entry.name = crate::path::file_name(&to.path).to_string();
        entry.version += 1;
        entry.last_modified = Self::now_millis();
        document.insert(to_key, entry);
        self.save(from.workspace_id.as_deref(), &document).await
    }

    async fn version(&self, file: &FileDescriptor) -> Result<Option<String>> {
        let key = file.key()?;
        let document = self.load(file.workspace_id.as_deref()).await?;
        Ok(document
            .get(&key)
            .filter(|entry| entry.kind == EntryKind::File)
            .map(|entry| entry.version.to_string()))
    }
}
