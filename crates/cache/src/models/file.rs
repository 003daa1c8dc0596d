use super::{FileType, Metadata, WorkspaceType, from_millis, now, path_key, scope_column, scope_from_column, to_millis};
use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use time::UtcDateTime;

/// The authoritative record for one file or directory in one workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFile {
    /// Stable within a workspace: derived from the path at creation and never
    /// changed by a rename.
    pub id: String,
    pub name: String,
    pub path: String,
    pub file_type: FileType,
    pub workspace_type: WorkspaceType,
    /// `None` is the default/global scope.
    pub workspace_id: Option<String>,
    /// Directories carry no content.
    pub content: String,
    pub metadata: Metadata,
    pub last_modified: UtcDateTime,
    /// Content differs from what was last confirmed written to the backend.
    pub dirty: bool,
    /// Stamped by the store on every write, increasing across the whole
    /// store. Zero until the record is first written.
    pub revision: i64,
}
impl CachedFile {
    pub fn file(
        path: impl Into<String>,
        content: impl Into<String>,
        workspace_type: WorkspaceType,
        workspace_id: Option<String>,
    ) -> Self {
        Self::new(path.into(), FileType::File, content.into(), workspace_type, workspace_id)
    }

    pub fn directory(path: impl Into<String>, workspace_type: WorkspaceType, workspace_id: Option<String>) -> Self {
        Self::new(path.into(), FileType::Dir, String::new(), workspace_type, workspace_id)
    }

    fn new(
        path: String,
        file_type: FileType,
        content: String,
        workspace_type: WorkspaceType,
        workspace_id: Option<String>,
    ) -> Self {
        Self {
            id: path.clone(),
            name: leaf_name(&path).to_string(),
            path,
            file_type,
            workspace_type,
            workspace_id,
            content,
            metadata: Metadata::new(),
            last_modified: now(),
            dirty: false,
            revision: 0,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_dirty(mut self, dirty: bool) -> Self {
        self.dirty = dirty;
        self
    }

    /// What the record's path is matched by.
    pub fn key(&self) -> &str {
        path_key(&self.path)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }

    /// Move the record to a new path, keeping its identity.
    pub fn relocate(&mut self, path: impl Into<String>) {
        self.path = path.into();
        self.name = leaf_name(&self.path).to_string();
        self.last_modified = now();
    }

    /// The version last confirmed written to the backend, if the backend
    /// supports versioning.
    pub fn synced_version(&self) -> Option<&str> {
        self.metadata.get("synced_version").and_then(|v| v.as_str())
    }
}

fn leaf_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

#[derive(sqlx::FromRow)]
pub(crate) struct FileRow {
    pub(crate) id: String,
    pub(crate) workspace_id: String,
    pub(crate) workspace_type: String,
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) key: String,
    pub(crate) file_type: String,
    pub(crate) content: String,
    pub(crate) metadata: String,
    pub(crate) last_modified: i64,
    pub(crate) dirty: bool,
    pub(crate) revision: i64,
}
impl TryFrom<&CachedFile> for FileRow {
    type Error = Error;
    fn try_from(file: &CachedFile) -> Result<Self, Self::Error> {
        Ok(Self {
            id: file.id.clone(),
            workspace_id: scope_column(file.workspace_id.as_deref()).to_string(),
            workspace_type: file.workspace_type.as_str().to_string(),
            name: file.name.clone(),
            path: file.path.clone(),
            key: file.key().to_string(),
            file_type: file.file_type.as_str().to_string(),
            content: file.content.clone(),
            metadata: serde_json::to_string(&file.metadata).or_raise(|| ErrorKind::InvalidData("metadata"))?,
            last_modified: to_millis(file.last_modified),
            dirty: file.dirty,
            revision: file.revision,
        })
    }
}
impl TryFrom<FileRow> for CachedFile {
    type Error = Error;
    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            path: row.path,
            file_type: row.file_type.parse().map_err(|()| ErrorKind::InvalidData("file type"))?,
            workspace_type: row
                .workspace_type
                .parse::<WorkspaceType>()
                .or_raise(|| ErrorKind::InvalidData("workspace type"))?,
            workspace_id: scope_from_column(row.workspace_id),
            content: row.content,
            metadata: serde_json::from_str(&row.metadata).or_raise(|| ErrorKind::InvalidData("metadata"))?,
            last_modified: from_millis(row.last_modified).or_raise(|| ErrorKind::InvalidData("last modified"))?,
            dirty: row.dirty,
            revision: row.revision,
        })
    }
}
