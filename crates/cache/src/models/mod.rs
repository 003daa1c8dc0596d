//! Domain types persisted by the cache, and their database row shapes.

mod file;
mod queue;

pub use self::file::CachedFile;
pub(crate) use self::file::FileRow;
pub use self::queue::{NewSyncEntry, QueueCounts, QueueStatus, SyncOp, SyncPayload, SyncQueueEntry, SyncTarget};
pub(crate) use self::queue::QueueRow;
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use time::UtcDateTime;

/// Open bag of backend-specific or historical fields attached to a record.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Kind of backend that is authoritative for a workspace. Selects the
/// adapter a queue entry is routed to.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceType {
    /// Browser-local storage. The cache *is* the backend, so nothing is ever
    /// queued or marked dirty.
    #[display("browser")]
    Browser,
    /// Native filesystem directory.
    #[display("local")]
    Local,
    /// Cloud drive.
    #[display("drive")]
    #[serde(alias = "gdrive")]
    Drive,
    /// S3-compatible object storage.
    #[display("s3")]
    S3,
}
impl WorkspaceType {
    pub const ALL: [WorkspaceType; 4] = [Self::Browser, Self::Local, Self::Drive, Self::S3];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Local => "local",
            Self::Drive => "drive",
            Self::S3 => "s3",
        }
    }

    /// Whether changes in this kind of workspace have to be pushed anywhere.
    pub fn propagates(&self) -> bool {
        !matches!(self, Self::Browser)
    }
}

#[derive(Debug, Display, Error)]
#[display("unknown workspace type: {_0}")]
pub struct UnknownWorkspaceType(#[error(not(source))] pub String);

impl FromStr for WorkspaceType {
    type Err = UnknownWorkspaceType;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "browser" => Ok(Self::Browser),
            "local" => Ok(Self::Local),
            "drive" | "gdrive" => Ok(Self::Drive),
            "s3" => Ok(Self::S3),
            _ => Err(UnknownWorkspaceType(s.to_string())),
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    #[display("file")]
    File,
    #[display("dir")]
    Dir,
}
impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
        }
    }
}
impl FromStr for FileType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "dir" => Ok(Self::Dir),
            _ => Err(()),
        }
    }
}

/// Timestamps are persisted as unix milliseconds.
pub(crate) fn to_millis(at: UtcDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(millis: i64) -> Result<UtcDateTime, time::error::ComponentRange> {
    UtcDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
}

/// Current time at the precision the store keeps, so that a freshly built
/// record compares equal to the same record read back.
pub fn now() -> UtcDateTime {
    let now = UtcDateTime::now();
    from_millis(to_millis(now)).unwrap_or(now)
}

/// The key a path is matched by: `/notes/a.md` and `notes/a.md` name the
/// same entry.
pub fn path_key(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// The workspace scope column cannot be NULL (it is part of the primary key),
/// so the default scope is stored as an empty string.
pub(crate) fn scope_column(workspace_id: Option<&str>) -> &str {
    workspace_id.unwrap_or("")
}

pub(crate) fn scope_from_column(column: String) -> Option<String> {
    (!column.is_empty()).then_some(column)
}
