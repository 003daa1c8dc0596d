use super::{CachedFile, FileType, WorkspaceType, from_millis, scope_from_column};
use crate::error::{Error, ErrorKind};
use derive_more::Display;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use time::UtcDateTime;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    #[display("put")]
    Put,
    #[display("delete")]
    Delete,
}
impl SyncOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Delete => "delete",
        }
    }
}
impl FromStr for SyncOp {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "put" => Ok(Self::Put),
            "delete" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

/// What a queue entry refers to. Only files (and directories, which are
/// cached files too) exist today.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    #[display("file")]
    File,
}
impl SyncTarget {
    pub fn as_str(&self) -> &'static str {
        "file"
    }
}
impl FromStr for SyncTarget {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            _ => Err(()),
        }
    }
}

/// `pending → processing → (removed | pending | failed)`.
///
/// Completed entries are deleted rather than kept with a status.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    #[display("pending")]
    Pending,
    #[display("processing")]
    Processing,
    #[display("failed")]
    Failed,
}
impl FromStr for QueueStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

/// Context captured when the entry was enqueued. For deletes this is the only
/// record of where the file lived, since the cache record is already gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub path: String,
    pub workspace_type: WorkspaceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub file_type: FileType,
    /// Previous path when the put was caused by a rename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}
impl From<&CachedFile> for SyncPayload {
    fn from(file: &CachedFile) -> Self {
        Self {
            path: file.path.clone(),
            workspace_type: file.workspace_type,
            workspace_id: file.workspace_id.clone(),
            file_type: file.file_type,
            renamed_from: None,
        }
    }
}

/// An entry that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncEntry {
    pub op: SyncOp,
    pub target: SyncTarget,
    pub target_id: String,
    pub workspace_id: Option<String>,
    pub payload: Option<SyncPayload>,
}
impl NewSyncEntry {
    pub fn put(file: &CachedFile) -> Self {
        Self::for_file(SyncOp::Put, file)
    }

    /// A put that moves the backend object away from `old_path`.
    pub fn rename(file: &CachedFile, old_path: impl Into<String>) -> Self {
        let mut entry = Self::for_file(SyncOp::Put, file);
        if let Some(payload) = entry.payload.as_mut() {
            payload.renamed_from = Some(old_path.into());
        }
        entry
    }

    pub fn delete(file: &CachedFile) -> Self {
        Self::for_file(SyncOp::Delete, file)
    }

    fn for_file(op: SyncOp, file: &CachedFile) -> Self {
        Self {
            op,
            target: SyncTarget::File,
            target_id: file.id.clone(),
            workspace_id: file.workspace_id.clone(),
            payload: Some(SyncPayload::from(file)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueEntry {
    pub id: i64,
    pub op: SyncOp,
    pub target: SyncTarget,
    pub target_id: String,
    pub workspace_id: Option<String>,
    pub payload: Option<SyncPayload>,
    pub attempts: u32,
    pub status: QueueStatus,
    pub last_error: Option<String>,
    pub created_at: UtcDateTime,
    /// Earliest time the entry may be claimed again after a failure.
    pub next_attempt_at: UtcDateTime,
}

/// Number of queue entries in each state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
}
impl QueueCounts {
    pub fn is_empty(&self) -> bool {
        self.pending == 0 && self.processing == 0 && self.failed == 0
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct QueueRow {
    pub(crate) id: i64,
    pub(crate) op: String,
    pub(crate) target: String,
    pub(crate) target_id: String,
    pub(crate) workspace_id: String,
    pub(crate) payload: Option<String>,
    pub(crate) attempts: i64,
    pub(crate) status: String,
    pub(crate) last_error: Option<String>,
    pub(crate) created_at: i64,
    pub(crate) next_attempt_at: i64,
}
impl TryFrom<QueueRow> for SyncQueueEntry {
    type Error = Error;
    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            op: row.op.parse().map_err(|()| ErrorKind::InvalidData("queue op"))?,
            target: row.target.parse().map_err(|()| ErrorKind::InvalidData("queue target"))?,
            target_id: row.target_id,
            workspace_id: scope_from_column(row.workspace_id),
            payload: row
                .payload
                .map(|json| serde_json::from_str(&json))
                .transpose()
                .or_raise(|| ErrorKind::InvalidData("queue payload"))?,
            attempts: u32::try_from(row.attempts).or_raise(|| ErrorKind::InvalidData("attempts"))?,
            status: row.status.parse().map_err(|()| ErrorKind::InvalidData("queue status"))?,
            last_error: row.last_error,
            created_at: from_millis(row.created_at).or_raise(|| ErrorKind::InvalidData("created at"))?,
            next_attempt_at: from_millis(row.next_attempt_at).or_raise(|| ErrorKind::InvalidData("next attempt"))?,
        })
    }
}
