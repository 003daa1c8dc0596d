//! Queue health, as shown to users.

use crate::Context;
use crate::error::{CacheResultExt, Result};
use tracing::info;

/// Snapshot of how far backends lag behind the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub pending: u64,
    pub processing: u64,
    /// Entries parked until somebody retries or discards them.
    pub failed: u64,
    /// Records with changes not yet confirmed by their backend.
    pub dirty: usize,
    pub last_error: Option<String>,
}
impl SyncStatus {
    /// Nothing queued and nothing dirty.
    pub fn is_synced(&self) -> bool {
        self.pending == 0 && self.processing == 0 && self.failed == 0 && self.dirty == 0
    }
}

/// Status of one workspace, or of every workspace with `None`.
pub async fn sync_status(ctx: &Context, workspace_id: Option<&str>) -> Result<SyncStatus> {
    let counts = ctx.queue.counts(workspace_id).await.or_store()?;
    let dirty = match workspace_id {
        Some(_) => ctx.repo.list_dirty(workspace_id).await.or_store()?.len(),
        None => ctx.repo.list_all().await.or_store()?.iter().filter(|f| f.dirty).count(),
    };
    let last_error = ctx.queue.last_error(workspace_id).await.or_store()?;
    Ok(SyncStatus {
        pending: counts.pending,
        processing: counts.processing,
        failed: counts.failed,
        dirty,
        last_error,
    })
}

/// Give failed entries (one, or all with `None`) a fresh attempt budget.
/// Returns how many were requeued.
pub async fn retry_failed(ctx: &Context, id: Option<i64>) -> Result<u64> {
    let requeued = ctx.queue.retry_failed(id).await.or_store()?;
    if requeued > 0 {
        info!(requeued, "requeued failed entries");
    }
    Ok(requeued)
}

/// Drop a failed entry for good. The record stays dirty.
pub async fn discard_failed(ctx: &Context, id: i64) -> Result<bool> {
    ctx.queue.discard(id).await.or_store()
}
