//! Persisted, ordered log of pending sync mutations.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::events::CacheEvent;
use crate::models::{NewSyncEntry, QueueCounts, QueueRow, SyncQueueEntry, now, scope_column, to_millis};
use exn::ResultExt;
use sqlx::{SqliteConnection, SqlitePool};
use time::UtcDateTime;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

/// The sync queue.
///
/// Entries are only ever changed by the documented transitions: claimed
/// (`pending → processing`), completed (removed), failed (back to `pending`
/// with an incremented attempt counter, or terminal `failed`), and manually
/// retried (`failed → pending`).
#[derive(Debug, Clone)]
pub struct SyncQueue {
    pool: SqlitePool,
    events: broadcast::Sender<CacheEvent>,
}
impl From<&Database> for SyncQueue {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone(), events: db.events().clone() }
    }
}
/// Insert an entry on an open connection, so that it can share a
/// transaction with record writes.
pub(crate) async fn insert_entry(conn: &mut SqliteConnection, entry: &NewSyncEntry) -> Result<SyncQueueEntry> {
    let payload = entry
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .or_raise(|| ErrorKind::InvalidData("queue payload"))?;
    let row: QueueRow = sqlx::query_as(include_str!("../queries/enqueue.sql"))
        .bind(entry.op.as_str())
        .bind(entry.target.as_str())
        .bind(&entry.target_id)
        .bind(scope_column(entry.workspace_id.as_deref()))
        .bind(payload)
        .bind(to_millis(now()))
        .fetch_one(conn)
        .await
        .map_err(ErrorKind::database)?;
    SyncQueueEntry::try_from(row)
}

impl SyncQueue {
    fn notify(&self) {
        let _ = self.events.send(CacheEvent::QueueChanged);
    }

    fn rows_to_models(rows: Vec<QueueRow>) -> Result<Vec<SyncQueueEntry>> {
        rows.into_iter().map(SyncQueueEntry::try_from).collect()
    }

    /// Append an entry to the end of the queue.
    #[instrument(skip_all, fields(op = %entry.op, target = %entry.target_id))]
    pub async fn enqueue(&self, entry: NewSyncEntry) -> Result<SyncQueueEntry> {
        let mut conn = self.pool.acquire().await.map_err(ErrorKind::database)?;
        let entry = insert_entry(&mut conn, &entry).await?;
        debug!(id = entry.id, "sync entry enqueued");
        self.notify();
        Ok(entry)
    }

    pub async fn get(&self, id: i64) -> Result<Option<SyncQueueEntry>> {
        let row: Option<QueueRow> = sqlx::query_as("SELECT * FROM sync_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        row.map(SyncQueueEntry::try_from).transpose()
    }

    /// Every entry, oldest first.
    pub async fn list(&self) -> Result<Vec<SyncQueueEntry>> {
        let rows: Vec<QueueRow> = sqlx::query_as("SELECT * FROM sync_queue ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        Self::rows_to_models(rows)
    }

    /// Atomically move the oldest eligible `pending` entry with an id greater
    /// than `after` to `processing`.
    ///
    /// An entry is eligible once its backoff has elapsed at `now` and no older
    /// entry in its workspace is still pending or in flight for the same
    /// target or the same backend path. A rename's old path counts as a path
    /// the rename touches.
    pub async fn claim_next(&self, after: i64, now: UtcDateTime) -> Result<Option<SyncQueueEntry>> {
        let row: Option<QueueRow> = sqlx::query_as(include_str!("../queries/claim_next.sql"))
            .bind(after)
            .bind(to_millis(now))
            .fetch_optional(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        row.map(SyncQueueEntry::try_from).transpose()
    }

    /// Remove an entry whose mutation reached the backend.
    pub async fn complete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        self.notify();
        Ok(())
    }

    /// Count a failed attempt on a `processing` entry.
    ///
    /// The entry goes back to `pending` (not claimable before `retry_at`)
    /// until `max_attempts` is reached, then becomes `failed`.
    pub async fn record_failure(
        &self,
        id: i64,
        error: &str,
        max_attempts: u32,
        retry_at: UtcDateTime,
    ) -> Result<Option<SyncQueueEntry>> {
        let row: Option<QueueRow> = sqlx::query_as(include_str!("../queries/record_failure.sql"))
            .bind(i64::from(max_attempts))
            .bind(error)
            .bind(to_millis(retry_at))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        self.notify();
        row.map(SyncQueueEntry::try_from).transpose()
    }

    /// Park a `processing` entry as `failed` straight away, for errors that
    /// no amount of retrying will fix.
    pub async fn fail(&self, id: i64, error: &str) -> Result<Option<SyncQueueEntry>> {
        let row: Option<QueueRow> = sqlx::query_as(include_str!("../queries/fail_entry.sql"))
            .bind(error)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        self.notify();
        row.map(SyncQueueEntry::try_from).transpose()
    }

    /// Put failed entries back in line with a fresh attempt budget. `None`
    /// retries every failed entry. Returns how many entries were reset.
    pub async fn retry_failed(&self, id: Option<i64>) -> Result<u64> {
        let result = sqlx::query(include_str!("../queries/retry_failed.sql"))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        if result.rows_affected() > 0 {
            self.notify();
        }
        Ok(result.rows_affected())
    }

    /// Drop a failed entry the user has given up on.
    pub async fn discard(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ? AND status = 'failed'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        if result.rows_affected() > 0 {
            self.notify();
        }
        Ok(result.rows_affected() > 0)
    }

    /// Return every `processing` entry to `pending`.
    pub async fn reset_processing(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE sync_queue SET status = 'pending' WHERE status = 'processing'")
            .execute(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        Ok(result.rows_affected())
    }

    /// Entry counts per state, for one workspace or (with `None`) all of them.
    ///
    /// Note that unlike other methods, `None` here means "every workspace"
    /// rather than "the default scope".
    pub async fn counts(&self, workspace_id: Option<&str>) -> Result<QueueCounts> {
        let (pending, processing, failed): (i64, i64, i64) = sqlx::query_as(include_str!("../queries/queue_counts.sql"))
            .bind(workspace_id)
            .fetch_one(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        Ok(QueueCounts {
            pending: u64::try_from(pending).or_raise(|| ErrorKind::InvalidData("queue count"))?,
            processing: u64::try_from(processing).or_raise(|| ErrorKind::InvalidData("queue count"))?,
            failed: u64::try_from(failed).or_raise(|| ErrorKind::InvalidData("queue count"))?,
        })
    }

    /// Most recent error message recorded against any entry still queued.
    pub async fn last_error(&self, workspace_id: Option<&str>) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT last_error FROM sync_queue WHERE last_error IS NOT NULL AND (?1 IS NULL OR workspace_id = ?1) ORDER BY id DESC LIMIT 1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ErrorKind::database)?;
        Ok(row.map(|(error,)| error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CachedFile, QueueStatus, SyncOp, WorkspaceType};
    use std::time::Duration;

    async fn queue() -> SyncQueue {
        let db = Database::connect_in_memory().await.unwrap();
        SyncQueue::from(&db)
    }

    fn file(path: &str) -> CachedFile {
        CachedFile::file(path, "x", WorkspaceType::Local, Some("ws1".to_string()))
    }

    #[tokio::test]
    async fn test_enqueue_assigns_increasing_ids() {
        let queue = queue().await;
        let a = queue.enqueue(NewSyncEntry::put(&file("/a.md"))).await.unwrap();
        let b = queue.enqueue(NewSyncEntry::delete(&file("/b.md"))).await.unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.status, QueueStatus::Pending);
        assert_eq!(a.attempts, 0);
        assert_eq!(b.op, SyncOp::Delete);
        assert_eq!(b.payload.unwrap().path, "/b.md");
        assert_eq!(queue.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_exclusive() {
        let queue = queue().await;
        let a = queue.enqueue(NewSyncEntry::put(&file("/a.md"))).await.unwrap();
        let b = queue.enqueue(NewSyncEntry::put(&file("/b.md"))).await.unwrap();
        let first = queue.claim_next(0, now()).await.unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(first.status, QueueStatus::Processing);
        let second = queue.claim_next(0, now()).await.unwrap().unwrap();
        assert_eq!(second.id, b.id);
        assert!(queue.claim_next(0, now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_target_waits_for_older_entry() {
        let queue = queue().await;
        let target = file("/a.md");
        let put = queue.enqueue(NewSyncEntry::put(&target)).await.unwrap();
        let delete = queue.enqueue(NewSyncEntry::delete(&target)).await.unwrap();
        let other = queue.enqueue(NewSyncEntry::put(&file("/b.md"))).await.unwrap();

        let claimed = queue.claim_next(0, now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, put.id);
        // The delete must not overtake the in-flight put; the unrelated entry may.
        let next = queue.claim_next(0, now()).await.unwrap().unwrap();
        assert_eq!(next.id, other.id);

        // Backing off still blocks the delete.
        let later = now() + Duration::from_secs(60);
        queue.record_failure(put.id, "offline", 3, later).await.unwrap();
        assert!(queue.claim_next(0, now()).await.unwrap().is_none());
        let retried = queue.claim_next(0, later).await.unwrap().unwrap();
        assert_eq!(retried.id, put.id);
        queue.complete(put.id).await.unwrap();
        assert_eq!(queue.claim_next(0, now()).await.unwrap().unwrap().id, delete.id);
    }

    #[tokio::test]
    async fn test_new_file_waits_for_rename_away_from_its_path() {
        let queue = queue().await;
        let mut moved = file("/a.md");
        moved.relocate("/b.md");
        let rename = queue.enqueue(NewSyncEntry::rename(&moved, "/a.md")).await.unwrap();
        let mut recreated = file("/a.md");
        recreated.id = "/a.md#1".to_string();
        let put = queue.enqueue(NewSyncEntry::put(&recreated)).await.unwrap();
        // Same path, written without the leading slash.
        let mut bare = file("b.md");
        bare.id = "other".to_string();
        let overwrite = queue.enqueue(NewSyncEntry::put(&bare)).await.unwrap();
        let unrelated = queue.enqueue(NewSyncEntry::put(&file("/c.md"))).await.unwrap();

        assert_eq!(queue.claim_next(0, now()).await.unwrap().unwrap().id, rename.id);
        assert_eq!(queue.claim_next(0, now()).await.unwrap().unwrap().id, unrelated.id);
        assert!(queue.claim_next(0, now()).await.unwrap().is_none());

        queue.complete(rename.id).await.unwrap();
        assert_eq!(queue.claim_next(0, now()).await.unwrap().unwrap().id, put.id);
        assert_eq!(queue.claim_next(0, now()).await.unwrap().unwrap().id, overwrite.id);
    }

    #[tokio::test]
    async fn test_other_workspace_does_not_block() {
        let queue = queue().await;
        let mut moved = file("/a.md");
        moved.relocate("/b.md");
        queue.enqueue(NewSyncEntry::rename(&moved, "/a.md")).await.unwrap();
        let elsewhere = CachedFile::file("/a.md", "x", WorkspaceType::Local, Some("ws2".to_string()));
        let put = queue.enqueue(NewSyncEntry::put(&elsewhere)).await.unwrap();
        queue.claim_next(0, now()).await.unwrap();
        assert_eq!(queue.claim_next(0, now()).await.unwrap().unwrap().id, put.id);
    }

    #[tokio::test]
    async fn test_claim_cursor() {
        let queue = queue().await;
        let a = queue.enqueue(NewSyncEntry::put(&file("/a.md"))).await.unwrap();
        let b = queue.enqueue(NewSyncEntry::put(&file("/b.md"))).await.unwrap();
        assert_eq!(queue.claim_next(a.id, now()).await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn test_failure_until_ceiling() {
        let queue = queue().await;
        let entry = queue.enqueue(NewSyncEntry::put(&file("/a.md"))).await.unwrap();
        for attempt in 1..=3u32 {
            let claimed = queue.claim_next(0, now()).await.unwrap().unwrap();
            let failed = queue.record_failure(claimed.id, "boom", 3, now()).await.unwrap().unwrap();
            assert_eq!(failed.attempts, attempt);
            let expected = if attempt < 3 { QueueStatus::Pending } else { QueueStatus::Failed };
            assert_eq!(failed.status, expected);
        }
        assert!(queue.claim_next(0, now()).await.unwrap().is_none());
        let counts = queue.counts(None).await.unwrap();
        assert_eq!(counts, QueueCounts { pending: 0, processing: 0, failed: 1 });
        assert_eq!(queue.last_error(Some("ws1")).await.unwrap().as_deref(), Some("boom"));

        assert_eq!(queue.retry_failed(Some(entry.id)).await.unwrap(), 1);
        let reset = queue.get(entry.id).await.unwrap().unwrap();
        assert_eq!(reset.status, QueueStatus::Pending);
        assert_eq!(reset.attempts, 0);
        assert!(reset.last_error.is_none());
    }

    #[tokio::test]
    async fn test_fail_is_terminal() {
        let queue = queue().await;
        let entry = queue.enqueue(NewSyncEntry::put(&file("/a.md"))).await.unwrap();
        queue.claim_next(0, now()).await.unwrap();
        let failed = queue.fail(entry.id, "no adapter").await.unwrap().unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.attempts, 1);
        // Not processing any more, so a late failure report is ignored.
        assert!(queue.record_failure(entry.id, "late", 3, now()).await.unwrap().is_none());
        assert!(queue.discard(entry.id).await.unwrap());
        assert!(queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_counts_per_workspace() {
        let queue = queue().await;
        queue.enqueue(NewSyncEntry::put(&file("/a.md"))).await.unwrap();
        let other = CachedFile::file("/a.md", "x", WorkspaceType::S3, Some("ws2".to_string()));
        queue.enqueue(NewSyncEntry::put(&other)).await.unwrap();
        queue.claim_next(0, now()).await.unwrap();
        assert_eq!(queue.counts(Some("ws1")).await.unwrap(), QueueCounts { pending: 0, processing: 1, failed: 0 });
        assert_eq!(queue.counts(Some("ws2")).await.unwrap(), QueueCounts { pending: 1, processing: 0, failed: 0 });
        assert_eq!(queue.counts(None).await.unwrap().pending, 1);
        assert_eq!(queue.reset_processing().await.unwrap(), 1);
        assert_eq!(queue.counts(None).await.unwrap().pending, 2);
    }
}
