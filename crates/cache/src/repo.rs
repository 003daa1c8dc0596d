//! Repository for [`CachedFile`] records.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::events::{self, CacheEvent, Subscription};
use crate::models::{CachedFile, FileRow, NewSyncEntry, path_key, scope_column};
use crate::queue::insert_entry;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::broadcast;
use tracing::{debug, instrument};

/// Record writes and queue entries that land together or not at all.
///
/// Changes are applied in the order they were added.
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    changes: Vec<Change>,
}
#[derive(Debug, Clone)]
enum Change {
    Upsert(CachedFile),
    Remove { id: String, workspace_id: Option<String> },
    Enqueue(NewSyncEntry),
}
impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or fully replace a record.
    pub fn upsert(&mut self, file: CachedFile) -> &mut Self {
        self.changes.push(Change::Upsert(file));
        self
    }

    /// Remove a record. Removing a record that does not exist is not an error.
    pub fn remove(&mut self, id: impl Into<String>, workspace_id: Option<&str>) -> &mut Self {
        self.changes.push(Change::Remove { id: id.into(), workspace_id: workspace_id.map(str::to_string) });
        self
    }

    /// Append an entry to the sync queue.
    pub fn enqueue(&mut self, entry: NewSyncEntry) -> &mut Self {
        self.changes.push(Change::Enqueue(entry));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Repository for managing cached file and directory records.
///
/// Records are keyed by `(id, workspace_id)` and a path may only be occupied
/// by one record per workspace. Writes replace whole records; callers that
/// want to change one field read, modify, then [`upsert`](Self::upsert).
/// Every successful write is broadcast to observers.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
    events: broadcast::Sender<CacheEvent>,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone(), events: db.events().clone() }
    }
}
impl Repository {
    fn notify(&self, event: CacheEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn rows_to_models(rows: Vec<FileRow>) -> Result<Vec<CachedFile>> {
        rows.into_iter().map(CachedFile::try_from).collect()
    }

    // =========================================================================
    // Insert / Update
    // =========================================================================

    /// Stamp and write one record on an open transaction. Returns the
    /// revision it was stamped with.
    async fn write(conn: &mut SqliteConnection, row: FileRow) -> Result<i64> {
        let (revision,): (i64,) = sqlx::query_as(include_str!("../queries/next_revision.sql"))
            .fetch_one(&mut *conn)
            .await
            .map_err(ErrorKind::database)?;
        sqlx::query(include_str!("../queries/upsert_file.sql"))
            .bind(row.id)
            .bind(row.workspace_id)
            .bind(row.workspace_type)
            .bind(row.name)
            .bind(row.path)
            .bind(row.key)
            .bind(row.file_type)
            .bind(row.content)
            .bind(row.metadata)
            .bind(row.last_modified)
            .bind(row.dirty)
            .bind(revision)
            .execute(&mut *conn)
            .await
            .map_err(ErrorKind::database)?;
        Ok(revision)
    }

    async fn remove(conn: &mut SqliteConnection, id: &str, workspace_id: Option<&str>) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/delete_file.sql"))
            .bind(id)
            .bind(scope_column(workspace_id))
            .execute(conn)
            .await
            .map_err(ErrorKind::database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert or fully replace a record keyed by `(id, workspace_id)`.
    ///
    /// Returns the revision the record was stamped with, or
    /// [`ErrorKind::Constraint`] if a different record already occupies the
    /// same path in the same workspace.
    #[instrument(skip_all, fields(id = %file.id, path = %file.path))]
    pub async fn upsert(&self, file: &CachedFile) -> Result<i64> {
        let row = FileRow::try_from(file)?;
        let mut tx = self.pool.begin().await.map_err(ErrorKind::database)?;
        let revision = Self::write(&mut tx, row).await?;
        tx.commit().await.map_err(ErrorKind::database)?;
        debug!(dirty = file.dirty, revision, "cached file written");
        self.notify(CacheEvent::FileUpserted { id: file.id.clone(), workspace_id: file.workspace_id.clone() });
        Ok(revision)
    }

    /// Apply a [`ChangeSet`] in one transaction. If any change fails, none
    /// of them are applied.
    ///
    /// Returns the revisions stamped on the upserted records, in order.
    #[instrument(skip_all, fields(changes = changes.changes.len()))]
    pub async fn apply(&self, changes: &ChangeSet) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await.map_err(ErrorKind::database)?;
        let mut revisions = Vec::new();
        let mut events = Vec::new();
        for change in &changes.changes {
            match change {
                Change::Upsert(file) => {
                    revisions.push(Self::write(&mut tx, FileRow::try_from(file)?).await?);
                    events.push(CacheEvent::FileUpserted { id: file.id.clone(), workspace_id: file.workspace_id.clone() });
                },
                Change::Remove { id, workspace_id } => {
                    if Self::remove(&mut tx, id, workspace_id.as_deref()).await? {
                        events.push(CacheEvent::FileRemoved { id: id.clone(), workspace_id: workspace_id.clone() });
                    }
                },
                Change::Enqueue(entry) => {
                    let entry = insert_entry(&mut tx, entry).await?;
                    debug!(entry = entry.id, op = %entry.op, target = %entry.target_id, "sync entry enqueued");
                    if !events.contains(&CacheEvent::QueueChanged) {
                        events.push(CacheEvent::QueueChanged);
                    }
                },
            }
        }
        // Dropping the transaction on an early return rolls it back.
        tx.commit().await.map_err(ErrorKind::database)?;
        for event in events {
            self.notify(event);
        }
        Ok(revisions)
    }

    /// Record a successful push of the record as it was at `seen_revision`.
    ///
    /// The backend version (if any) is always remembered, but the dirty flag
    /// is only cleared when nothing has written the record since it was
    /// read. Returns the record as it now stands, or `None` if it no longer
    /// exists.
    pub async fn mark_synced(
        &self,
        id: &str,
        workspace_id: Option<&str>,
        seen_revision: i64,
        version: Option<&str>,
    ) -> Result<Option<CachedFile>> {
        let row: Option<FileRow> = sqlx::query_as(include_str!("../queries/mark_synced.sql"))
            .bind(version)
            .bind(seen_revision)
            .bind(id)
            .bind(scope_column(workspace_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        let file = row.map(CachedFile::try_from).transpose()?;
        if let Some(file) = &file {
            self.notify(CacheEvent::FileUpserted { id: file.id.clone(), workspace_id: file.workspace_id.clone() });
        }
        Ok(file)
    }

    // =========================================================================
    // Select
    // =========================================================================

    /// Point lookup by identity.
    pub async fn get(&self, id: &str, workspace_id: Option<&str>) -> Result<Option<CachedFile>> {
        let row: Option<FileRow> = sqlx::query_as(include_str!("../queries/get_file.sql"))
            .bind(id)
            .bind(scope_column(workspace_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        row.map(CachedFile::try_from).transpose()
    }

    /// Lookup of the live record occupying a path. A leading slash makes no
    /// difference.
    pub async fn get_by_path(&self, path: &str, workspace_id: Option<&str>) -> Result<Option<CachedFile>> {
        let row: Option<FileRow> = sqlx::query_as(include_str!("../queries/get_file_by_path.sql"))
            .bind(path_key(path))
            .bind(scope_column(workspace_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        row.map(CachedFile::try_from).transpose()
    }

    /// All records with the given id, across every workspace.
    pub async fn find_by_id(&self, id: &str) -> Result<Vec<CachedFile>> {
        let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/find_files_by_id.sql"))
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        Self::rows_to_models(rows)
    }

    /// Every record in one workspace, ordered by path.
    pub async fn list(&self, workspace_id: Option<&str>) -> Result<Vec<CachedFile>> {
        let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/list_files.sql"))
            .bind(scope_column(workspace_id))
            .fetch_all(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        Self::rows_to_models(rows)
    }

    /// Every record in every workspace.
    pub async fn list_all(&self) -> Result<Vec<CachedFile>> {
        let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/list_all_files.sql"))
            .fetch_all(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        Self::rows_to_models(rows)
    }

    pub async fn list_dirty(&self, workspace_id: Option<&str>) -> Result<Vec<CachedFile>> {
        let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/list_dirty_files.sql"))
            .bind(scope_column(workspace_id))
            .fetch_all(&self.pool)
            .await
            .map_err(ErrorKind::database)?;
        Self::rows_to_models(rows)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove a record. Returns `false` if there was nothing to remove.
    pub async fn delete(&self, id: &str, workspace_id: Option<&str>) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(ErrorKind::database)?;
        let removed = Self::remove(&mut conn, id, workspace_id).await?;
        if removed {
            self.notify(CacheEvent::FileRemoved { id: id.to_string(), workspace_id: workspace_id.map(str::to_string) });
        }
        Ok(removed)
    }

    // =========================================================================
    // Observe
    // =========================================================================

    /// Subscribe to the live set of records.
    ///
    /// The callback runs once with the current set and again after every
    /// insert, update or delete. Filtering by workspace is up to the caller.
    /// Must be called from within a Tokio runtime.
    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(Vec<CachedFile>) + Send + 'static,
    {
        events::observe(self.clone(), self.events.subscribe(), callback)
    }

    /// Raw change events, for callers that only need to know *that* something
    /// changed.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }
}
