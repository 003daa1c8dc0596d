//! Database connection and pool management.

use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::error::{ErrorKind, Result};
use crate::events::{CacheEvent, EVENT_CAPACITY};

/// Embedded migrations that are run automatically on connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
// The processor, the poller and the UI-facing operations can all be in
// flight at once.
const MAX_CONNECTIONS: u32 = 5;

/// Database connection pool for the cache.
///
/// This is the main entry point for interacting with the cache database.
/// It manages the SQLite connection pool, the change notification channel,
/// and provides access to the [`Repository`](crate::Repository) and
/// [`SyncQueue`](crate::SyncQueue).
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    events: broadcast::Sender<CacheEvent>,
}

impl Database {
    async fn new(options: SqliteConnectOptions, max: Option<u32>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // This is IMPORTANT to apply the query-based PRAGMAs to EVERY
            // connection (set by max connections) instead of only the
            // first connection returned by the pool.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(max.unwrap_or(MAX_CONNECTIONS))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Unavailable)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let db = Self { pool, events };
        db.migrate().await?;
        db.recover().await?;
        Ok(db)
    }

    /// Connect to the cache database at the given path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = Self::base_options().filename(path).create_if_missing(true);
        Self::new(options, None).await
    }

    /// Connect to an in-memory database (useful for testing).
    ///
    /// Note:
    /// - In-memory databases are destroyed when the connection closes.
    /// - Do NOT apply `#[cfg(test)]` so that other crates can also use this in their tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        // In-memory database must either use the same cache `.shared_cache(true)`,
        // or be limited to one connection. Otherwise parallel connections will
        // see different databases that contain different data.
        Self::new(options, Some(1)).await
    }

    /// Base connection options shared between file and in-memory databases.
    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            // Enable WAL mode for better concurrent read performance
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            // A write that resolved successfully is assumed durable by every
            // layer above, but NORMAL is still safe against corruption in WAL.
            .synchronous(SqliteSynchronous::Normal)
            // The queue processor and the editor write concurrently; give the
            // single WAL writer time to finish instead of failing with BUSY.
            .busy_timeout(std::time::Duration::from_millis(1500))
            .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::None)
    }

    /// Apply additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA locking_mode = NORMAL;
                PRAGMA wal_autocheckpoint = 800;
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Run database migrations.
    ///
    /// This is called automatically by `connect` and `connect_in_memory`.
    #[instrument("performing database migrations", skip(self))]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    /// Entries left `processing` belong to a previous process that may or may
    /// not have finished them; they go back to `pending`.
    async fn recover(&self) -> Result<()> {
        let reset = crate::SyncQueue::from(self).reset_processing().await?;
        if reset > 0 {
            info!(entries = reset, "reset interrupted sync queue entries to pending");
        }
        Ok(())
    }

    /// Get a reference to the underlying connection pool.
    ///
    /// This is useful for running custom queries or transactions.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Subscribe to raw change events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub(crate) fn events(&self) -> &broadcast::Sender<CacheEvent> {
        &self.events
    }

    /// Close the database connection pool.
    ///
    /// This waits for all connections to be returned to the pool and then
    /// closes them. Any further use fails with
    /// [`Unavailable`](ErrorKind::Unavailable).
    pub async fn close(&self) {
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_in_memory() {
        let db = Database::connect_in_memory().await.unwrap();
        assert!(!db.pool().is_closed());
        db.close().await;
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::connect_in_memory().await.unwrap();
        // Running migrate again should succeed (already applied)
        db.migrate().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_pragmas_are_applied() {
        let db = Database::connect_in_memory().await.unwrap();
        // Verify a PRAGMA set by SqliteConnectOptions
        let row: (i64,) = sqlx::query_as("PRAGMA foreign_keys").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 1, "foreign_keys should be ON");
        // Verify a PRAGMA set by after_connect().
        let row: (i64,) = sqlx::query_as("PRAGMA wal_autocheckpoint").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 800, "WAL checkpoint should be 800");
        db.close().await;
    }

    #[tokio::test]
    async fn test_closed_store_fails_fast() {
        let db = Database::connect_in_memory().await.unwrap();
        db.close().await;
        let err = crate::Repository::from(&db).get("/a.md", None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unavailable));
    }

    #[tokio::test]
    async fn test_reopen_resets_processing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.sqlite");

        let db = Database::connect(&path).await.unwrap();
        let queue = crate::SyncQueue::from(&db);
        let file = crate::models::CachedFile::file("/a.md", "a", crate::models::WorkspaceType::Local, None);
        queue.enqueue(crate::models::NewSyncEntry::put(&file)).await.unwrap();
        let claimed = queue.claim_next(0, crate::models::now()).await.unwrap().unwrap();
        assert_eq!(claimed.status, crate::models::QueueStatus::Processing);
        db.close().await;

        let db = Database::connect(&path).await.unwrap();
        let entry = crate::SyncQueue::from(&db).get(claimed.id).await.unwrap().unwrap();
        assert_eq!(entry.status, crate::models::QueueStatus::Pending);
        db.close().await;
    }
}
