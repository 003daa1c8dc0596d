//! Queue processing: propagating queued mutations to backends.
//!
//! A pass walks the queue oldest-first. Each entry is claimed (`pending →
//! processing`), handed to the adapter registered for its workspace, then
//! either removed (success), put back with a backoff (retryable failure), or
//! parked as `failed` (retry budget spent, or an error retrying cannot fix).
//! Nothing is ever dropped silently: parked entries stay visible until
//! somebody retries or discards them.

use crate::Context;
use crate::error::{CacheResultExt, ErrorKind, Result};
use crate::merge::MergeOutcome;
use exn::Exn;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use verve_cache::models::now;
use verve_cache::{CachedFile, FileType, QueueStatus, SyncOp, SyncPayload, SyncQueueEntry, WorkspaceType};
use verve_storage::error::{Error as StorageError, ErrorKind as StorageErrorKind};
use verve_storage::{BackendHandle, FileDescriptor};

/// How often, and how patiently, failed entries are retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before an entry is parked as failed.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles with every further failure.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Spread retries by up to half the delay so failures do not retry in
    /// lockstep.
    pub jitter: bool,
}
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            jitter: true,
        }
    }
}
impl RetryPolicy {
    /// Retry immediately (on the next pass), for tests and manual draining.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before the next attempt, after `attempt` failures (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_backoff.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_backoff.as_secs_f64()));
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() / 2.0;
        Duration::from_secs_f64(delay.as_secs_f64() - spread + rand::rng().random_range(0.0..=spread))
    }
}

/// What a single pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessReport {
    /// Entries that reached their backend and were removed.
    pub completed: usize,
    /// Entries that failed and will be retried after their backoff.
    pub retried: usize,
    /// Entries parked as failed during this pass.
    pub failed: usize,
    /// Of the parked entries, how many were version conflicts.
    pub conflicts: usize,
}
impl ProcessReport {
    /// Whether the pass claimed anything at all.
    pub fn is_idle(&self) -> bool {
        self.completed == 0 && self.retried == 0 && self.failed == 0
    }
}

/// Why an entry did not complete.
enum Failure {
    /// Might succeed later.
    Transient(String),
    /// Retrying cannot help.
    Permanent(String),
    /// The backend copy moved on; routed to the merge strategy already.
    Conflict(String),
}
impl Failure {
    fn from_storage(err: StorageError, context: &str) -> Self {
        let message = format!("{context}: {}", error_chain(&err));
        match &*err {
            StorageErrorKind::Conflict(_) => Self::Conflict(message),
            kind if kind.is_retryable() => Self::Transient(message),
            _ => Self::Permanent(message),
        }
    }
}
impl From<Exn<ErrorKind>> for Failure {
    fn from(err: Exn<ErrorKind>) -> Self {
        let message = error_chain(&err);
        match &*err {
            ErrorKind::Conflict(_) => Self::Conflict(message),
            kind if kind.is_retryable() => Self::Transient(message),
            _ => Self::Permanent(message),
        }
    }
}

/// An error and its causes, outermost first.
pub(crate) fn error_chain<E>(err: &Exn<E>) -> String
where
    E: std::error::Error + Send + Sync + 'static,
{
    let mut parts = vec![err.to_string()];
    let mut frame = err.frame();
    while let Some(child) = frame.children().first() {
        let text = child.error().to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        frame = child;
    }
    parts.join(": ")
}

/// Run one pass over the queue.
///
/// Every eligible entry is attempted at most once per pass; entries that
/// fail wait for their backoff and the next pass. An entry waits while an
/// older entry for the same file is still queued, so a delete never
/// overtakes the put before it. Only a cache store failure aborts the pass.
#[instrument(skip(ctx))]
pub async fn process_pending_queue_once(ctx: &Context) -> Result<ProcessReport> {
    let mut report = ProcessReport::default();
    let mut cursor = 0;
    while let Some(entry) = ctx.queue.claim_next(cursor, now()).await.or_store()? {
        cursor = entry.id;
        debug!(entry = entry.id, op = %entry.op, target = %entry.target_id, attempt = entry.attempts + 1, "processing");
        match process_entry(ctx, &entry).await {
            Ok(()) => {
                ctx.queue.complete(entry.id).await.or_store()?;
                report.completed += 1;
            },
            Err(Failure::Transient(message)) => {
                let attempt = entry.attempts + 1;
                let retry_at = now() + ctx.retry.backoff(attempt);
                let updated = ctx
                    .queue
                    .record_failure(entry.id, &message, ctx.retry.max_attempts, retry_at)
                    .await
                    .or_store()?;
                match updated.map(|e| e.status) {
                    Some(QueueStatus::Failed) => {
                        error!(entry = entry.id, target = %entry.target_id, attempts = attempt, "giving up: {message}");
                        report.failed += 1;
                    },
                    _ => {
                        warn!(entry = entry.id, target = %entry.target_id, attempt, "will retry: {message}");
                        report.retried += 1;
                    },
                }
            },
            Err(Failure::Permanent(message)) => {
                error!(entry = entry.id, target = %entry.target_id, "failed: {message}");
                ctx.queue.fail(entry.id, &message).await.or_store()?;
                report.failed += 1;
            },
            Err(Failure::Conflict(message)) => {
                error!(entry = entry.id, target = %entry.target_id, "conflict: {message}");
                ctx.queue.fail(entry.id, &message).await.or_store()?;
                report.failed += 1;
                report.conflicts += 1;
            },
        }
    }
    if !report.is_idle() {
        info!(
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            conflicts = report.conflicts,
            "queue pass finished"
        );
    }
    Ok(report)
}

async fn process_entry(ctx: &Context, entry: &SyncQueueEntry) -> std::result::Result<(), Failure> {
    match entry.op {
        SyncOp::Put => process_put(ctx, entry).await,
        SyncOp::Delete => process_delete(ctx, entry).await,
    }
}

fn resolve_adapter(
    ctx: &Context,
    kind: WorkspaceType,
    workspace_id: Option<&str>,
) -> std::result::Result<BackendHandle, Failure> {
    ctx.registry.resolve(kind, workspace_id).cloned().ok_or_else(|| {
        let scope = workspace_id.map(|id| format!("{kind} workspace {id}")).unwrap_or_else(|| kind.to_string());
        Failure::from(Exn::from(ErrorKind::AdapterUnavailable(scope)))
    })
}

/// The record a put refers to. `None` means it was deleted after the put was
/// queued, and the delete that followed will take care of the backend.
async fn load_target(ctx: &Context, entry: &SyncQueueEntry) -> std::result::Result<Option<CachedFile>, Failure> {
    let workspace_id = entry.workspace_id.as_deref();
    if let Some(file) = ctx.repo.get(&entry.target_id, workspace_id).await.or_store()? {
        return Ok(Some(file));
    }
    if entry.payload.is_some() {
        return Ok(None);
    }
    // Without a payload the scope is not trustworthy; look everywhere.
    let mut found = ctx.repo.find_by_id(&entry.target_id).await.or_store()?;
    match found.len() {
        0 | 1 => Ok(found.pop()),
        n => Err(Failure::Permanent(format!("{}: ambiguous target ({n} workspaces)", entry.target_id))),
    }
}

fn descriptor(file: &CachedFile) -> FileDescriptor {
    FileDescriptor::new(&file.id, &file.path)
        .with_workspace(file.workspace_id.clone())
        .with_metadata(file.metadata.clone())
}

async fn process_put(ctx: &Context, entry: &SyncQueueEntry) -> std::result::Result<(), Failure> {
    let Some(file) = load_target(ctx, entry).await? else {
        debug!(target = %entry.target_id, "record is gone; nothing to push");
        return Ok(());
    };
    let adapter = resolve_adapter(ctx, file.workspace_type, file.workspace_id.as_deref())?;
    let caps = adapter.capabilities();
    let mut target = descriptor(&file);
    let renamed_from = entry
        .payload
        .as_ref()
        .and_then(|p| p.renamed_from.as_deref())
        .filter(|old| *old != file.path);
    let mut source = None;
    if let Some(old) = renamed_from {
        // The version recorded for the old location says nothing about the
        // new one.
        target.metadata.remove("synced_version");
        let old = FileDescriptor::new(&file.id, old).with_workspace(file.workspace_id.clone());
        match owns_old_copy(&adapter, &file, &old).await? {
            true => source = Some(old),
            false => debug!(path = %old.path, "old path holds another copy; leaving it alone"),
        }
    }

    if let Some(source) = &source
        && caps.rename
    {
        match adapter.rename(source, &target).await {
            Ok(()) => debug!(from = %source.path, to = %target.path, "renamed at backend"),
            // Never pushed under the old name (or already moved).
            Err(err) if matches!(&*err, StorageErrorKind::NotFound(_)) => {},
            Err(err) => return Err(Failure::from_storage(err, &target.path)),
        }
    }

    let version = if file.is_dir() {
        if caps.directories {
            adapter.create_directory(&target).await.map_err(|e| Failure::from_storage(e, &target.path))?;
        }
        None
    } else {
        caps.check_size(file.content.len() as u64).map_err(|e| Failure::from_storage(e, &file.path))?;
        if caps.versioning && renamed_from.is_none() {
            check_version(ctx, &adapter, &file, &target).await?;
        }
        match adapter.push(&target, &file.content).await {
            Ok(()) => {},
            Err(err) if matches!(&*err, StorageErrorKind::Conflict(_)) => {
                return Err(route_conflict(ctx, &adapter, &file, &target).await);
            },
            Err(err) => return Err(Failure::from_storage(err, &target.path)),
        }
        match caps.versioning {
            true => match adapter.version(&target).await {
                Ok(version) => version,
                Err(err) => {
                    warn!(path = %target.path, "pushed, but could not read back the version: {}", error_chain(&err));
                    None
                },
            },
            false => None,
        }
    };

    // Rename fallback: the new copy exists, so the old one can go.
    if let Some(source) = &source
        && !caps.rename
        && (!file.is_dir() || caps.directories)
    {
        adapter.delete(source).await.map_err(|e| Failure::from_storage(e, &source.path))?;
    }

    ctx.repo
        .mark_synced(&file.id, file.workspace_id.as_deref(), file.revision, version.as_deref())
        .await
        .or_store()?;
    debug!(path = %file.path, version = ?version, "pushed");
    Ok(())
}

/// Whether the copy at a rename's old path is still the one this record last
/// synced there. Anything else was written after the record moved away and
/// is not ours to move or delete. Without versioning there is nothing to
/// compare, and queue ordering is all that protects the old path.
async fn owns_old_copy(
    adapter: &BackendHandle,
    file: &CachedFile,
    old: &FileDescriptor,
) -> std::result::Result<bool, Failure> {
    if file.is_dir() || !adapter.capabilities().versioning {
        return Ok(true);
    }
    let current = adapter.version(old).await.map_err(|e| Failure::from_storage(e, &old.path))?;
    Ok(current.is_some() && current.as_deref() == file.synced_version())
}

/// Optimistic concurrency: the backend copy must still be the one last
/// synced, otherwise pushing would overwrite somebody else's edit.
async fn check_version(
    ctx: &Context,
    adapter: &BackendHandle,
    file: &CachedFile,
    target: &FileDescriptor,
) -> std::result::Result<(), Failure> {
    let Some(expected) = file.synced_version() else {
        return Ok(());
    };
    match adapter.version(target).await.map_err(|e| Failure::from_storage(e, &target.path))? {
        Some(current) if current != expected => Err(route_conflict(ctx, adapter, file, target).await),
        // Unchanged, or deleted at the backend (pushing recreates it).
        _ => Ok(()),
    }
}

/// Hand the diverging backend copy to the merge strategy.
async fn route_conflict(ctx: &Context, adapter: &BackendHandle, file: &CachedFile, target: &FileDescriptor) -> Failure {
    let remote = match adapter.pull(target).await {
        Ok(Some(remote)) => remote,
        Ok(None) => return Failure::Transient(format!("{}: backend copy vanished during conflict check", file.path)),
        Err(err) => return Failure::from_storage(err, &target.path),
    };
    match ctx.merge.handle_pull(&ctx.repo, file, &remote).await {
        Ok(MergeOutcome::Merged) => {
            Failure::Transient(format!("{}: merged with backend copy, pushing again", file.path))
        },
        Ok(outcome) => {
            info!(path = %file.path, ?outcome, "backend copy diverged; local copy kept");
            Failure::Conflict(format!("{}: backend copy changed since last sync", file.path))
        },
        Err(err) => Failure::from(err),
    }
}

async fn process_delete(ctx: &Context, entry: &SyncQueueEntry) -> std::result::Result<(), Failure> {
    let Some(SyncPayload { path, workspace_type, file_type, .. }) = &entry.payload else {
        return Err(Failure::Permanent(format!("{}: delete without a recorded path", entry.target_id)));
    };
    let adapter = resolve_adapter(ctx, *workspace_type, entry.workspace_id.as_deref())?;
    if *file_type == FileType::Dir && !adapter.capabilities().directories {
        return Ok(());
    }
    let target = FileDescriptor::new(&entry.target_id, path).with_workspace(entry.workspace_id.clone());
    match adapter.delete(&target).await {
        Ok(existed) => {
            debug!(path = %path, existed, "deleted at backend");
            Ok(())
        },
        Err(err) if matches!(&*err, StorageErrorKind::NotFound(_)) => Ok(()),
        Err(err) => Err(Failure::from_storage(err, path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{create_directory, delete_file, rename_file, save_file};
    use crate::testing::{Call, context, context_with};
    use crate::{AdapterRegistry, merge::REMOTE_VERSIONS_KEY};
    use futures::FutureExt;
    use rstest::rstest;
    use std::sync::Arc;
    use verve_cache::{NewSyncEntry, SyncOp};
    use verve_storage::backend::{MemoryBackend, StorageBackend};
    use verve_storage::Capabilities;

    const WS: Option<&str> = Some("ws");

    #[tokio::test]
    async fn test_save_then_push_clears_dirty() {
        let (ctx, backend) = context().await;
        save_file(&ctx, "/new-file.md", "hello world", WorkspaceType::Local, None, Some("ws-create")).await.unwrap();
        assert!(ctx.repo.get("/new-file.md", Some("ws-create")).await.unwrap().unwrap().dirty);

        let report = process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(backend.calls(), vec![Call::Push("/new-file.md".to_string(), "hello world".to_string())]);
        assert!(!ctx.repo.get("/new-file.md", Some("ws-create")).await.unwrap().unwrap().dirty);
        assert!(ctx.queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_uses_original_path() {
        let (ctx, backend) = context().await;
        let file = CachedFile::file("/to-delete.md", "bye", WorkspaceType::Local, Some("ws".to_string()));
        ctx.repo.upsert(&file).await.unwrap();
        delete_file(&ctx, "/to-delete.md", WS).await.unwrap();
        assert!(!ctx.queue.list().await.unwrap().is_empty());
        assert!(ctx.repo.get("/to-delete.md", WS).await.unwrap().is_none());

        process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(backend.calls(), vec![Call::Delete("/to-delete.md".to_string())]);
        assert!(ctx.queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_ceiling() {
        let (ctx, backend) = context().await;
        backend.fail_with(|| StorageErrorKind::Network("offline".to_string()));
        save_file(&ctx, "/a.md", "x", WorkspaceType::Local, None, WS).await.unwrap();

        for attempt in 1..=3u32 {
            let report = process_pending_queue_once(&ctx).await.unwrap();
            let entry = &ctx.queue.list().await.unwrap()[0];
            assert_eq!(entry.attempts, attempt);
            if attempt < 3 {
                assert_eq!(report.retried, 1);
                assert_eq!(entry.status, QueueStatus::Pending);
            } else {
                assert_eq!(report.failed, 1);
                assert_eq!(entry.status, QueueStatus::Failed);
                assert!(entry.last_error.as_deref().unwrap().contains("offline"));
            }
        }
        // Parked: no more automatic attempts.
        let before = backend.calls().len();
        assert!(process_pending_queue_once(&ctx).await.unwrap().is_idle());
        assert_eq!(backend.calls().len(), before);
        assert!(ctx.repo.get("/a.md", WS).await.unwrap().unwrap().dirty);
    }

    #[tokio::test]
    async fn test_drain_is_idempotent() {
        let (ctx, backend) = context().await;
        save_file(&ctx, "/a.md", "x", WorkspaceType::Local, None, WS).await.unwrap();
        process_pending_queue_once(&ctx).await.unwrap();
        let calls = backend.calls().len();
        assert!(process_pending_queue_once(&ctx).await.unwrap().is_idle());
        assert!(process_pending_queue_once(&ctx).await.unwrap().is_idle());
        assert_eq!(backend.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_put_then_delete_keeps_order() {
        let (ctx, backend) = context().await;
        save_file(&ctx, "/a.md", "x", WorkspaceType::Local, None, WS).await.unwrap();
        delete_file(&ctx, "/a.md", WS).await.unwrap();
        process_pending_queue_once(&ctx).await.unwrap();
        // The put finds its record gone and completes without a call.
        assert_eq!(backend.calls(), vec![Call::Delete("/a.md".to_string())]);
        assert!(ctx.queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_put_blocks_later_delete_of_same_file() {
        let (ctx, backend) = context().await;
        save_file(&ctx, "/a.md", "x", WorkspaceType::Local, None, WS).await.unwrap();
        save_file(&ctx, "/b.md", "y", WorkspaceType::Local, None, WS).await.unwrap();
        ctx.queue
            .enqueue(NewSyncEntry::delete(&CachedFile::file("/a.md", "", WorkspaceType::Local, Some("ws".to_string()))))
            .await
            .unwrap();
        backend.fail_path("/a.md", || StorageErrorKind::Network("flaky".to_string()));

        let report = process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.completed, 1);
        assert!(!backend.calls().iter().any(|c| matches!(c, Call::Delete(_))));
    }

    #[tokio::test]
    async fn test_missing_adapter_fails_immediately() {
        let (ctx, backend) = context().await;
        save_file(&ctx, "/a.md", "x", WorkspaceType::Drive, None, WS).await.unwrap();
        let report = process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(report.failed, 1);
        let entry = &ctx.queue.list().await.unwrap()[0];
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.attempts, 1);
        assert!(entry.last_error.as_deref().unwrap().contains("no adapter"));
        assert!(backend.calls().is_empty());
    }

    #[rstest]
    #[case(StorageErrorKind::PermissionDenied("nope".to_string()), QueueStatus::Failed)]
    #[case(StorageErrorKind::Network("timeout".to_string()), QueueStatus::Pending)]
    #[case(StorageErrorKind::Unauthenticated, QueueStatus::Pending)]
    #[tokio::test]
    async fn test_error_classification(#[case] kind: StorageErrorKind, #[case] expected: QueueStatus) {
        let (ctx, backend) = context().await;
        let kind = std::sync::Mutex::new(Some(kind));
        backend.fail_with(move || kind.lock().unwrap().take().unwrap_or(StorageErrorKind::BackendError("again".into())));
        save_file(&ctx, "/a.md", "x", WorkspaceType::Local, None, WS).await.unwrap();
        process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(ctx.queue.list().await.unwrap()[0].status, expected);
    }

    #[tokio::test]
    async fn test_oversized_content_is_not_retried() {
        let backend = Arc::new(MemoryBackend::default().with_capabilities(Capabilities {
            max_file_size: Some(4),
            ..Default::default()
        }));
        let ctx = context_with(AdapterRegistry::new().with_adapter(WorkspaceType::Local, backend.clone())).await;
        save_file(&ctx, "/a.md", "too long", WorkspaceType::Local, None, WS).await.unwrap();
        let report = process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(ctx.queue.list().await.unwrap()[0].last_error.as_deref().unwrap().contains("too large"));
        assert!(backend.content("/a.md").await.is_none());
    }

    #[tokio::test]
    async fn test_rename_uses_backend_rename() {
        let backend = Arc::new(MemoryBackend::default());
        let ctx = context_with(AdapterRegistry::new().with_adapter(WorkspaceType::Local, backend.clone())).await;
        save_file(&ctx, "/old.md", "body", WorkspaceType::Local, None, WS).await.unwrap();
        process_pending_queue_once(&ctx).await.unwrap();
        rename_file(&ctx, "/old.md", "/new.md", WS).await.unwrap();
        process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(backend.content("/new.md").await.as_deref(), Some("body"));
        assert!(backend.content("/old.md").await.is_none());
        let file = ctx.repo.get("/old.md", WS).await.unwrap().unwrap();
        assert_eq!(file.path, "/new.md");
        assert!(!file.dirty);
    }

    #[tokio::test]
    async fn test_rename_without_backend_rename_pushes_then_deletes() {
        let (ctx, backend) = context().await;
        save_file(&ctx, "/old.md", "body", WorkspaceType::Local, None, WS).await.unwrap();
        process_pending_queue_once(&ctx).await.unwrap();
        rename_file(&ctx, "/old.md", "/new.md", WS).await.unwrap();
        process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(
            backend.calls(),
            vec![
                Call::Push("/old.md".to_string(), "body".to_string()),
                Call::Push("/new.md".to_string(), "body".to_string()),
                Call::Delete("/old.md".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_recreated_path_survives_delayed_rename() {
        let (ctx, backend) = context().await;
        save_file(&ctx, "/a.md", "first", WorkspaceType::Local, None, WS).await.unwrap();
        process_pending_queue_once(&ctx).await.unwrap();
        rename_file(&ctx, "/a.md", "/b.md", WS).await.unwrap();
        save_file(&ctx, "/a.md", "second", WorkspaceType::Local, None, WS).await.unwrap();

        backend.fail_path("/b.md", || StorageErrorKind::Network("flaky".to_string()));
        let report = process_pending_queue_once(&ctx).await.unwrap();
        // The new file waits for the rename that still has to clear its path.
        assert_eq!((report.retried, report.completed), (1, 0));

        backend.clear_failures();
        let report = process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(backend.content("/a.md").as_deref(), Some("second"));
        assert_eq!(backend.content("/b.md").as_deref(), Some("first"));
        assert_eq!(
            backend.calls()[1..],
            [
                Call::Push("/b.md".to_string(), "first".to_string()),
                Call::Delete("/a.md".to_string()),
                Call::Push("/a.md".to_string(), "second".to_string()),
            ]
        );
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    #[tokio::test]
    async fn test_rename_leaves_foreign_copy_at_old_path(#[case] rename: bool) {
        let backend = Arc::new(MemoryBackend::default().with_capabilities(Capabilities {
            versioning: true,
            rename,
            directories: true,
            ..Default::default()
        }));
        let ctx = context_with(AdapterRegistry::new().with_adapter(WorkspaceType::Local, backend.clone())).await;
        save_file(&ctx, "/a.md", "first", WorkspaceType::Local, None, WS).await.unwrap();
        process_pending_queue_once(&ctx).await.unwrap();
        rename_file(&ctx, "/a.md", "/b.md", WS).await.unwrap();
        // Somebody else writes at the old path before the rename goes out.
        backend.push(&FileDescriptor::at("/a.md"), "theirs").await.unwrap();

        let report = process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(backend.content("/a.md").await.as_deref(), Some("theirs"));
        assert_eq!(backend.content("/b.md").await.as_deref(), Some("first"));
        assert!(!ctx.repo.get("/a.md", WS).await.unwrap().unwrap().dirty);
    }

    #[tokio::test]
    async fn test_directories_follow_capabilities() {
        let backend = Arc::new(MemoryBackend::default());
        let ctx = context_with(AdapterRegistry::new().with_adapter(WorkspaceType::Local, backend.clone())).await;
        create_directory(&ctx, "/notes", WorkspaceType::Local, WS).await.unwrap();
        process_pending_queue_once(&ctx).await.unwrap();
        assert!(backend.has_directory("/notes").await);

        // A backend without directories gets no calls for them.
        let (ctx, recording) = context().await;
        create_directory(&ctx, "/notes", WorkspaceType::Local, WS).await.unwrap();
        delete_file(&ctx, "/notes", WS).await.unwrap();
        let report = process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(report.completed, 2);
        assert!(recording.calls().is_empty());
    }

    #[tokio::test]
    async fn test_version_mismatch_is_a_conflict() {
        let backend = Arc::new(MemoryBackend::default());
        let ctx = context_with(AdapterRegistry::new().with_adapter(WorkspaceType::Local, backend.clone())).await;
        save_file(&ctx, "/a.md", "v1", WorkspaceType::Local, None, WS).await.unwrap();
        process_pending_queue_once(&ctx).await.unwrap();
        let synced = ctx.repo.get("/a.md", WS).await.unwrap().unwrap();
        assert!(synced.synced_version().is_some());

        // Someone else writes to the backend, then we edit locally.
        backend.push(&FileDescriptor::at("/a.md"), "theirs").await.unwrap();
        save_file(&ctx, "/a.md", "ours", WorkspaceType::Local, None, WS).await.unwrap();
        let report = process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(report.conflicts, 1);

        assert_eq!(backend.content("/a.md").await.as_deref(), Some("theirs"));
        let file = ctx.repo.get("/a.md", WS).await.unwrap().unwrap();
        assert_eq!(file.content, "ours");
        assert!(file.dirty);
        assert_eq!(file.metadata[REMOTE_VERSIONS_KEY][0]["content"], "theirs");
        assert_eq!(ctx.queue.list().await.unwrap()[0].status, QueueStatus::Failed);
    }

    #[tokio::test]
    async fn test_edit_during_push_stays_dirty() {
        let (ctx, backend) = context().await;
        save_file(&ctx, "/a.md", "v1", WorkspaceType::Local, None, WS).await.unwrap();
        let repo = ctx.repo.clone();
        backend.before_push(move || {
            let repo = repo.clone();
            async move {
                let mut file = repo.get("/a.md", Some("ws")).await.unwrap().unwrap();
                // Within the same millisecond as the original save.
                file.content = "v2".to_string();
                repo.upsert(&file).await.unwrap();
            }
            .boxed()
        });
        process_pending_queue_once(&ctx).await.unwrap();
        let file = ctx.repo.get("/a.md", WS).await.unwrap().unwrap();
        assert_eq!(file.content, "v2");
        assert!(file.dirty);
    }

    #[tokio::test]
    async fn test_put_without_payload_is_resolved_by_id() {
        let (ctx, backend) = context().await;
        let file = CachedFile::file("/a.md", "x", WorkspaceType::Local, Some("elsewhere".to_string())).with_dirty(true);
        ctx.repo.upsert(&file).await.unwrap();
        let mut entry = NewSyncEntry::put(&file);
        entry.payload = None;
        entry.workspace_id = None;
        ctx.queue.enqueue(entry).await.unwrap();
        process_pending_queue_once(&ctx).await.unwrap();
        assert_eq!(backend.calls(), vec![Call::Push("/a.md".to_string(), "x".to_string())]);
        assert!(ctx.queue.list().await.unwrap().is_empty());
        assert!(!ctx.repo.get("/a.md", Some("elsewhere")).await.unwrap().unwrap().dirty);
    }

    #[rstest]
    #[case(1, 500)]
    #[case(2, 1000)]
    #[case(3, 2000)]
    #[case(20, 60_000)]
    fn test_backoff_without_jitter(#[case] attempt: u32, #[case] millis: u64) {
        let policy = RetryPolicy { jitter: false, ..RetryPolicy::default() };
        assert_eq!(policy.backoff(attempt), Duration::from_millis(millis));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.backoff(2);
            assert!(delay >= Duration::from_millis(500) && delay <= Duration::from_millis(1000));
        }
        assert_eq!(RetryPolicy::immediate(3).backoff(5), Duration::ZERO);
    }

    #[test]
    fn test_op_is_displayed() {
        assert_eq!(SyncOp::Put.to_string(), "put");
    }
}
