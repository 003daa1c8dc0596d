//! Pulling backend changes into the cache.
//!
//! Only clean records are ever reconciled: a dirty record holds an edit the
//! backend has not seen yet, and pulling over it would lose that edit. When
//! the backend copy differs from a clean record, the [`MergeStrategy`]
//! decides what to keep.
//!
//! [`MergeStrategy`]: crate::merge::MergeStrategy

use crate::error::{CacheResultExt, ErrorKind, Result};
use crate::merge::MergeOutcome;
use crate::ops::fresh_id;
use crate::processor::error_chain;
use crate::{Context, Workspace};
use exn::ResultExt;
use serde_json::Value;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use verve_cache::{CachedFile, Metadata, WorkspaceType};
use verve_storage::{BackendHandle, FileDescriptor, RemoteEntry};

/// What reconciling a single record found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The record has unpushed changes and was left alone.
    Skipped,
    /// Backend and cache agree.
    Unchanged,
    /// The backend has no copy (not pushed yet, or deleted elsewhere).
    RemoteMissing,
    /// The backend copy differs; the merge strategy has handled it.
    Diverged(MergeOutcome),
}

/// Totals for a workspace-wide sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Backend entries that had no cache record and were imported.
    pub imported: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub missing: usize,
    pub diverged: usize,
    /// Records whose backend could not be reached this time.
    pub errors: usize,
}
impl ReconcileReport {
    fn count(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Skipped => self.skipped += 1,
            ReconcileOutcome::Unchanged => self.unchanged += 1,
            ReconcileOutcome::RemoteMissing => self.missing += 1,
            ReconcileOutcome::Diverged(_) => self.diverged += 1,
        }
    }
}

fn adapter_for(ctx: &Context, kind: WorkspaceType, workspace_id: Option<&str>) -> Result<BackendHandle> {
    ctx.registry
        .resolve(kind, workspace_id)
        .cloned()
        .ok_or_else(|| exn::Exn::from(ErrorKind::AdapterUnavailable(kind.to_string())))
}

/// Compare one record against its backend copy.
#[instrument(skip(ctx), fields(workspace = ?workspace_id))]
pub async fn reconcile_file(ctx: &Context, id: &str, workspace_id: Option<&str>) -> Result<ReconcileOutcome> {
    let file = ctx
        .repo
        .get(id, workspace_id)
        .await
        .or_store()?
        .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(id.to_string())))?;
    let adapter = adapter_for(ctx, file.workspace_type, workspace_id)?;
    reconcile_with(ctx, &adapter, &file).await
}

async fn reconcile_with(ctx: &Context, adapter: &BackendHandle, file: &CachedFile) -> Result<ReconcileOutcome> {
    if file.dirty {
        return Ok(ReconcileOutcome::Skipped);
    }
    if file.is_dir() {
        return Ok(ReconcileOutcome::Unchanged);
    }
    let descriptor = FileDescriptor::new(&file.id, &file.path).with_workspace(file.workspace_id.clone());
    let version = match adapter.capabilities().versioning {
        true => {
            let version = adapter.version(&descriptor).await.or_raise(|| ErrorKind::BackendFailure)?;
            match version {
                None => return Ok(ReconcileOutcome::RemoteMissing),
                Some(current) if file.synced_version() == Some(current.as_str()) => {
                    return Ok(ReconcileOutcome::Unchanged);
                },
                Some(current) => Some(current),
            }
        },
        false => None,
    };
    let Some(remote) = adapter.pull(&descriptor).await.or_raise(|| ErrorKind::BackendFailure)? else {
        return Ok(ReconcileOutcome::RemoteMissing);
    };
    if remote == file.content {
        if version.is_some() {
            // Same content under a new version (touched, or re-uploaded).
            ctx.repo
                .mark_synced(&file.id, file.workspace_id.as_deref(), file.revision, version.as_deref())
                .await
                .or_store()?;
        }
        return Ok(ReconcileOutcome::Unchanged);
    }
    let outcome = ctx.merge.handle_pull(&ctx.repo, file, &remote).await?;
    debug!(path = %file.path, ?outcome, "backend copy diverged");
    Ok(ReconcileOutcome::Diverged(outcome))
}

/// Reconcile every record of a workspace.
#[instrument(skip_all, fields(workspace = %workspace.id))]
pub async fn reconcile_workspace(ctx: &Context, workspace: &Workspace) -> Result<ReconcileReport> {
    let adapter = adapter_for(ctx, workspace.kind, workspace.scope())?;
    let mut report = ReconcileReport::default();
    for file in ctx.repo.list(workspace.scope()).await.or_store()? {
        sweep_one(ctx, &adapter, &file, &mut report).await?;
    }
    Ok(report)
}

async fn sweep_one(ctx: &Context, adapter: &BackendHandle, file: &CachedFile, report: &mut ReconcileReport) -> Result<()> {
    match reconcile_with(ctx, adapter, file).await {
        Ok(outcome) => report.count(outcome),
        // One unreachable file should not stop the sweep.
        Err(err) if matches!(&*err, ErrorKind::BackendFailure) => {
            warn!(path = %file.path, "could not reconcile: {}", error_chain(&err));
            report.errors += 1;
        },
        Err(err) => return Err(err),
    }
    Ok(())
}

/// Bring a workspace's cache up to date with its backend: entries the cache
/// has never seen are imported as clean records, the rest are reconciled.
#[instrument(skip_all, fields(workspace = %workspace.id))]
pub async fn hydrate_workspace(ctx: &Context, workspace: &Workspace) -> Result<ReconcileReport> {
    let scope = workspace.scope();
    let adapter = adapter_for(ctx, workspace.kind, scope)?;
    let mut entries = adapter.list_workspace_files(scope).await.or_raise(|| ErrorKind::BackendFailure)?;
    // Parents before children.
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut report = ReconcileReport::default();
    for entry in entries {
        match ctx.repo.get_by_path(&entry.path, scope).await.or_store()? {
            Some(existing) => sweep_one(ctx, &adapter, &existing, &mut report).await?,
            None => {
                if import(ctx, &adapter, workspace, &entry).await? {
                    report.imported += 1;
                }
            },
        }
    }
    info!(
        imported = report.imported,
        unchanged = report.unchanged,
        diverged = report.diverged,
        "workspace hydrated"
    );
    Ok(report)
}

async fn import(ctx: &Context, adapter: &BackendHandle, workspace: &Workspace, entry: &RemoteEntry) -> Result<bool> {
    let scope = workspace.scope();
    let owner = scope.map(str::to_string);
    let mut file = match entry.is_dir {
        true => CachedFile::directory(&entry.path, workspace.kind, owner),
        false => {
            let descriptor = FileDescriptor::new(&entry.id, &entry.path).with_workspace(owner.clone());
            let Some(content) = adapter.pull(&descriptor).await.or_raise(|| ErrorKind::BackendFailure)? else {
                // Listed but gone by the time it was fetched.
                return Ok(false);
            };
            let mut metadata = Metadata::new();
            if let Some(version) = entry.version() {
                metadata.insert("synced_version".to_string(), Value::String(version.to_string()));
            }
            CachedFile::file(&entry.path, content, workspace.kind, owner).with_metadata(metadata)
        },
    };
    file.id = fresh_id(ctx, &entry.path, scope).await?;
    ctx.repo.upsert(&file.with_dirty(false)).await.or_store()?;
    Ok(true)
}

/// Periodic reconciliation of one workspace, for backends (or deployments)
/// without change notifications.
#[derive(Debug, Clone)]
pub struct Poller {
    ctx: Context,
    workspace: Workspace,
    interval: Duration,
}
impl Poller {
    pub fn new(ctx: Context, workspace: Workspace, interval: Duration) -> Self {
        Self { ctx, workspace, interval }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub async fn poll_once(&self) -> Result<ReconcileReport> {
        reconcile_workspace(&self.ctx, &self.workspace).await
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    #[instrument(skip_all, fields(workspace = %self.workspace.id))]
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            match self.poll_once().await {
                Ok(report) if report.diverged > 0 => info!(diverged = report.diverged, "backend changes detected"),
                Ok(_) => {},
                Err(err) => warn!("poll failed: {}", error_chain(&err)),
            }
        }
    }
}

/// One [`Poller`] per known workspace whose backend is not the cache itself.
pub async fn pollers(ctx: &Context, interval: Duration) -> Vec<Poller> {
    ctx.workspaces
        .all()
        .await
        .into_iter()
        .filter(|workspace| workspace.kind.propagates())
        .map(|workspace| Poller::new(ctx.clone(), workspace, interval))
        .collect()
}
