//! Sync core for cached workspaces.
//!
//! The cache ([`verve_cache`]) is authoritative for reads and writes; backends
//! ([`verve_storage`]) are caught up asynchronously:
//! - [`ops`] mutates cache records and queues what has to reach a backend.
//! - [`processor`] drains the queue through the [`AdapterRegistry`], with
//!   retries and per-file ordering.
//! - [`worker`] runs the processor whenever the queue changes (and on a
//!   timer, for retries that are backing off).
//! - [`reconcile`] goes the other way: backend changes are pulled into clean
//!   records, diverging ones are handed to the [`MergeStrategy`].
//!
//! All of it shares one [`Context`].

pub mod error;
pub mod merge;
pub mod ops;
pub mod processor;
pub mod reconcile;
mod registry;
pub mod status;
pub mod worker;
mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::merge::{MergeOutcome, MergeStrategy, RecordRemoteVersions, ThreeWayMerge};
pub use crate::processor::{ProcessReport, RetryPolicy, process_pending_queue_once};
pub use crate::reconcile::{Poller, ReconcileOutcome, ReconcileReport, hydrate_workspace, pollers, reconcile_file};
pub use crate::registry::AdapterRegistry;
pub use crate::status::{SyncStatus, sync_status};
pub use crate::worker::QueueWorker;
pub use crate::workspace::{StaticWorkspaces, Workspace, WorkspaceResolver};

use std::sync::Arc;
use verve_cache::{Database, Repository, SyncQueue};

/// Everything the sync core needs, cheap to clone and share between tasks.
#[derive(Clone)]
pub struct Context {
    pub repo: Repository,
    pub queue: SyncQueue,
    pub registry: AdapterRegistry,
    pub workspaces: Arc<dyn WorkspaceResolver>,
    pub merge: Arc<dyn MergeStrategy>,
    pub retry: RetryPolicy,
}
impl Context {
    /// A context over `db`, recording remote versions on divergence and
    /// with no known workspaces.
    pub fn new(db: &Database, registry: AdapterRegistry) -> Self {
        Self {
            repo: Repository::from(db),
            queue: SyncQueue::from(db),
            registry,
            workspaces: Arc::new(StaticWorkspaces::default()),
            merge: Arc::new(RecordRemoteVersions),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_workspaces(mut self, workspaces: Arc<dyn WorkspaceResolver>) -> Self {
        self.workspaces = workspaces;
        self
    }

    pub fn with_merge_strategy(mut self, merge: Arc<dyn MergeStrategy>) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Look a workspace up by id, or take the active one.
    pub async fn workspace(&self, id: Option<&str>) -> Result<Workspace> {
        let found = match id {
            Some(id) => self.workspaces.get(id).await,
            None => self.workspaces.active().await,
        };
        found.ok_or_else(|| exn::Exn::from(ErrorKind::UnknownWorkspace(id.unwrap_or("(none active)").to_string())))
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
