//! Change notification for cache observers.

use crate::Repository;
use crate::models::CachedFile;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::warn;

/// Buffered events per receiver before slow observers start lagging.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// Emitted after every successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    FileUpserted { id: String, workspace_id: Option<String> },
    FileRemoved { id: String, workspace_id: Option<String> },
    QueueChanged,
}
impl CacheEvent {
    pub fn workspace_id(&self) -> Option<&str> {
        match self {
            Self::FileUpserted { workspace_id, .. } | Self::FileRemoved { workspace_id, .. } => workspace_id.as_deref(),
            Self::QueueChanged => None,
        }
    }

    fn touches_files(&self) -> bool {
        !matches!(self, Self::QueueChanged)
    }
}

/// Handle returned by [`Repository::observe`]. Delivery stops when it is
/// unsubscribed or dropped.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}
impl Subscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}
impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) fn observe<F>(repo: Repository, mut events: broadcast::Receiver<CacheEvent>, mut callback: F) -> Subscription
where
    F: FnMut(Vec<CachedFile>) + Send + 'static,
{
    let task = tokio::spawn(async move {
        // Observers get the current set straight away, then the new set after
        // every change. A lagged receiver just re-reads the set.
        let mut refresh = true;
        loop {
            if refresh {
                match repo.list_all().await {
                    Ok(files) => callback(files),
                    Err(err) => warn!("failed to refresh observed files: {err:?}"),
                }
            }
            refresh = match events.recv().await {
                Ok(event) => event.touches_files(),
                Err(RecvError::Lagged(_)) => true,
                Err(RecvError::Closed) => break,
            };
        }
    });
    Subscription { task }
}
