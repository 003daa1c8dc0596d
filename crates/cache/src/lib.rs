//! SQLite cache store for workspace files and the sync queue.
//!
//! The cache is the single source of truth for file and folder state across
//! every workspace, whatever backend a workspace is stored in. It holds two
//! collections:
//! - **Cached files**: one record per file or directory per workspace, with
//!   its full content and a dirty flag set while the backend lags behind.
//! - **Sync queue**: the ordered, restart-safe log of mutations that still
//!   have to reach a backend.
//!
//! Every write is broadcast so that observers (the UI, the queue worker) can
//! react without polling.

mod db;
pub mod error;
mod events;
pub mod models;
mod queue;
mod repo;

pub use crate::db::Database;
pub use crate::events::{CacheEvent, Subscription};
pub use crate::models::{
    CachedFile, FileType, Metadata, NewSyncEntry, QueueCounts, QueueStatus, SyncOp, SyncPayload, SyncQueueEntry,
    SyncTarget, WorkspaceType,
};
pub use crate::queue::SyncQueue;
pub use crate::repo::{ChangeSet, Repository};
