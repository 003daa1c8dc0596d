//! What happens when a backend copy diverges from the cache.
//!
//! There is no merge of concurrent edits: two-way divergence cannot be
//! resolved without a person looking at it. Strategies therefore either
//! preserve evidence of the remote copy ([`RecordRemoteVersions`]) or refuse
//! outright ([`ThreeWayMerge`]). Local content is never overwritten.

use crate::error::{CacheResultExt, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use verve_cache::{CachedFile, Repository};

/// Metadata key under which remote copies are recorded.
pub const REMOTE_VERSIONS_KEY: &str = "remote_versions";
/// Oldest recorded copies are dropped past this many.
const MAX_REMOTE_VERSIONS: usize = 10;

/// Result of handing a divergence to a [`MergeStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing changed locally; evidence may have been recorded.
    Noop,
    /// Local content now incorporates the remote changes.
    Merged,
    /// Not safe to resolve automatically; somebody has to decide.
    Conflict,
}

#[async_trait]
pub trait MergeStrategy: Send + Sync {
    /// Handle a pull that found `remote_content` at the backend while the
    /// cache holds `cached`.
    async fn handle_pull(&self, repo: &Repository, cached: &CachedFile, remote_content: &str) -> Result<MergeOutcome>;
}

/// Default strategy: keep local content, append the remote copy (with a
/// timestamp) to `metadata.remote_versions` for later inspection.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordRemoteVersions;

#[async_trait]
impl MergeStrategy for RecordRemoteVersions {
    async fn handle_pull(&self, repo: &Repository, cached: &CachedFile, remote_content: &str) -> Result<MergeOutcome> {
        // Re-read so that an edit made since `cached` was loaded survives.
        let Some(mut current) = repo.get(&cached.id, cached.workspace_id.as_deref()).await.or_store()? else {
            return Ok(MergeOutcome::Noop);
        };
        if record_remote_version(&mut current, remote_content) {
            repo.upsert(&current).await.or_store()?;
            tracing::info!(id = %current.id, path = %current.path, "recorded diverging remote version");
        }
        Ok(MergeOutcome::Noop)
    }
}

/// Append a remote copy to the record's history. Returns `false` if it is
/// the same as the latest one already recorded.
pub(crate) fn record_remote_version(file: &mut CachedFile, remote_content: &str) -> bool {
    let mut versions = match file.metadata.remove(REMOTE_VERSIONS_KEY) {
        Some(Value::Array(versions)) => versions,
        _ => Vec::new(),
    };
    let duplicate = versions
        .last()
        .and_then(|latest| latest.get("content"))
        .and_then(Value::as_str)
        .is_some_and(|latest| latest == remote_content);
    if !duplicate {
        let ts = verve_cache::models::now().unix_timestamp_nanos() / 1_000_000;
        versions.push(json!({ "ts": ts as i64, "content": remote_content }));
        if versions.len() > MAX_REMOTE_VERSIONS {
            versions.drain(..versions.len() - MAX_REMOTE_VERSIONS);
        }
    }
    file.metadata.insert(REMOTE_VERSIONS_KEY.to_string(), Value::Array(versions));
    !duplicate
}

/// Extension point for a real three-way merge. Until there is one, every
/// divergence is reported as a conflict.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreeWayMerge;

#[async_trait]
impl MergeStrategy for ThreeWayMerge {
    async fn handle_pull(&self, _repo: &Repository, _cached: &CachedFile, _remote_content: &str) -> Result<MergeOutcome> {
        Ok(MergeOutcome::Conflict)
    }
}
