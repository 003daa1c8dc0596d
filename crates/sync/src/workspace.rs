//! Workspaces as seen by the sync core.
//!
//! Workspace lifecycle belongs to whoever owns the workspace list (the UI,
//! configuration). The core only ever asks which workspace is active and
//! what kind of backend a workspace lives in.

use async_trait::async_trait;
use std::sync::RwLock;
use time::UtcDateTime;
use verve_cache::WorkspaceType;

/// A named, typed storage scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub kind: WorkspaceType,
    /// Backend-specific location (directory, drive folder id, bucket).
    pub locator: Option<String>,
    pub created_at: UtcDateTime,
    pub last_accessed: UtcDateTime,
}
impl Workspace {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: WorkspaceType) -> Self {
        let now = verve_cache::models::now();
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            locator: None,
            created_at: now,
            last_accessed: now,
        }
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    /// The cache scope the workspace's records live in.
    pub fn scope(&self) -> Option<&str> {
        Some(self.id.as_str())
    }
}

/// Read-only view of the workspace list.
#[async_trait]
pub trait WorkspaceResolver: Send + Sync {
    /// The workspace currently open, if any.
    async fn active(&self) -> Option<Workspace>;

    async fn get(&self, id: &str) -> Option<Workspace>;

    async fn all(&self) -> Vec<Workspace>;
}

/// A fixed list of workspaces, such as the ones named in configuration.
#[derive(Debug, Default)]
pub struct StaticWorkspaces {
    workspaces: Vec<Workspace>,
    active: RwLock<Option<String>>,
}
impl StaticWorkspaces {
    /// The first workspace starts out active.
    pub fn new(workspaces: Vec<Workspace>) -> Self {
        let active = workspaces.first().map(|w| w.id.clone());
        Self { workspaces, active: RwLock::new(active) }
    }

    /// Switch the active workspace. Returns `false` for unknown ids.
    pub fn set_active(&self, id: &str) -> bool {
        if !self.workspaces.iter().any(|w| w.id == id) {
            return false;
        }
        match self.active.write() {
            Ok(mut active) => {
                *active = Some(id.to_string());
                true
            },
            Err(_) => false,
        }
    }
}

#[async_trait]
impl WorkspaceResolver for StaticWorkspaces {
    async fn active(&self) -> Option<Workspace> {
        let id = self.active.read().ok()?.clone()?;
        self.get(&id).await
    }

    async fn get(&self, id: &str) -> Option<Workspace> {
        self.workspaces.iter().find(|w| w.id == id).cloned()
    }

    async fn all(&self) -> Vec<Workspace> {
        self.workspaces.clone()
    }
}
