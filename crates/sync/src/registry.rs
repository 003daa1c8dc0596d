//! Adapter lookup for queue processing.

use std::collections::HashMap;
use verve_cache::WorkspaceType;
use verve_storage::BackendHandle;

/// Maps workspaces to the backend adapter that is authoritative for them.
///
/// Adapters are registered per [`WorkspaceType`]; a specific workspace id may
/// override that (two local workspaces in different directories, say).
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    by_type: HashMap<WorkspaceType, BackendHandle>,
    by_workspace: HashMap<String, BackendHandle>,
}
impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, kind: WorkspaceType, adapter: BackendHandle) -> Self {
        self.register(kind, adapter);
        self
    }

    pub fn with_workspace_adapter(mut self, workspace_id: impl Into<String>, adapter: BackendHandle) -> Self {
        self.register_workspace(workspace_id, adapter);
        self
    }

    pub fn register(&mut self, kind: WorkspaceType, adapter: BackendHandle) {
        self.by_type.insert(kind, adapter);
    }

    pub fn register_workspace(&mut self, workspace_id: impl Into<String>, adapter: BackendHandle) {
        self.by_workspace.insert(workspace_id.into(), adapter);
    }

    /// The adapter for a workspace: its own override first, then the one for
    /// its type.
    pub fn resolve(&self, kind: WorkspaceType, workspace_id: Option<&str>) -> Option<&BackendHandle> {
        workspace_id
            .and_then(|id| self.by_workspace.get(id))
            .or_else(|| self.by_type.get(&kind))
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty() && self.by_workspace.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.by_type.keys().map(WorkspaceType::as_str).collect();
        types.sort_unstable();
        let mut workspaces: Vec<_> = self.by_workspace.keys().collect();
        workspaces.sort_unstable();
        f.debug_struct("AdapterRegistry").field("types", &types).field("workspaces", &workspaces).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use verve_storage::backend::MemoryBackend;

    #[test]
    fn test_workspace_override_wins() {
        let shared: BackendHandle = Arc::new(MemoryBackend::default().with_name("shared"));
        let special: BackendHandle = Arc::new(MemoryBackend::default().with_name("special"));
        let registry = AdapterRegistry::new()
            .with_adapter(WorkspaceType::Local, shared)
            .with_workspace_adapter("ws-special", special);

        assert_eq!(registry.resolve(WorkspaceType::Local, Some("ws-1")).unwrap().name(), "shared");
        assert_eq!(registry.resolve(WorkspaceType::Local, None).unwrap().name(), "shared");
        assert_eq!(registry.resolve(WorkspaceType::Local, Some("ws-special")).unwrap().name(), "special");
        assert!(registry.resolve(WorkspaceType::Drive, Some("ws-1")).is_none());
    }
}
