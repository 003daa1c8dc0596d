//! Turning configuration into a sync [`Context`].

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use verve_cache::{Database, WorkspaceType};
use verve_config::{BackendConfig, Config, WorkspaceConfig};
use verve_storage::BackendHandle;
use verve_storage::backend::{BrowserBackend, LocalBackend};
use verve_sync::{AdapterRegistry, Context, RetryPolicy, StaticWorkspaces, Workspace};

pub fn workspace_type(backend: &BackendConfig) -> WorkspaceType {
    match backend {
        BackendConfig::Browser { .. } => WorkspaceType::Browser,
        BackendConfig::Local { .. } => WorkspaceType::Local,
        BackendConfig::Drive { .. } => WorkspaceType::Drive,
        BackendConfig::S3 { .. } => WorkspaceType::S3,
    }
}

pub fn workspace(config: &WorkspaceConfig) -> Workspace {
    let workspace = Workspace::new(&config.id, &config.name, workspace_type(&config.backend));
    match config.backend.locator() {
        Some(locator) => workspace.with_locator(locator),
        None => workspace,
    }
}

fn browser_dir(config: &Config, storage_dir: Option<&PathBuf>) -> PathBuf {
    storage_dir.cloned().unwrap_or_else(|| {
        config.database.parent().unwrap_or_else(|| Path::new(".")).join("browser")
    })
}

fn adapter(config: &Config, workspace: &WorkspaceConfig) -> Result<BackendHandle> {
    let name = workspace.name.as_str();
    let failed = || ErrorKind::Backend(workspace.id.clone());
    let handle: BackendHandle = match &workspace.backend {
        BackendConfig::Browser { storage_dir } => {
            Arc::new(BrowserBackend::new(name, browser_dir(config, storage_dir.as_ref())).or_raise(failed)?)
        },
        BackendConfig::Local { path } => {
            let root = std::path::absolute(path).or_raise(failed)?;
            Arc::new(LocalBackend::new(name, root).or_raise(failed)?)
        },
        #[cfg(feature = "drive")]
        BackendConfig::Drive { folder_id, token_env } => {
            use verve_storage::backend::{DriveBackend, EnvToken};
            let tokens = Arc::new(EnvToken(token_env.clone()));
            Arc::new(DriveBackend::new(name, folder_id, tokens).or_raise(failed)?)
        },
        #[cfg(not(feature = "drive"))]
        BackendConfig::Drive { .. } => exn::bail!(ErrorKind::Disabled("drive")),
        #[cfg(feature = "s3")]
        BackendConfig::S3 { bucket, prefix, region, endpoint, path_style } => {
            use verve_storage::backend::{S3Backend, S3Settings};
            let settings = S3Settings {
                bucket: bucket.clone(),
                prefix: prefix.clone(),
                region: region.clone(),
                endpoint: endpoint.clone(),
                path_style: *path_style,
            };
            // Same variables the AWS tooling reads.
            let key_id = std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default();
            let key_secret = std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default();
            Arc::new(S3Backend::new(name, settings, key_id, key_secret).or_raise(failed)?)
        },
        #[cfg(not(feature = "s3"))]
        BackendConfig::S3 { .. } => exn::bail!(ErrorKind::Disabled("s3")),
    };
    debug!(workspace = %workspace.id, backend = workspace.backend.kind(), "adapter ready");
    Ok(handle)
}

/// Build the registry: one adapter per configured workspace, keyed by id.
pub fn registry(config: &Config) -> Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();
    for workspace in &config.workspaces {
        registry.register_workspace(&workspace.id, adapter(config, workspace)?);
    }
    Ok(registry)
}

pub async fn context(config: &Config) -> Result<Context> {
    if let Some(dir) = config.database.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).or_raise(|| ErrorKind::Cache)?;
    }
    let db = Database::connect(&config.database).await.or_raise(|| ErrorKind::Cache)?;
    info!(database = %config.database.display(), workspaces = config.workspaces.len(), "cache opened");
    let sync = &config.sync;
    let retry = RetryPolicy {
        max_attempts: sync.max_attempts,
        initial_backoff: sync.backoff_initial(),
        max_backoff: sync.backoff_max(),
        jitter: true,
    };
    let workspaces = StaticWorkspaces::new(config.workspaces.iter().map(workspace).collect());
    Ok(Context::new(&db, registry(config)?).with_retry(retry).with_workspaces(Arc::new(workspaces)))
}
