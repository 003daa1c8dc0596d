//! Configuration for verve.
//!
//! Values are layered, later sources overriding earlier ones:
//! 1. built-in defaults,
//! 2. a TOML file (by default `config.toml` in the platform config dir),
//! 3. `VERVE_`-prefixed environment variables, with `__` separating nested
//!    keys (`VERVE_SYNC__MAX_ATTEMPTS=5`).
//!
//! ```toml
//! database = "/var/lib/verve/cache.db"
//!
//! [sync]
//! max_attempts = 5
//!
//! [[workspaces]]
//! id = "notes"
//! name = "Notes"
//! backend = { type = "local", path = "/home/me/notes" }
//! ```

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const ENV_PREFIX: &str = "VERVE_";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "verve")
}

/// Where the configuration file is looked for when none is given.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database holding the cache and the sync queue.
    pub database: PathBuf,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceConfig>,
}
impl Default for Config {
    fn default() -> Self {
        let database = project_dirs()
            .map(|dirs| dirs.data_dir().join("cache.db"))
            .unwrap_or_else(|| PathBuf::from("verve.db"));
        Self { database, sync: SyncSettings::default(), workspaces: Vec::new() }
    }
}

impl Config {
    /// Load and validate. A missing file is not an error: defaults and the
    /// environment still apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = &path {
            debug!(path = %path.display(), "reading configuration file");
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;
        if sync.max_attempts == 0 {
            exn::bail!(ErrorKind::Invalid("sync.max_attempts must be at least 1".to_string()));
        }
        if sync.backoff_initial_ms > sync.backoff_max_ms {
            exn::bail!(ErrorKind::Invalid("sync.backoff_initial_ms exceeds sync.backoff_max_ms".to_string()));
        }
        if sync.drain_interval_ms == 0 || sync.poll_interval_ms == 0 {
            exn::bail!(ErrorKind::Invalid("sync intervals must be non-zero".to_string()));
        }
        let mut seen = HashSet::new();
        for workspace in &self.workspaces {
            if workspace.id.trim().is_empty() {
                exn::bail!(ErrorKind::Invalid("workspace id must not be empty".to_string()));
            }
            if !seen.insert(workspace.id.as_str()) {
                exn::bail!(ErrorKind::Invalid(format!("duplicate workspace id: {}", workspace.id)));
            }
        }
        Ok(())
    }

    pub fn workspace(&self, id: &str) -> Option<&WorkspaceConfig> {
        self.workspaces.iter().find(|w| w.id == id)
    }
}

/// Queue processing and polling knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Attempts before a queue entry is parked as failed.
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// How often the worker re-checks the queue for entries whose backoff
    /// has elapsed.
    pub drain_interval_ms: u64,
    /// How often workspaces are checked for backend changes.
    pub poll_interval_ms: u64,
}
impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_initial_ms: 500,
            backoff_max_ms: 60_000,
            drain_interval_ms: 2_000,
            poll_interval_ms: 30_000,
        }
    }
}
impl SyncSettings {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub id: String,
    pub name: String,
    pub backend: BackendConfig,
}

/// Where a workspace lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Persistent key/value storage on this device.
    Browser {
        /// Defaults to a directory next to the database.
        #[serde(default)]
        storage_dir: Option<PathBuf>,
    },
    Local {
        path: PathBuf,
    },
    #[serde(alias = "gdrive")]
    Drive {
        folder_id: String,
        /// Environment variable the OAuth access token is read from.
        #[serde(default = "default_token_env")]
        token_env: String,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        region: Option<String>,
        /// Custom endpoint, for S3-compatible services.
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        path_style: bool,
    },
}

fn default_token_env() -> String {
    "VERVE_DRIVE_TOKEN".to_string()
}

impl BackendConfig {
    /// Short name of the backend kind, as used in configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Browser { .. } => "browser",
            Self::Local { .. } => "local",
            Self::Drive { .. } => "drive",
            Self::S3 { .. } => "s3",
        }
    }

    /// Human-readable location, for listings.
    pub fn locator(&self) -> Option<String> {
        match self {
            Self::Browser { storage_dir } => storage_dir.as_ref().map(|dir| dir.display().to_string()),
            Self::Local { path } => Some(path.display().to_string()),
            Self::Drive { folder_id, .. } => Some(folder_id.clone()),
            Self::S3 { bucket, prefix, .. } => Some(match prefix {
                Some(prefix) => format!("s3://{bucket}/{prefix}"),
                None => format!("s3://{bucket}"),
            }),
        }
    }
}
