//! Test doubles shared by the unit tests.

use crate::{AdapterRegistry, Context, RetryPolicy};
use async_stream::stream;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use verve_cache::{Database, WorkspaceType};
use verve_storage::backend::{RemoteEntryStream, StorageBackend};
use verve_storage::error::{ErrorKind, Result};
use verve_storage::{Capabilities, FileDescriptor, RemoteEntry};

/// A call that reached the backend and succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Push(String, String),
    Delete(String),
}

type Failer = Box<dyn Fn() -> ErrorKind + Send + Sync>;
type Hook = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Backend that keeps files in memory and records every successful call.
/// No versioning, renames or directories unless told otherwise.
#[derive(Default)]
pub struct RecordingBackend {
    capabilities: Capabilities,
    files: Mutex<BTreeMap<String, String>>,
    calls: Mutex<Vec<Call>>,
    fail_all: Mutex<Option<Failer>>,
    fail_paths: Mutex<BTreeMap<String, Failer>>,
    before_push: Mutex<Option<Arc<Hook>>>,
}
impl RecordingBackend {
    pub fn with_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let backend = Self::default();
        backend
            .files
            .lock()
            .unwrap()
            .extend(files.into_iter().map(|(p, c)| (p.to_string(), c.to_string())));
        backend
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Make every push and delete fail.
    pub fn fail_with(&self, error: impl Fn() -> ErrorKind + Send + Sync + 'static) {
        *self.fail_all.lock().unwrap() = Some(Box::new(error));
    }

    /// Make pushes and deletes of one path fail.
    pub fn fail_path(&self, path: &str, error: impl Fn() -> ErrorKind + Send + Sync + 'static) {
        self.fail_paths.lock().unwrap().insert(path.to_string(), Box::new(error));
    }

    /// Stop failing.
    pub fn clear_failures(&self) {
        self.fail_all.lock().unwrap().take();
        self.fail_paths.lock().unwrap().clear();
    }

    /// Content currently stored at a path.
    pub fn content(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Run `hook` at the start of every push.
    pub fn before_push(&self, hook: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static) {
        *self.before_push.lock().unwrap() = Some(Arc::new(Box::new(hook)));
    }

    /// Change content behind the cache's back.
    pub fn set_remote(&self, path: &str, content: &str) {
        self.files.lock().unwrap().insert(path.to_string(), content.to_string());
    }

    fn check(&self, path: &str) -> Result<()> {
        if let Some(fail) = self.fail_all.lock().unwrap().as_ref() {
            exn::bail!(fail());
        }
        if let Some(fail) = self.fail_paths.lock().unwrap().get(path) {
            exn::bail!(fail());
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn push(&self, file: &FileDescriptor, content: &str) -> Result<()> {
        let hook = self.before_push.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook().await;
        }
        self.check(&file.path)?;
        self.files.lock().unwrap().insert(file.path.clone(), content.to_string());
        self.calls.lock().unwrap().push(Call::Push(file.path.clone(), content.to_string()));
        Ok(())
    }

    async fn pull(&self, file: &FileDescriptor) -> Result<Option<String>> {
        Ok(self.files.lock().unwrap().get(&file.path).cloned())
    }

    async fn delete(&self, file: &FileDescriptor) -> Result<bool> {
        self.check(&file.path)?;
        let existed = self.files.lock().unwrap().remove(&file.path).is_some();
        self.calls.lock().unwrap().push(Call::Delete(file.path.clone()));
        Ok(existed)
    }

    fn list_stream<'a>(&'a self, _workspace_id: Option<&'a str>) -> RemoteEntryStream<'a> {
        let entries: Vec<RemoteEntry> =
            self.files.lock().unwrap().keys().map(|path| RemoteEntry::file(path.clone(), path)).collect();
        Box::pin(stream! {
            for entry in entries {
                yield Ok(entry);
            }
        })
    }
}

/// A context over a fresh in-memory cache, with a [`RecordingBackend`] for
/// local workspaces and no retry delay.
pub async fn context() -> (Context, Arc<RecordingBackend>) {
    let backend = Arc::new(RecordingBackend::default());
    let ctx = context_with(AdapterRegistry::new().with_adapter(WorkspaceType::Local, backend.clone())).await;
    (ctx, backend)
}

pub async fn context_with(registry: AdapterRegistry) -> Context {
    let db = Database::connect_in_memory().await.unwrap();
    Context::new(&db, registry).with_retry(RetryPolicy::immediate(3))
}
