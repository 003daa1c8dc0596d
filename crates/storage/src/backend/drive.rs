//! Google Drive storage backend (Drive v3 REST API).
//!
//! Drive has no paths, only files with parent folders, so every logical path
//! is resolved by walking folder names down from the workspace's root folder.
//! Uploads use multipart requests (metadata + content), and the Drive file
//! `version` number serves as the version for optimistic concurrency checks.

use super::RemoteEntryStream;
use crate::error::{ErrorKind, Result};
use crate::{Capabilities, FileDescriptor, RemoteEntry, StorageBackend};
use async_stream::stream;
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use reqwest::{Client, Response, StatusCode, multipart};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const API_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_MIME_TYPE: &str = "text/markdown; charset=utf-8";
const FILE_FIELDS: &str = "id,name,mimeType,version";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of OAuth access tokens.
///
/// Asked for a token immediately before every request, so implementations
/// are free to refresh behind the scenes.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// A fixed token.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        match self.0.is_empty() {
            true => exn::bail!(ErrorKind::Unauthenticated),
            false => Ok(self.0.clone()),
        }
    }
}

/// A token read from an environment variable on every request, so that an
/// external process can rotate it.
pub struct EnvToken(pub String);

#[async_trait]
impl TokenProvider for EnvToken {
    async fn access_token(&self) -> Result<String> {
        std::env::var(&self.0)
            .ok()
            .filter(|token| !token.is_empty())
            .ok_or_raise(|| ErrorKind::Unauthenticated)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    version: Option<String>,
}
impl DriveFile {
    fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

/// Google Drive storage backend, rooted at a folder.
pub struct DriveBackend {
    name: String,
    root_folder_id: String,
    client: Client,
    tokens: Arc<dyn TokenProvider>,
}

impl DriveBackend {
    pub fn new(name: impl Into<String>, root_folder_id: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .or_raise(|| ErrorKind::BackendError("cannot build HTTP client".to_string()))?;
        Ok(Self {
            name: name.into(),
            root_folder_id: root_folder_id.into(),
            client,
            tokens,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder, context: &str) -> Result<Response> {
        let token = self.tokens.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .or_raise(|| ErrorKind::Network(context.to_string()))?;
        check_status(response, context).await
    }

    /// Children of a folder, optionally restricted to one name.
    async fn children(&self, folder_id: &str, name: Option<&str>) -> Result<Vec<DriveFile>> {
        let mut query = format!("'{}' in parents and trashed = false", escape_query(folder_id));
        if let Some(name) = name {
            query.push_str(&format!(" and name = '{}'", escape_query(name)));
        }
        let fields = format!("nextPageToken,files({FILE_FIELDS})");
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![("q", query.clone()), ("fields", fields.clone()), ("pageSize", "1000".to_string())];
            if let Some(token) = page_token.take() {
                params.push(("pageToken", token));
            }
            let response = self.send(self.client.get(API_URL).query(&params), folder_id).await?;
            let page: FileList = response
                .json()
                .await
                .or_raise(|| ErrorKind::BackendError(format!("unexpected listing for {folder_id}")))?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(files),
            }
        }
    }

    async fn child(&self, folder_id: &str, name: &str) -> Result<Option<DriveFile>> {
        Ok(self.children(folder_id, Some(name)).await?.into_iter().next())
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<String> {
        let metadata = json!({ "name": name, "mimeType": FOLDER_MIME_TYPE, "parents": [parent_id] });
        let request = self.client.post(API_URL).query(&[("fields", "id")]).json(&metadata);
        let created: serde_json::Value = self
            .send(request, name)
            .await?
            .json()
            .await
            .or_raise(|| ErrorKind::BackendError(format!("unexpected response creating {name}")))?;
        created["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_raise(|| ErrorKind::BackendError(format!("no folder id for {name}")))
    }

    /// Walk folder names down from the root. Missing folders are created when
    /// `create` is set, otherwise the walk yields `None`.
    async fn resolve_folder(&self, names: &[&str], create: bool) -> Result<Option<String>> {
        let mut current = self.root_folder_id.clone();
        for name in names {
            current = match self.child(&current, name).await? {
                Some(folder) if folder.is_folder() => folder.id,
                Some(_) => exn::bail!(ErrorKind::AlreadyExists((*name).to_string())),
                None if create => self.create_folder(&current, name).await?,
                None => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    /// Locate the Drive file at a storage key.
    async fn find(&self, key: &str) -> Result<Option<DriveFile>> {
        let (folders, leaf) = split_key(key);
        match self.resolve_folder(&folders, false).await? {
            Some(parent) => self.child(&parent, leaf).await,
            None => Ok(None),
        }
    }

    async fn download(&self, file: &DriveFile) -> Result<String> {
        let request = self.client.get(format!("{API_URL}/{}", file.id)).query(&[("alt", "media")]);
        self.send(request, &file.name)
            .await?
            .text()
            .await
            .or_raise(|| ErrorKind::Network(file.name.clone()))
    }
}

/// Split a storage key into its folder names and leaf name.
fn split_key(key: &str) -> (Vec<&str>, &str) {
    let mut parts: Vec<&str> = key.split('/').collect();
    let leaf = parts.pop().unwrap_or(key);
    (parts, leaf)
}

/// Escape a literal for the Drive query language.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Error category of a failed (non-2xx) response.
fn status_kind(status: StatusCode, message: String) -> ErrorKind {
    match status {
        StatusCode::UNAUTHORIZED => ErrorKind::Unauthenticated,
        StatusCode::FORBIDDEN => ErrorKind::PermissionDenied(message),
        StatusCode::NOT_FOUND => ErrorKind::NotFound(message),
        StatusCode::PRECONDITION_FAILED => ErrorKind::Conflict(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => ErrorKind::Network(message),
        _ => ErrorKind::BackendError(message),
    }
}

async fn check_status(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{context}: Drive API error {status}: {body}");
    exn::bail!(status_kind(status, message))
}

#[async_trait]
impl StorageBackend for DriveBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            watch: false,
            versioning: true,
            rename: true,
            directories: true,
            batch: false,
            max_file_size: None,
        }
    }

    #[instrument(skip(self, content), fields(backend = %self.name, path = %file.path))]
    async fn push(&self, file: &FileDescriptor, content: &str) -> Result<()> {
        let key = file.key()?;
        let (folders, leaf) = split_key(&key);
        let parent = self
            .resolve_folder(&folders, true)
            .await?
            .ok_or_raise(|| ErrorKind::NotFound(file.path.clone()))?;
        let existing = self.child(&parent, leaf).await?;
        if let Some(existing) = &existing {
            if existing.is_folder() {
                exn::bail!(ErrorKind::AlreadyExists(file.path.clone()));
            }
            if let (Some(expected), Some(current)) = (file.expected_version(), existing.version.as_deref())
                && expected != current
            {
                exn::bail!(ErrorKind::Conflict(file.path.clone()));
            }
        }

        let metadata = match &existing {
            Some(_) => json!({ "name": leaf }),
            None => json!({ "name": leaf, "parents": [parent] }),
        };
        let metadata_part = multipart::Part::text(metadata.to_string())
            .mime_str("application/json")
            .or_raise(|| ErrorKind::BackendError("invalid metadata part".to_string()))?;
        let file_part = multipart::Part::text(content.to_string())
            .file_name(leaf.to_string())
            .mime_str(FILE_MIME_TYPE)
            .or_raise(|| ErrorKind::BackendError("invalid content part".to_string()))?;
        let form = multipart::Form::new().part("metadata", metadata_part).part("file", file_part);

        let request = match &existing {
            Some(existing) => self.client.patch(format!("{UPLOAD_URL}/{}", existing.id)),
            None => self.client.post(UPLOAD_URL),
        };
        let request = request.query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)]).multipart(form);
        self.send(request, &file.path).await?;
        debug!(key, created = existing.is_none(), "file uploaded");
        Ok(())
    }

    async fn pull(&self, file: &FileDescriptor) -> Result<Option<String>> {
        match self.find(&file.key()?).await? {
            Some(found) if !found.is_folder() => self.download(&found).await.map(Some),
            _ => Ok(None),
        }
    }

    async fn delete(&self, file: &FileDescriptor) -> Result<bool> {
        let Some(found) = self.find(&file.key()?).await? else {
            return Ok(false);
        };
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .delete(format!("{API_URL}/{}", found.id))
            .bearer_auth(token)
            .send()
            .await
            .or_raise(|| ErrorKind::Network(file.path.clone()))?;
        // Already gone (deleted concurrently) counts as success.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response, &file.path).await?;
        Ok(true)
    }

    fn list_stream<'a>(&'a self, _workspace_id: Option<&'a str>) -> RemoteEntryStream<'a> {
        Box::pin(stream! {
            let mut pending = vec![(self.root_folder_id.clone(), String::new())];
            while let Some((folder_id, prefix)) = pending.pop() {
                let children = match self.children(&folder_id, None).await {
                    Ok(children) => children,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                for child in children {
                    let key = match prefix.is_empty() {
                        true => child.name.clone(),
                        false => format!("{prefix}/{}", child.name),
                    };
                    if child.is_folder() {
                        yield Ok(RemoteEntry::directory(child.id.clone(), &key));
                        pending.push((child.id, key));
                    } else {
                        let entry = RemoteEntry::file(child.id, &key);
                        yield Ok(match child.version {
                            Some(version) => entry.with_version(version),
                            None => entry,
                        });
                    }
                }
            }
        })
    }

    async fn create_directory(&self, dir: &FileDescriptor) -> Result<()> {
        let key = dir.key()?;
        let names: Vec<&str> = key.split('/').collect();
        self.resolve_folder(&names, true).await?;
        Ok(())
    }

    async fn rename(&self, from: &FileDescriptor, to: &FileDescriptor) -> Result<()> {
        let source = self
            .find(&from.key()?)
            .await?
            .ok_or_raise(|| ErrorKind::NotFound(from.path.clone()))?;
        let (from_key, to_key) = (from.key()?, to.key()?);
        let (old_folders, _) = split_key(&from_key);
        let (new_folders, new_leaf) = split_key(&to_key);
        let mut request = self
            .client
            .patch(format!("{API_URL}/{}", source.id))
            .json(&json!({ "name": new_leaf }));
        if old_folders != new_folders {
            let old_parent = self
                .resolve_folder(&old_folders, false)
                .await?
                .ok_or_raise(|| ErrorKind::NotFound(from.path.clone()))?;
            let new_parent = self
                .resolve_folder(&new_folders, true)
                .await?
                .ok_or_raise(|| ErrorKind::NotFound(to.path.clone()))?;
            request = request.query(&[("addParents", new_parent), ("removeParents", old_parent)]);
        }
        self.send(request, &from.path).await?;
        Ok(())
    }

    async fn version(&self, file: &FileDescriptor) -> Result<Option<String>> {
        Ok(self
            .find(&file.key()?)
            .await?
            .filter(|found| !found.is_folder())
            .and_then(|found| found.version))
    }
}
