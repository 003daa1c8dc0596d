//! S3-compatible storage backend.
//!
//! Works with AWS S3 and S3-compatible services (Backblaze B2, Tigris, MinIO,
//! and others). Object keys are the workspace's storage keys under an
//! optional prefix; the ETag serves as the file version.
//!
//! # Credentials
//!
//! Credentials are handed to [`S3Backend::new`] explicitly; this crate never
//! looks them up itself.

use super::RemoteEntryStream;
use crate::error::{ErrorKind, Result};
use crate::path::validate as validate_path;
use crate::{Capabilities, FileDescriptor, RemoteEntry, StorageBackend};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, instrument};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 32;
/// Region used when none is configured; most S3-compatible services ignore it.
const DEFAULT_REGION: &str = "us-east-1";

/// Connection settings for an [`S3Backend`].
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    /// Key prefix (acts as a virtual directory).
    pub prefix: Option<String>,
    pub region: Option<String>,
    /// Custom endpoint URL for S3-compatible services.
    pub endpoint: Option<String>,
    /// Path-style addressing, needed by most self-hosted services.
    pub path_style: bool,
}

/// S3-compatible storage backend.
///
/// # Examples
///
/// ```no_run
/// use verve_storage::backend::{S3Backend, S3Settings};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let settings = S3Settings {
///     bucket: "notes".to_string(),
///     endpoint: Some("https://s3.us-west-004.backblazeb2.com".to_string()),
///     path_style: true,
///     ..Default::default()
/// };
/// let backend = S3Backend::new("my-notes", settings, "access_key_id", "secret_access_key")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    pub fn new(
        name: impl Into<String>,
        settings: S3Settings,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let prefix = settings.prefix.map(validate_path).transpose()?;
        let region = Region::new(settings.region.unwrap_or_else(|| DEFAULT_REGION.to_string()));
        let credentials = Credentials::new(key_id, key_secret, None, None, "verve-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(region)
            // Configure retry policy with exponential backoff (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            .force_path_style(settings.path_style);
        if let Some(endpoint_url) = settings.endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Ok(Self {
            name: name.into(),
            client: Client::from_conf(config_builder.build()),
            bucket: settings.bucket,
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    /// Full object key for a descriptor.
    fn full_key(&self, file: &FileDescriptor) -> Result<String> {
        Ok(prefixed(self.prefix.as_deref(), &file.key()?))
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>> {
        self.rate_limiter
            .acquire()
            .await
            .map_err(|_| exn::Exn::from(ErrorKind::BackendError("request limiter closed".to_string())))
    }

    /// HEAD the object. `None` if it does not exist.
    async fn head(&self, key: &str) -> Result<Option<Option<String>>> {
        let _permit = self.acquire_permit().await?;
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => Ok(Some(output.e_tag().map(str::to_string))),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => Err(map_sdk_error(err, key)),
        }
    }
}

fn prefixed(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{key}", prefix.trim_end_matches('/')),
        None => key.to_string(),
    }
}

/// Strip the configured prefix from an object key.
fn unprefixed<'k>(prefix: Option<&str>, key: &'k str) -> &'k str {
    match prefix {
        Some(prefix) => key
            .strip_prefix(prefix.trim_end_matches('/'))
            .and_then(|s| s.strip_prefix('/'))
            .unwrap_or(key),
        None => key,
    }
}

/// Classify an SDK failure: transport problems are retryable network errors,
/// access errors are not.
fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> crate::error::Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = format!("{key}: {}", DisplayErrorContext(&err));
    let kind = match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => ErrorKind::Network(message),
        SdkError::ServiceError(service) => match service.err().code() {
            Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => ErrorKind::PermissionDenied(message),
            Some("NoSuchBucket") => ErrorKind::NotFound(message),
            _ => ErrorKind::BackendError(message),
        },
        _ => ErrorKind::BackendError(message),
    };
    exn::Exn::from(kind)
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            watch: false,
            versioning: true,
            rename: false,
            directories: false,
            batch: false,
            max_file_size: None,
        }
    }

    #[instrument(skip(self, content), fields(backend = %self.name, path = %file.path))]
    async fn push(&self, file: &FileDescriptor, content: &str) -> Result<()> {
        let key = self.full_key(file)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("text/markdown; charset=utf-8")
            .body(ByteStream::from(content.as_bytes().to_vec()))
            .send()
            .await
            .map_err(|err| map_sdk_error(err, &key))?;
        debug!(key, bytes = content.len(), "object uploaded");
        Ok(())
    }

    async fn pull(&self, file: &FileDescriptor) -> Result<Option<String>> {
        let key = self.full_key(file)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => return Ok(None),
            Err(err) => return Err(map_sdk_error(err, &key)),
        };
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| exn::Exn::from(ErrorKind::Network(format!("{key}: {e}"))))?
            .into_bytes();
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| exn::Exn::from(ErrorKind::BackendError(format!("{key}: not valid UTF-8"))))
    }

    async fn delete(&self, file: &FileDescriptor) -> Result<bool> {
        let key = self.full_key(file)?;
        // DeleteObject succeeds for missing keys, so existence is checked first.
        if self.head(&key).await?.is_none() {
            return Ok(false);
        }
        let _permit = self.acquire_permit().await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, &key))?;
        Ok(true)
    }

    fn list_stream<'a>(&'a self, _workspace_id: Option<&'a str>) -> RemoteEntryStream<'a> {
        Box::pin(stream! {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(self.prefix.as_deref().map(|p| format!("{}/", p.trim_end_matches('/'))))
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = match page {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(map_sdk_error(err, self.prefix.as_deref().unwrap_or("")));
                        return;
                    }
                };
                for object in page.contents() {
                    let Some(key) = object.key() else { continue };
                    let relative = unprefixed(self.prefix.as_deref(), key);
                    // Zero-byte "folder" markers created by other tools.
                    if relative.is_empty() || relative.ends_with('/') {
                        continue;
                    }
                    let entry = RemoteEntry::file(key, relative);
                    yield Ok(match object.e_tag() {
                        Some(etag) => entry.with_version(etag),
                        None => entry,
                    });
                }
            }
        })
    }

    async fn version(&self, file: &FileDescriptor) -> Result<Option<String>> {
        let key = self.full_key(file)?;
        Ok(self.head(&key).await?.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, "Notes/a.md", "Notes/a.md")]
    #[case(Some("library"), "Notes/a.md", "library/Notes/a.md")]
    #[case(Some("library/"), "Notes/a.md", "library/Notes/a.md")]
    fn test_prefixed(#[case] prefix: Option<&str>, #[case] key: &str, #[case] expected: &str) {
        assert_eq!(prefixed(prefix, key), expected);
    }

    #[rstest]
    #[case(None, "Notes/a.md", "Notes/a.md")]
    #[case(Some("library"), "library/Notes/a.md", "Notes/a.md")]
    #[case(Some("library/"), "library/Notes/a.md", "Notes/a.md")]
    #[case(Some("library"), "elsewhere/a.md", "elsewhere/a.md")]
    fn test_unprefixed(#[case] prefix: Option<&str>, #[case] key: &str, #[case] expected: &str) {
        assert_eq!(unprefixed(prefix, key), expected);
    }

    #[test]
    fn test_new_validates_prefix() {
        let settings = S3Settings {
            bucket: "bucket".to_string(),
            prefix: Some("../escape".to_string()),
            ..Default::default()
        };
        assert!(S3Backend::new("s3", settings, "id", "secret").is_err());
    }

    #[test]
    fn test_capabilities() {
        let backend = S3Backend::new("s3", S3Settings { bucket: "b".to_string(), ..Default::default() }, "id", "secret").unwrap();
        let caps = backend.capabilities();
        assert!(caps.versioning);
        assert!(!caps.rename);
        assert!(!caps.directories);
        assert_eq!(backend.full_key(&FileDescriptor::at("/a/b.md")).unwrap(), "a/b.md");
    }
}
