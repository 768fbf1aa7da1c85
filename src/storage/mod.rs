//! Object storage abstraction for staged files and dead letters.
//!
//! A [`StorageProvider`] is opened on a URL (`gs://`, `s3://`, `file://`, an
//! absolute path, or `memory://` for a process-local store). Every path
//! handed to it is relative to the key prefix of that URL.

mod gcs;
mod local;
mod s3;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use s3::S3Config;

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider over one of the supported backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Local,
    Memory,
}

// Checked in order; the bare absolute path pattern must stay last.
static MATCHERS: LazyLock<Vec<(Backend, Regex)>> = LazyLock::new(|| {
    [
        (
            Backend::S3,
            r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
        ),
        (
            Backend::S3,
            r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
        ),
        (
            Backend::Gcs,
            r"^(?:[gG][sS]|gcs)://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$",
        ),
        (
            Backend::Gcs,
            r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$",
        ),
        (Backend::Memory, r"^memory:.*$"),
        (Backend::Local, r"^file://(?P<path>.*)$"),
        (Backend::Local, r"^/(?P<path>.*)$"),
    ]
    .into_iter()
    .filter_map(|(backend, pattern)| Regex::new(pattern).ok().map(|re| (backend, re)))
    .collect()
});

/// Backend configuration parsed from a storage URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Local(LocalConfig),
    Memory,
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        let url = url.trim_end_matches('/');
        let found = MATCHERS
            .iter()
            .find_map(|(backend, re)| re.captures(url).map(|caps| (*backend, caps)));

        let Some((backend, caps)) = found else {
            return InvalidUrlSnafu {
                url: url.to_string(),
            }
            .fail();
        };

        let group = |name: &str| caps.name(name).map(|m| m.as_str());
        let key = group("key").map(Path::from);

        Ok(match backend {
            Backend::S3 => {
                let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
                    group("endpoint").map(|host| {
                        format!(
                            "{}://{}:{}",
                            group("protocol").unwrap_or("https"),
                            host,
                            group("port").unwrap_or("443")
                        )
                    })
                });
                BackendConfig::S3(S3Config {
                    endpoint,
                    region: std::env::var("AWS_DEFAULT_REGION").ok(),
                    bucket: group("bucket").unwrap_or_default().to_string(),
                    key,
                })
            }
            Backend::Gcs => BackendConfig::Gcs(GcsConfig {
                bucket: group("bucket").unwrap_or_default().to_string(),
                key,
            }),
            Backend::Local => {
                let path = group("path").unwrap_or_default();
                BackendConfig::Local(LocalConfig {
                    path: format!("/{}", path.trim_start_matches('/')),
                })
            }
            Backend::Memory => BackendConfig::Memory,
        })
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Local(_) | BackendConfig::Memory => None,
        }
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory => Ok(Self::construct_memory()),
        }
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Canonical URL of the storage root, for logging.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// URL the warehouse uses to address `path` from outside this process.
    ///
    /// Snowflake names GCS locations `gcs://` rather than `gs://`.
    pub fn external_location(&self, path: &Path) -> String {
        let qualified = self.qualify_path(path);
        match &self.config {
            BackendConfig::S3(s3) => format!("s3://{}/{}", s3.bucket, qualified),
            BackendConfig::Gcs(gcs) => format!("gcs://{}/{}", gcs.bucket, qualified),
            BackendConfig::Local(local) => {
                format!("file://{}/{}", local.path.trim_end_matches('/'), qualified)
            }
            BackendConfig::Memory => format!("memory:///{qualified}"),
        }
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = match self.object_store.get(&self.qualify_path(path)).await {
            Ok(response) => response.bytes().await,
            Err(e) => Err(e),
        };
        record_request(StorageOperation::Get, result.is_ok(), start);
        result.context(ObjectStoreSnafu)
    }

    /// Put a payload to a path, replacing anything already there.
    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = self
            .object_store
            .put(&self.qualify_path(path), payload)
            .await;
        record_request(StorageOperation::Put, result.is_ok(), start);
        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Delete a file. Deleting a file that is already gone succeeds.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = match self.object_store.delete(&self.qualify_path(path)).await {
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            other => other,
        };
        record_request(StorageOperation::Delete, result.is_ok(), start);
        result.context(ObjectStoreSnafu)
    }

    /// Whether a file exists at `path`.
    pub async fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        let start = Instant::now();
        let result = self.object_store.head(&self.qualify_path(path)).await;
        record_request(StorageOperation::Head, result.is_ok(), start);
        match result {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(source) => Err(StorageError::ObjectStore { source }),
        }
    }

    /// List all files below `prefix`, returned relative to the storage root.
    pub async fn list(&self, prefix: Option<&Path>) -> Result<Vec<Path>, StorageError> {
        let full_prefix: Option<Path> = match (self.config.key(), prefix) {
            (Some(key), Some(prefix)) => Some(key.parts().chain(prefix.parts()).collect()),
            (Some(key), None) => Some(key.clone()),
            (None, prefix) => prefix.cloned(),
        };
        let skip = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let start = Instant::now();
        let result: Result<Vec<_>, _> = self
            .object_store
            .list(full_prefix.as_ref())
            .map_ok(|meta| meta.location.parts().skip(skip).collect::<Path>())
            .try_collect()
            .await;
        record_request(StorageOperation::List, result.is_ok(), start);

        let mut paths = result.context(ObjectStoreSnafu)?;
        paths.sort();
        Ok(paths)
    }
}

fn record_request(operation: StorageOperation, ok: bool, start: Instant) {
    let status = if ok {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    };
    emit!(StorageRequest { operation, status });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}
