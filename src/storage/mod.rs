//! Storage abstraction over S3, the local filesystem and in-memory stores.
//!
//! Backends are chosen from the URL: `s3://bucket/prefix`, `/abs/path`,
//! `file:///abs/path` or `memory://name`.

mod local;
mod memory;
mod s3;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, TryStreamExt, future::ready};
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

pub use local::LocalConfig;
pub use memory::MemoryConfig;
pub use s3::S3Config;

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over different backends.
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

/// An object found by listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    /// Path relative to the provider's prefix.
    pub path: Path,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

const MEMORY_URL: &str = r"^memory://(?P<name>[\w\-\.]+)(/(?P<key>.+))?$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Local,
    Memory,
}

static MATCHERS: LazyLock<Vec<(Backend, Vec<Regex>)>> = LazyLock::new(|| {
    let compile = |patterns: &[&str]| -> Vec<Regex> {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("storage URL pattern is valid"))
            .collect()
    };
    vec![
        (Backend::S3, compile(&[S3_PATH, S3_VIRTUAL, S3_URL])),
        (Backend::Memory, compile(&[MEMORY_URL])),
        (Backend::Local, compile(&[FILE_URI, FILE_URL, FILE_PATH])),
    ]
});

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
    Memory(MemoryConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, patterns) in MATCHERS.iter() {
            if let Some(caps) = patterns.iter().find_map(|r| r.captures(url)) {
                return Ok(match backend {
                    Backend::S3 => Self::parse_s3(&caps),
                    Backend::Local => Self::parse_local(&caps),
                    Backend::Memory => Self::parse_memory(&caps),
                });
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(caps: &regex::Captures) -> Self {
        let bucket = caps
            .name("bucket")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| caps.name("region").map(|m| m.as_str().to_string()));
        let endpoint = std::env::var("AWS_ENDPOINT").ok();
        let key = caps.name("key").map(|m| m.as_str().into());

        BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key,
        })
    }

    fn parse_local(caps: &regex::Captures) -> Self {
        let path = caps.name("path").map(|m| m.as_str()).unwrap_or_default();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        BackendConfig::Local(LocalConfig { path })
    }

    fn parse_memory(caps: &regex::Captures) -> Self {
        BackendConfig::Memory(MemoryConfig {
            name: caps
                .name("name")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            key: caps.name("key").map(|m| m.as_str().into()),
        })
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Local(_) => None,
            BackendConfig::Memory(memory) => memory.key.as_ref(),
        }
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL.
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        Self::for_url_with_options(url, HashMap::new()).await
    }

    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options),
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory(config) => Ok(Self::construct_memory(config)),
        }
    }

    /// List objects under the configured prefix.
    /// Returns paths relative to the prefix.
    pub fn list(
        &self,
        include_subdirectories: bool,
    ) -> impl Stream<Item = Result<ListedObject, StorageError>> + '_ {
        emit!(StorageRequest {
            operation: StorageOperation::List,
            status: RequestStatus::Success,
        });

        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        self.object_store
            .list(self.config.key())
            .filter_map(move |meta| {
                let item = match meta {
                    Ok(meta) => {
                        let depth = meta.location.parts().count();
                        if !include_subdirectories && depth != key_part_count + 1 {
                            None
                        } else {
                            let path: Path = meta.location.parts().skip(key_part_count).collect();
                            Some(Ok(ListedObject {
                                path,
                                size: meta.size,
                                last_modified: meta.last_modified,
                            }))
                        }
                    }
                    Err(err) => Some(Err(err)),
                };
                ready(item)
            })
            .map_err(|source| StorageError::ObjectStore { source })
    }

    /// Collect a listing into a vector sorted by path.
    pub async fn list_all(
        &self,
        include_subdirectories: bool,
    ) -> Result<Vec<ListedObject>, StorageError> {
        let mut objects: Vec<ListedObject> =
            self.list(include_subdirectories).try_collect().await?;
        objects.sort_by(|a, b| a.path.as_ref().cmp(b.path.as_ref()));
        Ok(objects)
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(&path)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status: status_of(&result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::Get,
            duration: start.elapsed(),
        });

        result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)
    }

    /// Write bytes to a path, replacing any existing object.
    pub async fn put(&self, path: impl Into<Path>, bytes: Bytes) -> Result<(), StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self
            .object_store
            .put(&self.qualify_path(&path), PutPayload::from(bytes))
            .await;

        emit!(StorageRequest {
            operation: StorageOperation::Put,
            status: status_of(&result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::Put,
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }
}

fn status_of<T, E>(result: &Result<T, E>) -> RequestStatus {
    if result.is_ok() {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_s3_urls() {
        let config = BackendConfig::parse_url("s3://tddf-bucket/inbox/2024").unwrap();
        let BackendConfig::S3(s3) = config else {
            panic!("expected S3 config");
        };
        assert_eq!(s3.bucket, "tddf-bucket");
        assert_eq!(s3.key, Some(Path::from("inbox/2024")));

        let config =
            BackendConfig::parse_url("https://s3.eu-west-1.amazonaws.com/tddf-bucket/inbox")
                .unwrap();
        assert!(matches!(config, BackendConfig::S3(_)));
    }

    #[test]
    fn test_parse_local_and_memory_urls() {
        assert_eq!(
            BackendConfig::parse_url("/var/tddf/inbox").unwrap(),
            BackendConfig::Local(LocalConfig {
                path: "/var/tddf/inbox".to_string()
            })
        );
        assert_eq!(
            BackendConfig::parse_url("file:///var/tddf").unwrap(),
            BackendConfig::Local(LocalConfig {
                path: "/var/tddf".to_string()
            })
        );
        assert_eq!(
            BackendConfig::parse_url("memory://scratch/inbox").unwrap(),
            BackendConfig::Memory(MemoryConfig {
                name: "scratch".to_string(),
                key: Some(Path::from("inbox")),
            })
        );
    }

    #[test]
    fn test_invalid_url() {
        let err = BackendConfig::parse_url("ftp://nope").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_local_put_get_list() {
        let dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url(dir.path().to_str().unwrap())
            .await
            .unwrap();

        storage
            .put("b.TSYSO", Bytes::from_static(b"line\n"))
            .await
            .unwrap();
        storage
            .put("a.TSYSO", Bytes::from_static(b"one\ntwo\n"))
            .await
            .unwrap();
        storage
            .put("nested/c.TSYSO", Bytes::from_static(b"x"))
            .await
            .unwrap();

        let top = storage.list_all(false).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].path.as_ref(), "a.TSYSO");
        assert_eq!(top[0].size, 8);

        let all = storage.list_all(true).await.unwrap();
        assert_eq!(all.len(), 3);

        let bytes = storage.get("a.TSYSO").await.unwrap();
        assert_eq!(&bytes[..], b"one\ntwo\n");
    }

    #[tokio::test]
    async fn test_memory_stores_are_shared_by_name() {
        let writer = StorageProvider::for_url("memory://shared-test/inbox")
            .await
            .unwrap();
        let reader = StorageProvider::for_url("memory://shared-test/inbox")
            .await
            .unwrap();

        writer
            .put("f1", Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert_eq!(&reader.get("f1").await.unwrap()[..], b"data");

        let err = reader.get("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
