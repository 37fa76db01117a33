//! Object Store Bucket - `Bucket` implementation over the `object_store` crate

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use lazy_static::lazy_static;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::bucket::{Bucket, ByteStream, ListPage, StorageError};
use super::RemoteObject;
use crate::error::{IngestError, Result};

lazy_static! {
    static ref TRANSIENT: Regex = Regex::new(
        r"(?i)(connection reset|connection closed|broken pipe|unexpected eof|timed out|error decoding response body|stream error)"
    )
    .unwrap();
}

/// Map an `object_store` error onto the retry taxonomy
pub fn classify_store_error(err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { path, .. } => StorageError::NotFound(path),
        other => {
            let msg = other.to_string();
            if TRANSIENT.is_match(&msg) {
                StorageError::Transient(msg)
            } else {
                StorageError::Other(msg)
            }
        }
    }
}

/// A parsed blob URL such as `gs://bucket/path/*.parquet`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUrl {
    /// `s3`, `gs`, `file` or `memory`
    pub scheme: String,
    /// Bucket name (empty for `file` and `memory`)
    pub bucket: String,
    /// Key or glob pattern within the bucket
    pub path: String,
}

impl BlobUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url.split_once("://").ok_or_else(|| IngestError::InvalidPattern {
            pattern: url.to_string(),
            reason: "missing scheme (expected s3://, gs://, file:// or memory://)".to_string(),
        })?;

        let scheme = scheme.to_lowercase();
        match scheme.as_str() {
            "file" | "memory" => Ok(Self {
                scheme,
                bucket: String::new(),
                path: rest.trim_start_matches('/').to_string(),
            }),
            "s3" | "gs" | "gcs" => {
                let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(IngestError::InvalidPattern {
                        pattern: url.to_string(),
                        reason: "missing bucket name".to_string(),
                    });
                }
                Ok(Self {
                    scheme: if scheme == "gcs" { "gs".to_string() } else { scheme },
                    bucket: bucket.to_string(),
                    path: path.to_string(),
                })
            }
            _ => Err(IngestError::InvalidPattern {
                pattern: url.to_string(),
                reason: format!("unsupported scheme {scheme:?}"),
            }),
        }
    }
}

impl fmt::Display for BlobUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme.as_str() {
            "file" => write!(f, "file:///{}", self.path),
            "memory" => write!(f, "memory://{}", self.path),
            _ => write!(f, "{}://{}/{}", self.scheme, self.bucket, self.path),
        }
    }
}

pub struct ObjectStoreBucket {
    store: Arc<dyn ObjectStore>,
    /// Cloud stores list in lexicographic order, which lets a page stop early
    ordered_listing: bool,
}

impl ObjectStoreBucket {
    pub fn new(store: Arc<dyn ObjectStore>, ordered_listing: bool) -> Self {
        Self {
            store,
            ordered_listing,
        }
    }

    pub fn in_memory(store: Arc<InMemory>) -> Self {
        Self::new(store, true)
    }

    /// Build a bucket for a parsed URL; credentials come from the environment
    pub fn from_url(url: &BlobUrl) -> Result<Self> {
        let config_err = |e: object_store::Error| IngestError::Config(e.to_string());
        match url.scheme.as_str() {
            "file" => Ok(Self::new(Arc::new(LocalFileSystem::new()), false)),
            "memory" => Ok(Self::new(Arc::new(InMemory::new()), true)),
            "s3" => {
                let store = AmazonS3Builder::from_env()
                    .with_bucket_name(&url.bucket)
                    .build()
                    .map_err(config_err)?;
                Ok(Self::new(Arc::new(store), true))
            }
            "gs" => {
                let store = GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(&url.bucket)
                    .build()
                    .map_err(config_err)?;
                Ok(Self::new(Arc::new(store), true))
            }
            other => Err(IngestError::Config(format!("unsupported scheme {other:?}"))),
        }
    }
}

fn to_remote(meta: object_store::ObjectMeta) -> RemoteObject {
    RemoteObject {
        key: meta.location.to_string(),
        size: meta.size as u64,
    }
}

#[async_trait]
impl Bucket for ObjectStoreBucket {
    async fn list_page(
        &self,
        prefix: &str,
        token: Option<String>,
        page_size: usize,
    ) -> std::result::Result<ListPage, StorageError> {
        let prefix_path = if prefix.trim_matches('/').is_empty() {
            None
        } else {
            Some(Path::from(prefix))
        };
        let page_size = page_size.max(1);

        let stream = match &token {
            Some(offset) => self
                .store
                .list_with_offset(prefix_path.as_ref(), &Path::from(offset.as_str())),
            None => self.store.list(prefix_path.as_ref()),
        };

        let mut objects: Vec<RemoteObject> = if self.ordered_listing {
            stream
                .take(page_size)
                .map_ok(to_remote)
                .try_collect()
                .await
                .map_err(classify_store_error)?
        } else {
            let mut all: Vec<RemoteObject> = stream
                .map_ok(to_remote)
                .try_collect()
                .await
                .map_err(classify_store_error)?;
            all.sort_by(|a, b| a.key.cmp(&b.key));
            all.truncate(page_size);
            all
        };

        if let Some(offset) = &token {
            objects.retain(|o| o.key.as_str() > offset.as_str());
        }

        let next_token = if objects.len() == page_size {
            objects.last().map(|o| o.key.clone())
        } else {
            None
        };

        debug!(prefix, count = objects.len(), more = next_token.is_some(), "listed page");
        Ok(ListPage {
            objects,
            next_token,
        })
    }

    async fn new_reader(&self, key: &str) -> std::result::Result<ByteStream, StorageError> {
        let result = self
            .store
            .get(&Path::from(key))
            .await
            .map_err(classify_store_error)?;
        Ok(result.into_stream().map_err(classify_store_error).boxed())
    }

    async fn attributes(&self, key: &str) -> std::result::Result<RemoteObject, StorageError> {
        let meta = self
            .store
            .head(&Path::from(key))
            .await
            .map_err(classify_store_error)?;
        Ok(to_remote(meta))
    }
}
