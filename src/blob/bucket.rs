//! Bucket Trait - Abstract interface for remote object storage

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

use super::RemoteObject;

/// Storage failure, pre-classified by the adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Connection or stream reset; the operation may be retried
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, StorageError>>;

/// One page of a paginated listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<RemoteObject>,
    /// Token for the following page, `None` once the listing is exhausted
    pub next_token: Option<String>,
}

/// Handle to a single bucket
///
/// Implementations:
/// - ObjectStoreBucket: any `object_store` backend (local, S3, GCS, memory)
#[async_trait]
pub trait Bucket: Send + Sync {
    /// List up to `page_size` objects under `prefix`, continuing from `token`
    async fn list_page(
        &self,
        prefix: &str,
        token: Option<String>,
        page_size: usize,
    ) -> std::result::Result<ListPage, StorageError>;

    /// Open a byte stream over an object's contents
    async fn new_reader(&self, key: &str) -> std::result::Result<ByteStream, StorageError>;

    /// Fetch a single object's attributes
    async fn attributes(&self, key: &str) -> std::result::Result<RemoteObject, StorageError>;

    /// Release the handle
    async fn close(&self) -> std::result::Result<(), StorageError> {
        Ok(())
    }
}
