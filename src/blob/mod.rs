//! Blob Module - Glob listing, batched download and the batch iterator
//!
//! Turns a glob pattern over a remote bucket into a bounded sequence of
//! locally materialized file batches:
//! - Glob listing with ceilings checked page by page
//! - Bounded-concurrency downloads with retry and shared cancellation
//! - Byte-budgeted batching behind a one-batch queue
//! - Temp directory lifecycle

pub mod batcher;
pub mod bucket;
pub mod downloader;
pub mod lister;
pub mod iterator;
pub mod object_store_bucket;

pub use bucket::{Bucket, ByteStream, ListPage, StorageError};
pub use lister::{is_glob_pattern, list_matching, GlobListing};
pub use iterator::BlobIterator;
pub use object_store_bucket::{BlobUrl, ObjectStoreBucket};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// An object in a bucket, as returned by listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Key within the bucket
    pub key: String,

    /// Size in bytes
    pub size: u64,
}

/// A completed download
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadResult {
    pub local_path: PathBuf,
    pub size: u64,
}

/// Group of downloaded files handed to the loader as one unit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    pub files: Vec<PathBuf>,
    pub size_bytes: u64,
}

impl Batch {
    pub fn push(&mut self, result: DownloadResult) {
        self.size_bytes += result.size;
        self.files.push(result.local_path);
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Local paths as strings, in batch order
    pub fn paths(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    /// File names only, for error messages
    pub fn file_names(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| p.to_string_lossy().into_owned())
            })
            .collect()
    }
}

/// Options controlling listing limits, batching and download behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobOptions {
    /// Key or glob pattern within the bucket
    pub pattern: String,

    /// Ceiling on the total size of matched objects, in bytes
    pub max_total_size: u64,

    /// Ceiling on the number of matched objects
    pub max_objects_matched: usize,

    /// Ceiling on the number of objects listed while matching
    pub max_objects_listed: usize,

    /// Objects requested per listing page
    pub page_size: usize,

    /// A batch is emitted once its cumulative size reaches this many bytes
    pub batch_size_bytes: u64,

    /// Keep downloaded files (and the temp directory) after use
    pub keep_files: bool,

    /// Directory under which the private temp directory is created
    pub temp_dir: PathBuf,

    /// Parallel downloads
    pub concurrency: usize,

    /// Retries for transient transport errors, per object
    pub max_retries: u32,

    /// Fixed delay between retries
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
}

impl Default for GlobOptions {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            max_total_size: 100 * 1024 * 1024 * 1024,
            max_objects_matched: 1_000,
            max_objects_listed: 1_000_000,
            page_size: 1_000,
            batch_size_bytes: 2 * 1024 * 1024 * 1024,
            keep_files: false,
            temp_dir: std::env::temp_dir(),
            concurrency: 8,
            max_retries: 5,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl GlobOptions {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Self::default()
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
