use std::sync::Arc;
use thiserror::Error;

use crate::blob::StorageError;
use crate::engine::EngineError;

#[derive(Error, Debug, Clone)]
pub enum IngestError {
    #[error("Glob limit exceeded: {0}")]
    GlobLimitExceeded(String),

    #[error("No objects found matching pattern {pattern:?}")]
    NoObjectsFound { pattern: String },

    #[error("Invalid glob pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Failed to download {key:?}: {reason}")]
    DownloadFailed { key: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Schema mismatch: {0}")]
    SchemaMismatchRejected(String),

    #[error("Schema reconciliation failed for table {table:?}: {reason}")]
    SchemaReconciliationFailed { table: String, reason: String },

    #[error("SQL source must reference a single file-reading table function, found {0}")]
    MultipleSourceReferences(usize),

    #[error("SQL source has no file-reading table function (expected read_csv, read_parquet or read_json)")]
    NoFileReference,

    #[error("SQL source reads {0} paths, only a single path is supported")]
    MultiplePathsUnsupported(usize),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("Unsupported source format: {0}")]
    UnsupportedFormat(String),

    #[error("{context}: {source}")]
    Engine {
        context: String,
        #[source]
        source: EngineError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl IngestError {
    /// Wrap an engine failure with the statement or step that produced it.
    pub fn engine(context: impl Into<String>, source: EngineError) -> Self {
        IngestError::Engine {
            context: context.into(),
            source,
        }
    }
}

impl From<std::io::Error> for IngestError {
    fn from(e: std::io::Error) -> Self {
        IngestError::Io(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
