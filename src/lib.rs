pub mod blob;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod schema;

// Re-export the transfer surface
pub use blob::{BlobIterator, Bucket, GlobOptions, ObjectStoreBucket};
pub use config::IngestConfig;
pub use engine::{DatabaseHandle, EngineError, EngineErrorKind};
pub use error::{IngestError, Result};
pub use ingestion::{SinkProperties, SourceFormat, SourceProperties, TransferReport, Transferer};
pub use schema::TableSchema;

// DuckDB handle - only with the `duckdb` feature
#[cfg(feature = "duckdb")]
pub use engine::DuckDbHandle;
