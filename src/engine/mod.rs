//! Database Handle - The loader's only contract with the analytical engine
//!
//! The ingestion core never owns a connection. Callers build a handle (for
//! example [`DuckDbHandle`] with the `duckdb` feature), size and share it as
//! they see fit, and pass it in.

pub mod error_classifier;
#[cfg(feature = "duckdb")]
pub mod duckdb_engine;

pub use error_classifier::{classify_engine_message, EngineErrorKind};
#[cfg(feature = "duckdb")]
pub use duckdb_engine::DuckDbHandle;

use crate::schema::TableSchema;
use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by a database handle.
///
/// `kind` is derived once at the handle boundary so that callers branch on
/// the enumeration and never on message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an error from raw engine text, classifying it.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_engine_message(&message),
            message,
        }
    }

    /// Binder and conversion failures are what a drifting source schema
    /// produces on insert.
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(
            self.kind,
            EngineErrorKind::Binder | EngineErrorKind::Conversion
        )
    }
}

/// Handle capable of executing SQL and describing relations
#[async_trait]
pub trait DatabaseHandle: Send + Sync {
    /// Execute a statement, discarding any rows
    async fn execute(&self, sql: &str) -> std::result::Result<(), EngineError>;

    /// Describe the output schema of a query (`SELECT ...`)
    async fn describe(&self, query: &str) -> std::result::Result<TableSchema, EngineError>;

    /// Whether a table with this name exists in the default schema
    async fn table_exists(&self, table: &str) -> std::result::Result<bool, EngineError>;
}

/// Quote an identifier for the engine (`"name"` with embedded quotes doubled)
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for the engine
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
