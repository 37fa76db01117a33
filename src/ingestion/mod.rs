//! Ingestion Module - Object storage to DuckDB transfers
//!
//! Handles loading batches of downloaded files into a table with:
//! - Table creation from the first batch
//! - Appends for every following batch
//! - Schema drift detection and optional widening
//! - User SQL rewritten per batch

pub mod appender;
pub mod orchestrator;
pub mod read_expr;
pub mod sql_rewriter;

pub use appender::{Appender, LoadOutcome};
pub use orchestrator::Transferer;
pub use read_expr::{table_function, ReadSource};
pub use sql_rewriter::SourceSql;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{IngestError, Result};

/// File formats the engine's table functions read
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Csv,
    Parquet,
    Json,
}

impl SourceFormat {
    /// Infer from a file name or pattern, ignoring compression suffixes
    pub fn from_path(path: &str) -> Option<Self> {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())?;
        let name = ["gz", "gzip", "zst", "zstd"]
            .iter()
            .find_map(|ext| name.strip_suffix(&format!(".{ext}")).map(str::to_string))
            .unwrap_or(name);

        match name.rsplit_once('.')?.1 {
            "csv" | "tsv" | "txt" => Some(SourceFormat::Csv),
            "parquet" | "pq" => Some(SourceFormat::Parquet),
            "json" | "ndjson" | "jsonl" => Some(SourceFormat::Json),
            _ => None,
        }
    }

    /// Format read by a file-reading SQL function
    pub fn from_function(name: &str) -> Option<Self> {
        match name {
            "read_csv" | "read_csv_auto" => Some(SourceFormat::Csv),
            "read_parquet" | "parquet_scan" => Some(SourceFormat::Parquet),
            "read_json" | "read_json_auto" | "read_ndjson" | "read_ndjson_auto" => {
                Some(SourceFormat::Json)
            }
            _ => None,
        }
    }

    pub fn table_function_name(&self) -> &'static str {
        match self {
            SourceFormat::Csv => "read_csv_auto",
            SourceFormat::Parquet => "read_parquet",
            SourceFormat::Json => "read_json_auto",
        }
    }
}

impl FromStr for SourceFormat {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(SourceFormat::Csv),
            "parquet" => Ok(SourceFormat::Parquet),
            "json" | "ndjson" => Ok(SourceFormat::Json),
            other => Err(IngestError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFormat::Csv => write!(f, "csv"),
            SourceFormat::Parquet => write!(f, "parquet"),
            SourceFormat::Json => write!(f, "json"),
        }
    }
}

/// Where to read from and how
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceProperties {
    /// Glob pattern or key in the bucket, or a full URL (`gs://bucket/x/*.csv`)
    pub path: Option<String>,

    /// Source SQL reading a single file reference; its path acts as the pattern
    pub sql: Option<String>,

    /// Explicit format; inferred from the path or first file when absent
    pub format: Option<SourceFormat>,

    /// Allow adding columns and widening types on the sink table
    pub allow_schema_relaxation: bool,

    /// Extra table-function options (e.g. `sample_size`, `header`)
    pub read_options: BTreeMap<String, Value>,

    /// Per-source batch size override, e.g. "500MB"
    pub batch_size: Option<String>,
}

impl SourceProperties {
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn from_sql(sql: impl Into<String>) -> Self {
        Self {
            sql: Some(sql.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.path, &self.sql) {
            (Some(_), Some(_)) => Err(IngestError::Config(
                "source must set either `path` or `sql`, not both".to_string(),
            )),
            (None, None) => Err(IngestError::Config(
                "source must set `path` or `sql`".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Target of a transfer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SinkProperties {
    pub table: String,
}

impl SinkProperties {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(IngestError::Config("sink table name is empty".to_string()));
        }
        Ok(())
    }
}

/// Summary of a completed transfer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferReport {
    pub table: String,
    pub batches: usize,
    pub files: usize,
    pub bytes: u64,
    /// The table did not exist before this transfer
    pub table_created: bool,
    pub columns_added: usize,
    pub columns_widened: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
