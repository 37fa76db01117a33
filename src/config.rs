//! Configuration - Transfer limits from a JSON file and the environment
//!
//! Precedence, lowest first: built-in defaults, the JSON config file,
//! `SPYNE_INGEST_*` environment variables, then whatever the caller (the CLI)
//! sets explicitly.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::blob::GlobOptions;
use crate::error::{IngestError, Result};
use crate::ingestion::{SinkProperties, SourceProperties};

pub const ENV_PREFIX: &str = "SPYNE_INGEST_";

lazy_static! {
    static ref BYTE_SIZE: Regex =
        Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*([kmgt]i?b?|b)?\s*$").unwrap();
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Listing ceilings, batch size and download settings
    pub glob: GlobOptions,

    /// DuckDB database file; in-memory when absent
    pub database: Option<PathBuf>,

    pub source: Option<SourceProperties>,

    pub sink: Option<SinkProperties>,
}

impl IngestConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            IngestError::Config(format!("invalid config file {}: {}", path.display(), e))
        })
    }

    /// Defaults, overlaid with the file when given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply `SPYNE_INGEST_*` overrides read through `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name).map(|value| (name, value))
        };
        let glob = &mut self.glob;

        if let Some((_, v)) = var("MAX_TOTAL_SIZE") {
            glob.max_total_size = parse_byte_size(&v)?;
        }
        if let Some((name, v)) = var("MAX_OBJECTS_MATCHED") {
            glob.max_objects_matched = parse_env(&name, &v)?;
        }
        if let Some((name, v)) = var("MAX_OBJECTS_LISTED") {
            glob.max_objects_listed = parse_env(&name, &v)?;
        }
        if let Some((name, v)) = var("PAGE_SIZE") {
            glob.page_size = parse_env(&name, &v)?;
        }
        if let Some((_, v)) = var("BATCH_SIZE") {
            glob.batch_size_bytes = parse_byte_size(&v)?;
        }
        if let Some((name, v)) = var("KEEP_FILES") {
            glob.keep_files = parse_env(&name, &v)?;
        }
        if let Some((_, v)) = var("TEMP_DIR") {
            glob.temp_dir = PathBuf::from(v);
        }
        if let Some((name, v)) = var("CONCURRENCY") {
            glob.concurrency = parse_env(&name, &v)?;
        }
        if let Some((name, v)) = var("MAX_RETRIES") {
            glob.max_retries = parse_env(&name, &v)?;
        }
        if let Some((name, v)) = var("RETRY_DELAY_MS") {
            glob.retry_delay = Duration::from_millis(parse_env(&name, &v)?);
        }
        if let Some((_, v)) = var("DATABASE") {
            self.database = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.glob.concurrency == 0 {
            return Err(IngestError::Config("concurrency must be at least 1".to_string()));
        }
        if self.glob.page_size == 0 {
            return Err(IngestError::Config("page_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| IngestError::Config(format!("invalid value {value:?} for {name}: {e}")))
}

/// Parse a human byte size: `"1048576"`, `"250MB"`, `"2GiB"`, `"1.5 gb"`.
///
/// Decimal units (KB, MB, ...) are powers of 1000; binary units (KiB, MiB,
/// ...) are powers of 1024.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let invalid = || IngestError::Config(format!("invalid byte size {input:?}"));
    let caps = BYTE_SIZE.captures(input).ok_or_else(invalid)?;

    let number: f64 = caps[1].parse().map_err(|_| invalid())?;
    let unit = caps
        .get(2)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();

    let multiplier: u64 = match unit.trim_end_matches('b') {
        "" => 1,
        "k" => 1_000,
        "m" => 1_000_000,
        "g" => 1_000_000_000,
        "t" => 1_000_000_000_000,
        "ki" => 1 << 10,
        "mi" => 1 << 20,
        "gi" => 1 << 30,
        "ti" => 1 << 40,
        _ => return Err(invalid()),
    };

    let bytes = number * multiplier as f64;
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes.round() as u64)
}
