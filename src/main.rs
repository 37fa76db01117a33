use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spyne_ingest::blob::BlobUrl;
use spyne_ingest::ingestion::SourceSql;
use spyne_ingest::{
    DuckDbHandle, IngestConfig, ObjectStoreBucket, SinkProperties, SourceFormat, Transferer,
};

#[derive(Parser)]
#[command(name = "spyne-ingest")]
#[command(about = "Load files matched in object storage into a DuckDB table")]
struct Args {
    /// Source URL or glob, e.g. gs://bucket/events/*.parquet (local paths are made absolute)
    #[arg(short, long)]
    source: Option<String>,

    /// Source SQL reading exactly one file reference, e.g.
    /// "SELECT * FROM read_csv('s3://bucket/x/*.csv') WHERE id > 0"
    #[arg(long)]
    sql: Option<String>,

    /// Sink table
    #[arg(short, long)]
    table: Option<String>,

    /// DuckDB database file (or set SPYNE_INGEST_DATABASE); in-memory when absent
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// csv, parquet or json; inferred from the file extension by default
    #[arg(long)]
    format: Option<SourceFormat>,

    /// Add new columns and widen changed types instead of rejecting the batch
    #[arg(long)]
    allow_schema_relaxation: bool,

    /// Batch size, e.g. 500MB or 2GiB
    #[arg(long)]
    batch_size: Option<String>,

    /// Keep downloaded files after the transfer
    #[arg(long)]
    keep_files: bool,

    /// JSON config file with limits, source and sink
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = IngestConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if args.keep_files {
        config.glob.keep_files = true;
    }
    config.validate()?;

    let mut source = config.source.clone().unwrap_or_default();
    if args.source.is_some() || args.sql.is_some() {
        source.path = args.source.map(|p| absolutize(&p)).transpose()?;
        source.sql = args.sql;
    }
    if args.format.is_some() {
        source.format = args.format;
    }
    if args.allow_schema_relaxation {
        source.allow_schema_relaxation = true;
    }
    if args.batch_size.is_some() {
        source.batch_size = args.batch_size;
    }
    source.validate()?;

    let sink = match (args.table, &config.sink) {
        (Some(table), _) => SinkProperties::new(table),
        (None, Some(sink)) => sink.clone(),
        (None, None) => bail!("no sink table: pass --table or set sink.table in the config file"),
    };

    let location = match (&source.path, &source.sql) {
        (Some(path), _) => path.clone(),
        (None, Some(sql)) => SourceSql::parse(sql)?.path().to_string(),
        (None, None) => bail!("no source: pass --source or --sql"),
    };
    let url = BlobUrl::parse(&location)
        .with_context(|| format!("source {location:?} must be a URL such as gs://bucket/path/*.csv"))?;
    let bucket = Arc::new(ObjectStoreBucket::from_url(&url)?);

    let db = match args.database.or(config.database.clone()) {
        Some(path) => DuckDbHandle::open(&path)
            .with_context(|| format!("failed to open database {}", path.display()))?,
        None => {
            warn!("no database file given, loading into an in-memory database");
            DuckDbHandle::open_in_memory()?
        }
    };

    info!(source = %url, table = %sink.table, "spyne-ingest starting");

    let transferer = Transferer::new(Arc::new(db)).with_glob_defaults(config.glob.clone());
    let report = transferer
        .transfer(bucket, &source, &sink)
        .await
        .with_context(|| format!("transfer into {:?} failed", sink.table))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Turn a bare local path into a `file://` URL; URLs pass through
fn absolutize(path: &str) -> Result<String> {
    if path.contains("://") {
        return Ok(path.to_string());
    }
    let absolute = std::env::current_dir()
        .context("failed to resolve the current directory")?
        .join(path);
    Ok(format!("file://{}", absolute.display()))
}
