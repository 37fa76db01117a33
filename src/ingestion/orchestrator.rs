//! Transfer Orchestrator - Drives one bucket-to-table transfer
//!
//! Resolves the glob pattern (from the source path or from the user SQL),
//! opens the blob iterator and feeds each batch to the appender until the
//! data runs out or something fails. The iterator is always closed, so the
//! temp directory and bucket handle are released on every exit path.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::appender::{Appender, LoadOutcome};
use super::read_expr::ReadSource;
use super::sql_rewriter::SourceSql;
use super::{SinkProperties, SourceFormat, SourceProperties, TransferReport};
use crate::blob::{Batch, BlobIterator, BlobUrl, Bucket, GlobOptions};
use crate::config::parse_byte_size;
use crate::engine::DatabaseHandle;
use crate::error::{IngestError, Result};

/// Loads files matched in a bucket into a table of the injected database
pub struct Transferer {
    db: Arc<dyn DatabaseHandle>,
    defaults: GlobOptions,
}

impl Transferer {
    pub fn new(db: Arc<dyn DatabaseHandle>) -> Self {
        Self {
            db,
            defaults: GlobOptions::default(),
        }
    }

    /// Limits, batch size and download settings applied to every transfer.
    /// The pattern field is ignored.
    pub fn with_glob_defaults(mut self, defaults: GlobOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub async fn transfer(
        &self,
        bucket: Arc<dyn Bucket>,
        source: &SourceProperties,
        sink: &SinkProperties,
    ) -> Result<TransferReport> {
        source.validate()?;
        sink.validate()?;
        let started_at = Utc::now();

        // Parse before anything touches the bucket
        let source_sql = source.sql.as_deref().map(SourceSql::parse).transpose()?;
        let raw_pattern = match (&source_sql, &source.path) {
            (Some(sql), _) => sql.path().to_string(),
            (None, Some(path)) => path.clone(),
            (None, None) => {
                return Err(IngestError::Config("source must set `path` or `sql`".to_string()))
            }
        };
        let opts = self.glob_options(&raw_pattern, source)?;

        let format = source
            .format
            .or_else(|| source_sql.as_ref().and_then(|s| s.format()))
            .or_else(|| SourceFormat::from_path(&opts.pattern));

        let existed = self
            .db
            .table_exists(&sink.table)
            .await
            .map_err(|e| IngestError::engine(format!("failed to look up table {:?}", sink.table), e))?;

        let mut appender = Appender::new(self.db.clone(), sink.table.clone(), source.allow_schema_relaxation);
        if existed {
            appender = appender.with_existing_table();
        }

        info!(
            table = %sink.table,
            pattern = %opts.pattern,
            format = ?format,
            sql = source_sql.is_some(),
            append = existed,
            relaxation = source.allow_schema_relaxation,
            "starting transfer"
        );

        let mut iter = BlobIterator::open(bucket, opts).await?;
        let mut report = TransferReport {
            table: sink.table.clone(),
            batches: 0,
            files: 0,
            bytes: 0,
            table_created: false,
            columns_added: 0,
            columns_widened: 0,
            started_at,
            finished_at: started_at,
        };

        let read = source_sql.map(ReadSource::Sql);
        let loaded = self
            .load_all(&mut iter, &mut appender, read, format, source, &mut report)
            .await;
        let closed = iter.close().await;

        match (loaded, closed) {
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "failed to clean up after failed transfer");
                }
                error!(table = %sink.table, batches = report.batches, error = %e, "transfer failed");
                return Err(e);
            }
            (Ok(()), Err(e)) => return Err(e),
            (Ok(()), Ok(())) => {}
        }

        report.table_created = !existed && appender.is_created();
        report.columns_added = appender.columns_added();
        report.columns_widened = appender.columns_widened();
        report.finished_at = Utc::now();

        info!(
            table = %report.table,
            batches = report.batches,
            files = report.files,
            bytes = report.bytes,
            created = report.table_created,
            columns_added = report.columns_added,
            columns_widened = report.columns_widened,
            "transfer complete"
        );
        Ok(report)
    }

    fn glob_options(&self, raw_pattern: &str, source: &SourceProperties) -> Result<GlobOptions> {
        let pattern = if raw_pattern.contains("://") {
            BlobUrl::parse(raw_pattern)?.path
        } else {
            raw_pattern.trim_start_matches('/').to_string()
        };

        let mut opts = self.defaults.clone();
        opts.pattern = pattern;
        if let Some(size) = &source.batch_size {
            opts.batch_size_bytes = parse_byte_size(size)?;
        }
        Ok(opts)
    }

    async fn load_all(
        &self,
        iter: &mut BlobIterator,
        appender: &mut Appender,
        mut read: Option<ReadSource>,
        format: Option<SourceFormat>,
        source: &SourceProperties,
        report: &mut TransferReport,
    ) -> Result<()> {
        while let Some(batch) = iter.next().await? {
            // Table-function sources settle their format on the first batch
            // when neither the caller nor the pattern named one.
            let read_source = match read.take() {
                Some(read_source) => read_source,
                None => table_function_source(format, &batch, source)?,
            };

            let outcome = appender.load_batch(&read_source, &batch).await?;
            read = Some(read_source);

            report.batches += 1;
            report.files += batch.len();
            report.bytes += batch.size_bytes;

            match outcome {
                LoadOutcome::AppendedAfterReconcile(diff) => info!(
                    batch = report.batches,
                    files = batch.len(),
                    bytes = batch.size_bytes,
                    new_columns = diff.new_columns.len(),
                    changed_columns = diff.changed_columns.len(),
                    "loaded batch after widening table"
                ),
                outcome => debug!(
                    batch = report.batches,
                    files = batch.len(),
                    bytes = batch.size_bytes,
                    outcome = ?outcome,
                    "loaded batch"
                ),
            }
        }
        Ok(())
    }
}

fn table_function_source(
    format: Option<SourceFormat>,
    batch: &Batch,
    source: &SourceProperties,
) -> Result<ReadSource> {
    let format = match format {
        Some(format) => format,
        None => batch
            .files
            .first()
            .and_then(|f| SourceFormat::from_path(&f.to_string_lossy()))
            .ok_or_else(|| {
                IngestError::UnsupportedFormat(format!(
                    "cannot infer a format from {:?}; set one of csv, parquet or json",
                    batch.file_names().first().cloned().unwrap_or_default()
                ))
            })?,
    };

    let mut options = source.read_options.clone();
    if source.allow_schema_relaxation && !options.contains_key("union_by_name") {
        // files within one batch may disagree on columns too
        options.insert("union_by_name".to_string(), Value::Bool(true));
    }
    Ok(ReadSource::TableFunction { format, options })
}
