//! Appender - Schema-evolving create-or-append loader
//!
//! The first batch creates the sink table with `CREATE TABLE ... AS`; every
//! later batch is inserted. When an insert fails because the new files do
//! not line up with the table, the appender either widens the table (new
//! columns, promoted types) and retries once by name, or rejects the batch
//! with the offending files and columns.

use itertools::Itertools;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::read_expr::ReadSource;
use crate::blob::Batch;
use crate::engine::{quote_identifier, DatabaseHandle, EngineError};
use crate::error::{IngestError, Result};
use crate::schema::{SchemaDiff, TableSchema};

/// What a successful `load_batch` did to the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Created,
    Appended,
    /// Appended after widening the table
    AppendedAfterReconcile(SchemaDiff),
}

pub struct Appender {
    db: Arc<dyn DatabaseHandle>,
    table: String,
    allow_relaxation: bool,
    created: bool,
    /// Table schema as last known; `None` until first needed
    table_schema: Option<TableSchema>,
    columns_added: usize,
    columns_widened: usize,
}

impl Appender {
    pub fn new(db: Arc<dyn DatabaseHandle>, table: impl Into<String>, allow_relaxation: bool) -> Self {
        Self {
            db,
            table: table.into(),
            allow_relaxation,
            created: false,
            table_schema: None,
            columns_added: 0,
            columns_widened: 0,
        }
    }

    /// Start in append mode against a table that already exists
    pub fn with_existing_table(mut self) -> Self {
        self.created = true;
        self
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn columns_added(&self) -> usize {
        self.columns_added
    }

    pub fn columns_widened(&self) -> usize {
        self.columns_widened
    }

    fn sink(&self) -> String {
        quote_identifier(&self.table)
    }

    /// Create the table from, or append, one batch
    pub async fn load_batch(&mut self, source: &ReadSource, batch: &Batch) -> Result<LoadOutcome> {
        let query = source.query(&batch.paths())?;

        if !self.created {
            let sql = format!("CREATE TABLE {} AS {}", self.sink(), query);
            self.db
                .execute(&sql)
                .await
                .map_err(|e| IngestError::engine(format!("failed to create table {:?}", self.table), e))?;
            self.created = true;
            self.table_schema = None;
            info!(table = %self.table, files = batch.len(), "created table");
            return Ok(LoadOutcome::Created);
        }

        let err = match self.insert(&query, false).await {
            Ok(()) => {
                debug!(table = %self.table, files = batch.len(), "appended batch");
                return Ok(LoadOutcome::Appended);
            }
            Err(e) => e,
        };

        if !err.is_schema_mismatch() {
            return Err(IngestError::engine(
                format!("failed to insert into table {:?}", self.table),
                err,
            ));
        }

        if !self.allow_relaxation {
            return Err(self.reject(&query, batch, err).await);
        }

        warn!(
            table = %self.table,
            files = ?batch.file_names(),
            error = %err,
            "schema mismatch on insert, reconciling"
        );
        let diff = self.reconcile(&query).await?;

        self.insert(&query, true).await.map_err(|e| {
            IngestError::engine(
                format!(
                    "failed to insert into table {:?} after schema reconciliation",
                    self.table
                ),
                e,
            )
        })?;
        Ok(LoadOutcome::AppendedAfterReconcile(diff))
    }

    async fn insert(&self, query: &str, by_name: bool) -> std::result::Result<(), EngineError> {
        let sql = if by_name {
            format!("INSERT INTO {} BY NAME SELECT * FROM ({})", self.sink(), query)
        } else {
            format!("INSERT INTO {} SELECT * FROM ({})", self.sink(), query)
        };
        self.db.execute(&sql).await
    }

    async fn describe(&self, query: &str, what: &str) -> Result<TableSchema> {
        self.db
            .describe(query)
            .await
            .map_err(|e| IngestError::engine(format!("failed to describe {what}"), e))
    }

    async fn cached_table_schema(&mut self) -> Result<TableSchema> {
        if let Some(schema) = &self.table_schema {
            return Ok(schema.clone());
        }
        let schema = self
            .describe(&format!("SELECT * FROM {}", self.sink()), &format!("table {:?}", self.table))
            .await?;
        self.table_schema = Some(schema.clone());
        Ok(schema)
    }

    /// Schema of table ∪ batch as the engine would combine them by name
    async fn union_schema(&self, query: &str) -> Result<TableSchema> {
        let union = format!(
            "SELECT * FROM ((SELECT * FROM {} LIMIT 0) UNION ALL BY NAME (SELECT * FROM ({})))",
            self.sink(),
            query
        );
        self.describe(&union, "union of table and new files").await
    }

    async fn schema_diff(&mut self, query: &str) -> Result<(TableSchema, SchemaDiff)> {
        let batch_schema = self.describe(query, "new files").await?;
        let union_schema = self.union_schema(query).await?;
        let table_schema = self.cached_table_schema().await?;
        debug!(
            table = %self.table,
            table_schema = %table_schema,
            batch_schema = %batch_schema,
            union_schema = %union_schema,
            "computed schemas"
        );
        Ok((batch_schema, table_schema.diff(&union_schema)))
    }

    /// Add missing columns, then widen changed ones, refreshing the cached
    /// table schema after each statement.
    pub async fn reconcile(&mut self, query: &str) -> Result<SchemaDiff> {
        let (_, diff) = self.schema_diff(query).await?;

        for column in &diff.new_columns {
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                self.sink(),
                quote_identifier(&column.name),
                column.data_type
            );
            self.execute_ddl(&sql).await?;
            if let Some(schema) = self.table_schema.as_mut() {
                schema.upsert(&column.name, &column.data_type);
            }
            self.columns_added += 1;
            info!(table = %self.table, column = %column.name, data_type = %column.data_type, "added column");
        }

        for change in &diff.changed_columns {
            let sql = format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                self.sink(),
                quote_identifier(&change.name),
                change.to
            );
            self.execute_ddl(&sql).await?;
            if let Some(schema) = self.table_schema.as_mut() {
                schema.upsert(&change.name, &change.to);
            }
            self.columns_widened += 1;
            info!(table = %self.table, column = %change.name, from = %change.from, to = %change.to, "widened column");
        }

        Ok(diff)
    }

    async fn execute_ddl(&mut self, sql: &str) -> Result<()> {
        if let Err(e) = self.db.execute(sql).await {
            // The table may be half-altered now
            self.table_schema = None;
            return Err(IngestError::SchemaReconciliationFailed {
                table: self.table.clone(),
                reason: format!("{sql}: {e}"),
            });
        }
        Ok(())
    }

    /// Describe how the batch differs from the table, mutating nothing
    async fn reject(&mut self, query: &str, batch: &Batch, cause: EngineError) -> IngestError {
        let files = batch.file_names().join(", ");
        let (batch_schema, diff) = match self.schema_diff(query).await {
            Ok(result) => result,
            Err(e) => return e,
        };

        let mut problems = Vec::new();
        if !diff.new_columns.is_empty() {
            problems.push(format!(
                "columns not present in the table: [{}]",
                diff.new_columns
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.data_type))
                    .join(", ")
            ));
        }
        if !diff.changed_columns.is_empty() {
            problems.push(format!(
                "columns with changed types: [{}]",
                diff.changed_columns
                    .iter()
                    .map(|c| {
                        let found = batch_schema
                            .column(&c.name)
                            .map(|col| col.data_type.as_str())
                            .unwrap_or(c.to.as_str());
                        format!("{} (table {}, new files {})", c.name, c.from, found)
                    })
                    .join(", ")
            ));
        }
        if problems.is_empty() {
            problems.push(format!("a layout the table cannot accept ({})", cause.message));
        }

        IngestError::SchemaMismatchRejected(format!(
            "new files [{}] for table {:?} have {}; enable schema relaxation to evolve the table",
            files,
            self.table,
            problems.join(" and ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineErrorKind;
    use crate::ingestion::SourceFormat;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Engine stand-in: each statement is answered from a script keyed on a
    /// substring; every statement is recorded.
    #[derive(Default)]
    struct ScriptedDb {
        failures: Mutex<Vec<(String, EngineError)>>,
        schemas: Mutex<Vec<(String, TableSchema)>>,
        log: Mutex<Vec<String>>,
    }

    impl ScriptedDb {
        fn fail_once(&self, needle: &str, kind: EngineErrorKind, msg: &str) {
            self.failures
                .lock()
                .unwrap()
                .push((needle.to_string(), EngineError::new(kind, msg)));
        }

        fn describe_as(&self, needle: &str, schema: TableSchema) {
            self.schemas.lock().unwrap().push((needle.to_string(), schema));
        }

        fn statements(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DatabaseHandle for ScriptedDb {
        async fn execute(&self, sql: &str) -> std::result::Result<(), EngineError> {
            self.log.lock().unwrap().push(sql.to_string());
            let mut failures = self.failures.lock().unwrap();
            if let Some(pos) = failures.iter().position(|(n, _)| sql.contains(n.as_str())) {
                return Err(failures.remove(pos).1);
            }
            Ok(())
        }

        async fn describe(&self, query: &str) -> std::result::Result<TableSchema, EngineError> {
            self.log.lock().unwrap().push(format!("DESCRIBE {query}"));
            let schemas = self.schemas.lock().unwrap();
            schemas
                .iter()
                .find(|(n, _)| query.starts_with(n.as_str()))
                .map(|(_, s)| s.clone())
                .ok_or_else(|| EngineError::new(EngineErrorKind::Other, format!("no schema for {query}")))
        }

        async fn table_exists(&self, _table: &str) -> std::result::Result<bool, EngineError> {
            Ok(false)
        }
    }

    fn parquet() -> ReadSource {
        ReadSource::TableFunction {
            format: SourceFormat::Parquet,
            options: BTreeMap::new(),
        }
    }

    fn batch(names: &[&str]) -> Batch {
        Batch {
            files: names.iter().map(|n| PathBuf::from(format!("/tmp/b/{n}"))).collect(),
            size_bytes: 1,
        }
    }

    const TABLE_DESCRIBE: &str = "SELECT * FROM \"events\"";
    const UNION_DESCRIBE: &str = "SELECT * FROM ((SELECT * FROM \"events\" LIMIT 0)";
    const BATCH_DESCRIBE: &str = "SELECT * FROM read_parquet";

    fn widening_db() -> Arc<ScriptedDb> {
        let db = Arc::new(ScriptedDb::default());
        db.describe_as(TABLE_DESCRIBE, TableSchema::from_pairs([("a", "INTEGER"), ("b", "VARCHAR")]));
        db.describe_as(
            UNION_DESCRIBE,
            TableSchema::from_pairs([("a", "BIGINT"), ("b", "VARCHAR"), ("c", "INTEGER")]),
        );
        db.describe_as(
            BATCH_DESCRIBE,
            TableSchema::from_pairs([("a", "BIGINT"), ("b", "VARCHAR"), ("c", "INTEGER")]),
        );
        db
    }

    #[tokio::test]
    async fn test_first_batch_creates_then_appends() {
        let db = Arc::new(ScriptedDb::default());
        let mut appender = Appender::new(db.clone(), "events", false);

        let first = appender.load_batch(&parquet(), &batch(&["1.parquet"])).await.unwrap();
        assert_eq!(first, LoadOutcome::Created);
        assert!(appender.is_created());

        let second = appender.load_batch(&parquet(), &batch(&["2.parquet"])).await.unwrap();
        assert_eq!(second, LoadOutcome::Appended);

        let log = db.statements();
        assert!(log[0].starts_with("CREATE TABLE \"events\" AS SELECT * FROM read_parquet(['/tmp/b/1.parquet'])"));
        assert!(log[1].starts_with("INSERT INTO \"events\" SELECT * FROM (SELECT * FROM read_parquet(['/tmp/b/2.parquet'])"));
    }

    #[tokio::test]
    async fn test_mismatch_with_relaxation_adds_then_widens_then_retries_by_name() {
        let db = widening_db();
        db.fail_once("INSERT INTO \"events\" SELECT", EngineErrorKind::Binder, "Binder Error: table events has 2 columns but 3 values were supplied");

        let mut appender = Appender::new(db.clone(), "events", true).with_existing_table();
        let outcome = appender.load_batch(&parquet(), &batch(&["new.parquet"])).await.unwrap();

        let LoadOutcome::AppendedAfterReconcile(diff) = outcome else {
            panic!("expected reconcile, got {outcome:?}");
        };
        assert_eq!(diff.new_columns.len(), 1);
        assert_eq!(diff.changed_columns.len(), 1);
        assert_eq!(appender.columns_added(), 1);
        assert_eq!(appender.columns_widened(), 1);

        let ddl: Vec<String> = db
            .statements()
            .into_iter()
            .filter(|s| s.starts_with("ALTER") || s.starts_with("INSERT"))
            .collect();
        assert_eq!(
            ddl[1],
            "ALTER TABLE \"events\" ADD COLUMN \"c\" INTEGER"
        );
        assert_eq!(ddl[2], "ALTER TABLE \"events\" ALTER COLUMN \"a\" TYPE BIGINT");
        assert!(ddl[3].starts_with("INSERT INTO \"events\" BY NAME SELECT"));
        assert_eq!(ddl.len(), 4);
    }

    #[tokio::test]
    async fn test_same_new_column_is_added_once() {
        let db = widening_db();
        let mut appender = Appender::new(db.clone(), "events", true).with_existing_table();

        appender.reconcile("SELECT * FROM read_parquet(['/tmp/b/1.parquet'])").await.unwrap();
        let second = appender
            .reconcile("SELECT * FROM read_parquet(['/tmp/b/2.parquet'])")
            .await
            .unwrap();

        assert!(second.is_empty());
        let adds = db
            .statements()
            .iter()
            .filter(|s| s.contains("ADD COLUMN"))
            .count();
        assert_eq!(adds, 1);
        // the table itself was described only once
        let table_describes = db
            .statements()
            .iter()
            .filter(|s| s.as_str() == format!("DESCRIBE {TABLE_DESCRIBE}"))
            .count();
        assert_eq!(table_describes, 1);
    }

    #[tokio::test]
    async fn test_mismatch_without_relaxation_names_files_and_columns() {
        let db = Arc::new(ScriptedDb::default());
        db.describe_as(TABLE_DESCRIBE, TableSchema::from_pairs([("a", "INTEGER"), ("b", "VARCHAR")]));
        db.describe_as(
            UNION_DESCRIBE,
            TableSchema::from_pairs([("a", "INTEGER"), ("b", "VARCHAR"), ("c", "INTEGER")]),
        );
        db.describe_as(
            BATCH_DESCRIBE,
            TableSchema::from_pairs([("a", "INTEGER"), ("b", "VARCHAR"), ("c", "INTEGER")]),
        );
        db.fail_once("INSERT INTO", EngineErrorKind::Binder, "Binder Error: table events has 2 columns but 3 values were supplied");

        let mut appender = Appender::new(db.clone(), "events", false).with_existing_table();
        let err = appender
            .load_batch(&parquet(), &batch(&["part-7.parquet", "part-8.parquet"]))
            .await
            .unwrap_err();

        let IngestError::SchemaMismatchRejected(msg) = err else {
            panic!("expected rejection, got {err:?}");
        };
        assert!(msg.contains("part-7.parquet"));
        assert!(msg.contains("part-8.parquet"));
        assert!(msg.contains("c INTEGER"));
        assert!(db.statements().iter().all(|s| !s.starts_with("ALTER")));
        assert_eq!(db.statements().iter().filter(|s| s.starts_with("INSERT")).count(), 1);
    }

    #[tokio::test]
    async fn test_second_failure_after_reconcile_is_fatal() {
        let db = widening_db();
        db.fail_once("INSERT INTO \"events\" SELECT", EngineErrorKind::Binder, "Binder Error: count");
        db.fail_once("BY NAME", EngineErrorKind::Conversion, "Conversion Error: Could not convert 'x'");

        let mut appender = Appender::new(db.clone(), "events", true).with_existing_table();
        let err = appender.load_batch(&parquet(), &batch(&["x.parquet"])).await.unwrap_err();
        assert!(matches!(err, IngestError::Engine { .. }));
        assert!(err.to_string().contains("after schema reconciliation"));
        assert_eq!(db.statements().iter().filter(|s| s.starts_with("INSERT")).count(), 2);
    }

    #[tokio::test]
    async fn test_non_schema_failure_is_not_reconciled() {
        let db = widening_db();
        db.fail_once("INSERT INTO", EngineErrorKind::Other, "IO Error: disk full");

        let mut appender = Appender::new(db.clone(), "events", true).with_existing_table();
        let err = appender.load_batch(&parquet(), &batch(&["x.parquet"])).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(db.statements().iter().all(|s| !s.starts_with("DESCRIBE")));
    }

    #[tokio::test]
    async fn test_failed_ddl_reports_reconciliation_failure() {
        let db = widening_db();
        db.fail_once("INSERT INTO \"events\" SELECT", EngineErrorKind::Binder, "Binder Error: count");
        db.fail_once("ADD COLUMN", EngineErrorKind::Catalog, "Catalog Error: dependency");

        let mut appender = Appender::new(db.clone(), "events", true).with_existing_table();
        let err = appender.load_batch(&parquet(), &batch(&["x.parquet"])).await.unwrap_err();
        assert!(matches!(err, IngestError::SchemaReconciliationFailed { .. }));
        assert!(db.statements().iter().all(|s| !s.contains("BY NAME")));
    }
}
