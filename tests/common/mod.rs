//! Shared fakes for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use spyne_ingest::blob::{Bucket, ByteStream, ListPage, RemoteObject, StorageError};
use spyne_ingest::engine::{DatabaseHandle, EngineError, EngineErrorKind};
use spyne_ingest::schema::TableSchema;
use spyne_ingest::GlobOptions;

/// Options with fast retries, rooted in `dir`
pub fn glob_options(pattern: &str, dir: &std::path::Path) -> GlobOptions {
    let mut opts = GlobOptions::new(pattern);
    opts.temp_dir = dir.to_path_buf();
    opts.retry_delay = Duration::from_millis(5);
    opts
}

/// In-memory bucket counting every call, with scripted read failures
#[derive(Default)]
pub struct FakeBucket {
    objects: Mutex<BTreeMap<String, Bytes>>,
    transient: Mutex<HashMap<String, usize>>,
    fatal: Mutex<HashSet<String>>,
    read_delay: Mutex<Option<Duration>>,
    readers: AtomicUsize,
    list_calls: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, key: &str, contents: impl Into<Bytes>) -> Self {
        self.put(key, contents);
        self
    }

    /// Add `count` objects of `size` bytes named `{prefix}{i}{suffix}`
    pub fn with_sized(self, prefix: &str, suffix: &str, count: usize, size: usize) -> Self {
        for i in 0..count {
            self.put(&format!("{prefix}{i}{suffix}"), vec![b'x'; size]);
        }
        self
    }

    pub fn put(&self, key: &str, contents: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), contents.into());
    }

    /// The next `times` reads of `key` fail with a transient error
    pub fn fail_transiently(&self, key: &str, times: usize) {
        self.transient.lock().unwrap().insert(key.to_string(), times);
    }

    /// Every read of `key` fails with a non-retryable error
    pub fn fail_permanently(&self, key: &str) {
        self.fatal.lock().unwrap().insert(key.to_string());
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bucket for FakeBucket {
    async fn list_page(
        &self,
        prefix: &str,
        token: Option<String>,
        page_size: usize,
    ) -> Result<ListPage, StorageError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let objects: Vec<RemoteObject> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| token.as_deref().map_or(true, |t| key.as_str() > t))
            .take(page_size)
            .map(|(key, data)| RemoteObject {
                key: key.clone(),
                size: data.len() as u64,
            })
            .collect();

        let next_token = if objects.len() == page_size {
            objects.last().map(|o| o.key.clone())
        } else {
            None
        };
        Ok(ListPage { objects, next_token })
    }

    async fn new_reader(&self, key: &str) -> Result<ByteStream, StorageError> {
        self.readers.fetch_add(1, Ordering::SeqCst);

        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fatal.lock().unwrap().contains(key) {
            return Err(StorageError::Other(format!("403 Forbidden: {key}")));
        }
        {
            let mut transient = self.transient.lock().unwrap();
            if let Some(remaining) = transient.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StorageError::Transient("connection reset by peer".to_string()));
                }
            }
        }

        let data = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        let chunks: Vec<Result<Bytes, StorageError>> = data
            .chunks(64)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn attributes(&self, key: &str) -> Result<RemoteObject, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|data| RemoteObject {
                key: key.to_string(),
                size: data.len() as u64,
            })
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

lazy_static! {
    static ref ADD_COLUMN: Regex =
        Regex::new(r#"^ALTER TABLE "([^"]+)" ADD COLUMN "([^"]+)" (.+)$"#).unwrap();
    static ref ALTER_TYPE: Regex =
        Regex::new(r#"^ALTER TABLE "([^"]+)" ALTER COLUMN "([^"]+)" TYPE (.+)$"#).unwrap();
    static ref UNION_DESCRIBE: Regex = Regex::new(
        r#"^SELECT \* FROM \(\(SELECT \* FROM "([^"]+)" LIMIT 0\) UNION ALL BY NAME"#
    )
    .unwrap();
    static ref TABLE_DESCRIBE: Regex = Regex::new(r#"^SELECT \* FROM "([^"]+)"$"#).unwrap();
}

/// Widening rule: integers widen to wider integers and to DOUBLE; anything
/// else that disagrees becomes VARCHAR.
pub fn promote(a: &str, b: &str) -> String {
    if a.eq_ignore_ascii_case(b) {
        return a.to_string();
    }
    let rank = |t: &str| match t.to_ascii_uppercase().as_str() {
        "INTEGER" => Some(1),
        "BIGINT" => Some(2),
        "DOUBLE" => Some(3),
        _ => None,
    };
    match (rank(a), rank(b)) {
        (Some(x), Some(y)) if x >= y => a.to_string(),
        (Some(_), Some(_)) => b.to_string(),
        _ => "VARCHAR".to_string(),
    }
}

fn union_by_name(schemas: &[TableSchema]) -> TableSchema {
    let mut union = TableSchema::default();
    for schema in schemas {
        for col in &schema.columns {
            let data_type = match union.column(&col.name) {
                Some(existing) => promote(&existing.data_type, &col.data_type),
                None => col.data_type.clone(),
            };
            union.upsert(&col.name, &data_type);
        }
    }
    union
}

#[derive(Default)]
struct DbState {
    tables: HashMap<String, TableSchema>,
    /// File names loaded into each table, in load order
    rows: HashMap<String, Vec<String>>,
    log: Vec<String>,
}

/// Engine stand-in that understands exactly the statements the loader issues.
///
/// Files are recognised by base name inside the query text; each registered
/// file has a fixed schema. Positional inserts fail with a binder error on a
/// column-count mismatch and with a conversion error when a value type does
/// not fit the column.
#[derive(Default)]
pub struct FakeDatabase {
    files: Mutex<Vec<(String, TableSchema)>>,
    state: Mutex<DbState>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_file<I>(&self, name: &str, columns: I)
    where
        I: IntoIterator<Item = (&'static str, &'static str)>,
    {
        self.files
            .lock()
            .unwrap()
            .push((name.to_string(), TableSchema::from_pairs(columns)));
    }

    pub fn create_table<I>(&self, table: &str, columns: I)
    where
        I: IntoIterator<Item = (&'static str, &'static str)>,
    {
        self.state
            .lock()
            .unwrap()
            .tables
            .insert(table.to_string(), TableSchema::from_pairs(columns));
    }

    pub fn table_schema(&self, table: &str) -> Option<TableSchema> {
        self.state.lock().unwrap().tables.get(table).cloned()
    }

    pub fn loaded_files(&self, table: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .rows
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn statements_starting_with(&self, prefix: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.starts_with(prefix))
            .collect()
    }

    /// Registered files referenced by `query`, in order of appearance
    fn files_in(&self, query: &str) -> Vec<(String, TableSchema)> {
        let mut found: Vec<(usize, String, TableSchema)> = self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(name, schema)| {
                query
                    .find(&format!("/{name}'"))
                    .map(|pos| (pos, name.clone(), schema.clone()))
            })
            .collect();
        found.sort_by_key(|(pos, _, _)| *pos);
        found.into_iter().map(|(_, n, s)| (n, s)).collect()
    }

    fn query_schema(&self, query: &str) -> Result<(TableSchema, Vec<String>), EngineError> {
        let files = self.files_in(query);
        if files.is_empty() {
            return Err(EngineError::from_message(format!(
                "IO Error: No files found that match the pattern in {query}"
            )));
        }
        let names = files.iter().map(|(n, _)| n.clone()).collect();
        let schemas: Vec<TableSchema> = files.into_iter().map(|(_, s)| s).collect();
        Ok((union_by_name(&schemas), names))
    }

    fn missing_table(table: &str) -> EngineError {
        EngineError::from_message(format!("Catalog Error: Table with name {table} does not exist!"))
    }

    fn insert(&self, table: &str, by_name: bool, query: &str) -> Result<(), EngineError> {
        let (batch, names) = self.query_schema(query)?;
        let mut state = self.state.lock().unwrap();
        let target = state
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| Self::missing_table(table))?;

        if by_name {
            for col in &batch.columns {
                let Some(existing) = target.column(&col.name) else {
                    return Err(EngineError::from_message(format!(
                        "Binder Error: Table \"{table}\" does not have a column with name \"{}\"",
                        col.name
                    )));
                };
                if promote(&existing.data_type, &col.data_type) != existing.data_type {
                    return Err(EngineError::from_message(format!(
                        "Conversion Error: Could not convert {} to {}",
                        col.data_type, existing.data_type
                    )));
                }
            }
        } else {
            if batch.len() != target.len() {
                return Err(EngineError::from_message(format!(
                    "Binder Error: table {table} has {} columns but {} values were supplied",
                    target.len(),
                    batch.len()
                )));
            }
            for (existing, col) in target.columns.iter().zip(&batch.columns) {
                if promote(&existing.data_type, &col.data_type) != existing.data_type {
                    return Err(EngineError::from_message(format!(
                        "Conversion Error: Could not convert {} to {}",
                        col.data_type, existing.data_type
                    )));
                }
            }
        }

        state.rows.entry(table.to_string()).or_default().extend(names);
        Ok(())
    }
}

fn unquote(name: &str) -> String {
    name.trim().trim_matches('"').to_string()
}

#[async_trait]
impl DatabaseHandle for FakeDatabase {
    async fn execute(&self, sql: &str) -> Result<(), EngineError> {
        self.state.lock().unwrap().log.push(sql.to_string());

        if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
            let (name, query) = rest
                .split_once(" AS ")
                .ok_or_else(|| EngineError::from_message("Parser Error: bad CREATE TABLE"))?;
            let table = unquote(name);
            let (schema, names) = self.query_schema(query)?;
            let mut state = self.state.lock().unwrap();
            if state.tables.contains_key(&table) {
                return Err(EngineError::from_message(format!(
                    "Catalog Error: Table with name \"{table}\" already exists!"
                )));
            }
            state.tables.insert(table.clone(), schema);
            state.rows.insert(table, names);
            return Ok(());
        }

        if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            let (name, rest) = rest
                .split_once(' ')
                .ok_or_else(|| EngineError::from_message("Parser Error: bad INSERT"))?;
            let by_name = rest.starts_with("BY NAME");
            return self.insert(&unquote(name), by_name, rest);
        }

        if let Some(caps) = ADD_COLUMN.captures(sql) {
            let mut state = self.state.lock().unwrap();
            let table = state
                .tables
                .get_mut(&caps[1])
                .ok_or_else(|| Self::missing_table(&caps[1]))?;
            if table.contains(&caps[2]) {
                return Err(EngineError::from_message(format!(
                    "Catalog Error: Column with name {} already exists!",
                    &caps[2]
                )));
            }
            table.upsert(&caps[2], &caps[3]);
            return Ok(());
        }

        if let Some(caps) = ALTER_TYPE.captures(sql) {
            let mut state = self.state.lock().unwrap();
            let table = state
                .tables
                .get_mut(&caps[1])
                .ok_or_else(|| Self::missing_table(&caps[1]))?;
            table.upsert(&caps[2], &caps[3]);
            return Ok(());
        }

        Err(EngineError::new(
            EngineErrorKind::Other,
            format!("unsupported statement: {sql}"),
        ))
    }

    async fn describe(&self, query: &str) -> Result<TableSchema, EngineError> {
        self.state
            .lock()
            .unwrap()
            .log
            .push(format!("DESCRIBE {query}"));

        if let Some(caps) = UNION_DESCRIBE.captures(query) {
            let table = self
                .table_schema(&caps[1])
                .ok_or_else(|| Self::missing_table(&caps[1]))?;
            let (batch, _) = self.query_schema(query)?;
            return Ok(union_by_name(&[table, batch]));
        }
        if let Some(caps) = TABLE_DESCRIBE.captures(query) {
            return self
                .table_schema(&caps[1])
                .ok_or_else(|| Self::missing_table(&caps[1]));
        }
        Ok(self.query_schema(query)?.0)
    }

    async fn table_exists(&self, table: &str) -> Result<bool, EngineError> {
        Ok(self.state.lock().unwrap().tables.contains_key(table))
    }
}
