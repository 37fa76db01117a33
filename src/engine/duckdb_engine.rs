//! DuckDB Handle - `DatabaseHandle` over an embedded DuckDB connection
//!
//! DuckDB calls are blocking, so each one runs on the blocking pool while
//! holding the connection lock. One handle serializes its statements; open
//! several handles (or `try_clone` connections) for parallel transfers.

use async_trait::async_trait;
use duckdb::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{DatabaseHandle, EngineError, EngineErrorKind};
use crate::schema::{ColumnInfo, TableSchema};

#[derive(Clone)]
pub struct DuckDbHandle {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbHandle {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let conn = Connection::open(path).map_err(engine_error)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(engine_error)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, EngineError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| {
                EngineError::new(EngineErrorKind::Other, "duckdb connection lock poisoned")
            })?;
            f(&guard)
        })
        .await
        .map_err(|e| EngineError::new(EngineErrorKind::Other, format!("duckdb task failed: {e}")))?
    }
}

fn engine_error(e: duckdb::Error) -> EngineError {
    EngineError::from_message(e.to_string())
}

#[async_trait]
impl DatabaseHandle for DuckDbHandle {
    async fn execute(&self, sql: &str) -> Result<(), EngineError> {
        debug!(sql, "duckdb execute");
        let sql = sql.to_string();
        self.with_connection(move |conn| conn.execute_batch(&sql).map_err(engine_error))
            .await
    }

    async fn describe(&self, query: &str) -> Result<TableSchema, EngineError> {
        let describe_sql = format!("DESCRIBE {query}");
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&describe_sql).map_err(engine_error)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ColumnInfo {
                        name: row.get::<_, String>(0)?,
                        data_type: row.get::<_, String>(1)?,
                    })
                })
                .map_err(engine_error)?;

            let mut columns = Vec::new();
            for row in rows {
                columns.push(row.map_err(engine_error)?);
            }
            Ok(TableSchema::new(columns))
        })
        .await
    }

    async fn table_exists(&self, table: &str) -> Result<bool, EngineError> {
        let table = table.to_string();
        self.with_connection(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM information_schema.tables WHERE table_name = ?",
                    duckdb::params![table.as_str()],
                    |row| row.get(0),
                )
                .map_err(engine_error)?;
            Ok(count > 0)
        })
        .await
    }
}
