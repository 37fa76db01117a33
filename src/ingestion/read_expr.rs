//! Read Expressions - Format-specific table functions over batch files

use serde_json::Value;
use std::collections::BTreeMap;

use super::sql_rewriter::SourceSql;
use super::SourceFormat;
use crate::engine::quote_literal;
use crate::error::{IngestError, Result};

/// How a batch of local files is turned into a query
#[derive(Debug, Clone)]
pub enum ReadSource {
    /// `SELECT * FROM read_<format>([files], options...)`
    TableFunction {
        format: SourceFormat,
        options: BTreeMap<String, Value>,
    },
    /// User SQL with its file reference rewritten per batch
    Sql(SourceSql),
}

impl ReadSource {
    /// A full `SELECT` over `paths`
    pub fn query(&self, paths: &[String]) -> Result<String> {
        if paths.is_empty() {
            return Err(IngestError::InvalidSql(
                "cannot build a read query over an empty batch".to_string(),
            ));
        }
        match self {
            ReadSource::TableFunction { format, options } => {
                Ok(format!("SELECT * FROM {}", table_function(*format, paths, options)))
            }
            ReadSource::Sql(source) => Ok(source.rewrite(paths)),
        }
    }
}

/// Render `read_csv_auto([...], k=v, ...)` and friends
pub fn table_function(
    format: SourceFormat,
    paths: &[String],
    options: &BTreeMap<String, Value>,
) -> String {
    let files = paths
        .iter()
        .map(|p| quote_literal(p))
        .collect::<Vec<_>>()
        .join(", ");

    let mut args = vec![format!("[{files}]")];
    for (key, value) in options {
        if let Some(rendered) = render_value(value) {
            args.push(format!("{key}={rendered}"));
        }
    }

    format!("{}({})", format.table_function_name(), args.join(", "))
}

/// Render a JSON option value as an engine literal; `null` drops the option
fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(quote_literal(s)),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().filter_map(render_value).collect();
            Some(format!("[{}]", rendered.join(", ")))
        }
        Value::Object(map) => {
            let rendered: Vec<String> = map
                .iter()
                .filter_map(|(k, v)| render_value(v).map(|v| format!("{}: {}", quote_literal(k), v)))
                .collect();
            Some(format!("{{{}}}", rendered.join(", ")))
        }
    }
}
