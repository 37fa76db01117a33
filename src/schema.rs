//! Table Schema - Ordered column model shared by the loader and the engine handle

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Engine type string as reported by DESCRIBE (e.g. "BIGINT", "VARCHAR")
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Ordered mapping of column name to engine type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self { columns }
    }

    /// Build from `(name, type)` pairs, mostly for tests and engine adapters
    pub fn from_pairs<I, N, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, T)>,
        N: Into<String>,
        T: Into<String>,
    {
        Self {
            columns: pairs
                .into_iter()
                .map(|(n, t)| ColumnInfo::new(n, t))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Append a column, or change the type of an existing one
    pub fn upsert(&mut self, name: &str, data_type: &str) {
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(col) => col.data_type = data_type.to_string(),
            None => self.columns.push(ColumnInfo::new(name, data_type)),
        }
    }

    /// Compare this (table) schema with a union schema.
    ///
    /// New columns are those of `union` absent here; changed columns are
    /// present in both with a different type. Columns only present here are
    /// never reported: evolution does not drop or rename.
    pub fn diff(&self, union: &TableSchema) -> SchemaDiff {
        let mut diff = SchemaDiff::default();

        for col in &union.columns {
            match self.column(&col.name) {
                None => diff.new_columns.push(col.clone()),
                Some(existing) if !existing.data_type.eq_ignore_ascii_case(&col.data_type) => {
                    diff.changed_columns.push(ColumnChange {
                        name: col.name.clone(),
                        from: existing.data_type.clone(),
                        to: col.data_type.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        diff
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type))
            .collect();
        write!(f, "({})", cols.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnChange {
    pub name: String,
    pub from: String,
    pub to: String,
}

impl fmt::Display for ColumnChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} -> {})", self.name, self.from, self.to)
    }
}

/// Difference between a cached table schema and a union schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub new_columns: Vec<ColumnInfo>,
    pub changed_columns: Vec<ColumnChange>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.new_columns.is_empty() && self.changed_columns.is_empty()
    }
}
