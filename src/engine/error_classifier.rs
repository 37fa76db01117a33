//! Error Classifier
//!
//! Maps engine failure text onto a stable error-kind enumeration.
//! DuckDB prefixes every message with its exception type ("Binder Error:",
//! "Conversion Error:", ...), which is what the patterns key on. Anything not
//! recognised is `Other` and must be treated as fatal.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineErrorKind {
    /// Column/table binding failed (count mismatch, unknown column, ...)
    Binder,
    /// A value could not be cast to the target column type
    Conversion,
    /// Missing or duplicate catalog entry
    Catalog,
    /// Constraint violation
    Constraint,
    Other,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineErrorKind::Binder => write!(f, "Binder"),
            EngineErrorKind::Conversion => write!(f, "Conversion"),
            EngineErrorKind::Catalog => write!(f, "Catalog"),
            EngineErrorKind::Constraint => write!(f, "Constraint"),
            EngineErrorKind::Other => write!(f, "Other"),
        }
    }
}

lazy_static! {
    static ref BINDER: Regex = Regex::new(r"(?i)\bbinder error\b").unwrap();
    static ref CONVERSION: Regex =
        Regex::new(r"(?i)\b(conversion error|could not convert|mismatch type error)\b").unwrap();
    static ref CATALOG: Regex = Regex::new(r"(?i)\bcatalog error\b").unwrap();
    static ref CONSTRAINT: Regex = Regex::new(r"(?i)\bconstraint error\b").unwrap();
}

/// Classify an engine error message
pub fn classify_engine_message(message: &str) -> EngineErrorKind {
    if BINDER.is_match(message) {
        return EngineErrorKind::Binder;
    }

    if CONVERSION.is_match(message) {
        return EngineErrorKind::Conversion;
    }

    if CATALOG.is_match(message) {
        return EngineErrorKind::Catalog;
    }

    if CONSTRAINT.is_match(message) {
        return EngineErrorKind::Constraint;
    }

    EngineErrorKind::Other
}
