//! Error taxonomy for the Lattice engine.
//!
//! Every kind carries the offending table/column/row id where one exists.
//! Observer callback failures never surface here — they are logged and
//! isolated by the observation bus.

use thiserror::Error;

/// Errors produced by the Lattice engine.
#[derive(Debug, Error)]
pub enum LatticeError {
    #[error("failed to open store at {path}: {message}")]
    OpenFailed { path: String, message: String },

    #[error("invalid schema for table '{table}': {message}")]
    SchemaInvalid { table: String, message: String },

    #[error("schema conflict on table '{table}': {message}")]
    SchemaConflict { table: String, message: String },

    #[error("migration failed on table '{table}': {message}")]
    MigrationFailed { table: String, message: String },

    #[error("unique constraint violated on {table}({columns})")]
    ConstraintViolation { table: String, columns: String },

    #[error("row not found in '{table}': {key}")]
    NotFound { table: String, key: String },

    #[error("transaction misuse: {reason}")]
    TransactionMisuse { reason: String },

    #[error("invalid query on '{table}': {message}")]
    QueryInvalid { table: String, message: String },

    #[error("storage error: {message}")]
    Io { message: String },
}

/// Convenience type alias.
pub type LatticeResult<T> = Result<T, LatticeError>;

impl LatticeError {
    /// Shorthand for a `NotFound` keyed by primary key.
    pub fn not_found(table: &str, primary_key: i64) -> Self {
        Self::NotFound {
            table: table.to_string(),
            key: format!("pk={primary_key}"),
        }
    }

    /// Shorthand for a `QueryInvalid` on a table.
    pub fn query_invalid(table: &str, message: impl Into<String>) -> Self {
        Self::QueryInvalid {
            table: table.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for a `SchemaInvalid` on a table.
    pub fn schema_invalid(table: &str, message: impl Into<String>) -> Self {
        Self::SchemaInvalid {
            table: table.to_string(),
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for LatticeError {
    fn from(e: rusqlite::Error) -> Self {
        LatticeError::Io {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for LatticeError {
    fn from(e: serde_json::Error) -> Self {
        LatticeError::Io {
            message: format!("serialization: {e}"),
        }
    }
}

impl From<std::io::Error> for LatticeError {
    fn from(e: std::io::Error) -> Self {
        LatticeError::Io {
            message: e.to_string(),
        }
    }
}
