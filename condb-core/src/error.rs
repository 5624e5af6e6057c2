//! Error types for condb operations

use crate::identity::DbNo;
use thiserror::Error;

/// Configuration errors. These are the only failures that abort cascade
/// construction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible schema: table {table} present in cascade entry {db_no}")]
    IncompatibleSchema { table: String, db_no: DbNo },

    #[error("Temporary tables file {path}, line {line}: {reason}")]
    TemporaryTablesFile {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("Unknown configuration key: {key}")]
    UnknownKey { key: String },
}

/// Connection errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Failed to connect to {url} after {attempts} attempt(s): {reason}")]
    BadConnection {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("Connection to {url} is not open")]
    NotOpen { url: String },

    #[error("Unsupported backend url: {url}")]
    UnsupportedUrl { url: String },
}

/// Errors reported by a backend while running SQL.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Statement failed: {sql}: {reason}")]
    Statement { sql: String, reason: String },

    #[error("Failed to lock {tables}: {reason}")]
    Lock { tables: String, reason: String },

    #[error("Schema error: {reason}")]
    Schema { reason: String },
}

/// L2 disk cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum L2CacheError {
    #[error("Failed to open L2 cache environment: {0}")]
    Open(String),

    #[error("L2 cache transaction failed: {0}")]
    Transaction(String),

    #[error("L2 cache serialization failed: {0}")]
    Serialization(String),

    #[error("L2 cache deserialization failed: {0}")]
    Deserialization(String),

    #[error("L2 cache I/O error: {0}")]
    Io(String),
}

/// Errors raised while filling a row object from a result set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("Missing column: {column}")]
    MissingColumn { column: String },

    #[error("Column {column} holds {found}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },

    #[error("Row exhausted after {columns} column(s)")]
    Exhausted { columns: usize },
}

/// Master error type for all condb errors.
#[derive(Debug, Clone, Error)]
pub enum DbiError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("L2 cache error: {0}")]
    L2Cache(#[from] L2CacheError),

    #[error("Row error: {0}")]
    Row(#[from] RowError),
}

/// Result type alias for condb operations.
pub type DbiResult<T> = Result<T, DbiError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "time_gate_secs".to_string(),
            value: "3".to_string(),
            reason: "must be above 15 seconds".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("time_gate_secs"));
        assert!(msg.contains("3"));
        assert!(msg.contains("must be above 15 seconds"));
    }

    #[test]
    fn test_incompatible_schema_display() {
        let err = ConfigError::IncompatibleSchema {
            table: "DBI_STATE_FLAGS".to_string(),
            db_no: 1,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("DBI_STATE_FLAGS"));
        assert!(msg.contains("entry 1"));
    }

    #[test]
    fn test_bad_connection_display() {
        let err = ConnectionError::BadConnection {
            url: "sqlite:///nowhere/db".to_string(),
            attempts: 20,
            reason: "unable to open".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("sqlite:///nowhere/db"));
        assert!(msg.contains("20 attempt"));
    }

    #[test]
    fn test_row_error_display() {
        let err = RowError::TypeMismatch {
            column: "GAIN".to_string(),
            expected: "real".to_string(),
            found: "text".to_string(),
        };
        assert_eq!(err.to_string(), "Column GAIN holds text, expected real");
    }

    #[test]
    fn test_dbi_error_from_variants() {
        let config = DbiError::from(ConfigError::MissingRequired {
            field: "ENV_TSQL_URL".to_string(),
        });
        assert!(matches!(config, DbiError::Config(_)));

        let conn = DbiError::from(ConnectionError::NotOpen {
            url: "sqlite::memory:".to_string(),
        });
        assert!(matches!(conn, DbiError::Connection(_)));

        let backend = DbiError::from(BackendError::Schema {
            reason: "no such table".to_string(),
        });
        assert!(matches!(backend, DbiError::Backend(_)));

        let l2 = DbiError::from(L2CacheError::Io("disk full".to_string()));
        assert!(matches!(l2, DbiError::L2Cache(_)));

        let row = DbiError::from(RowError::Exhausted { columns: 4 });
        assert!(matches!(row, DbiError::Row(_)));
    }
}
