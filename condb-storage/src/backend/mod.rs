//! Backend seam.
//!
//! A [`Backend`] runs SQL text against one database and hands back plain
//! [`RowSet`]s. Everything above this module (connections, cascade, proxies)
//! is written against the trait; [`sqlite`] provides the shipped
//! implementation.

pub mod sqlite;

pub use sqlite::{SqliteBackend, SqliteFactory};

use condb_core::{BackendDescriptor, BackendError, ConnectionError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// VALUES
// ============================================================================

/// One column value as returned by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "NULL",
            SqlValue::Integer(_) => "INTEGER",
            SqlValue::Real(_) => "REAL",
            SqlValue::Text(_) => "TEXT",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer view. Reals are truncated and numeric text is parsed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Real(v) => Some(*v as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Null => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Integer(v) => Some(*v as f64),
            SqlValue::Real(v) => Some(*v),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Null => None,
        }
    }

    /// Text view of any non-null value.
    pub fn as_text(&self) -> Option<String> {
        match self {
            SqlValue::Integer(v) => Some(v.to_string()),
            SqlValue::Real(v) => Some(v.to_string()),
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Null => None,
        }
    }

    /// Render as an SQL literal, quoting text.
    pub fn to_sql_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Integer(v) => v.to_string(),
            SqlValue::Real(v) => v.to_string(),
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(v) => write!(f, "{}", v),
            SqlValue::Real(v) => write!(f, "{}", v),
            SqlValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

// ============================================================================
// ROW SETS
// ============================================================================

/// The complete answer of one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, values: Vec<SqlValue>) {
        self.rows.push(values);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<SqlValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column, ignoring case.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Value at `(row, col)`.
    pub fn value(&self, row: usize, col: usize) -> Option<&SqlValue> {
        self.rows.get(row).and_then(|r| r.get(col))
    }

    /// First column of the first row, the answer of `select max(..)` probes.
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.value(0, 0)
    }
}

// ============================================================================
// BACKEND CONTRACT
// ============================================================================

/// An open session with one database.
///
/// `lock_tables`/`unlock_tables` must give cross-process exclusion for the
/// named tables until the unlock: sequence allocation depends on it.
pub trait Backend: Send {
    fn url(&self) -> &str;

    /// Run a statement that returns no rows; returns the affected row count.
    fn execute(&mut self, sql: &str) -> Result<usize, BackendError>;

    fn query(&mut self, sql: &str) -> Result<RowSet, BackendError>;

    /// Names of every table visible to this session, temporary ones included.
    fn table_names(&mut self) -> Result<Vec<String>, BackendError>;

    fn column_names(&mut self, table: &str) -> Result<Vec<String>, BackendError>;

    fn lock_tables(&mut self, tables: &[String]) -> Result<(), BackendError>;

    /// Release the lock, keeping every change made while it was held.
    fn unlock_tables(&mut self) -> Result<(), BackendError>;

    /// Release the lock, discarding every change made while it was held.
    fn rollback_tables(&mut self) -> Result<(), BackendError>;
}

/// Opens backends for the URLs it understands.
pub trait BackendFactory: Send + Sync {
    fn name(&self) -> &str;

    fn accepts(&self, url: &str) -> bool;

    fn open(&self, descriptor: &BackendDescriptor) -> Result<Box<dyn Backend>, ConnectionError>;

    /// True when the data behind `url` lives only as long as an open
    /// session, so connections to it must never be closed when idle.
    fn is_volatile(&self, _url: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_views() {
        assert_eq!(SqlValue::Text(" 42 ".into()).as_i64(), Some(42));
        assert_eq!(SqlValue::Real(2.9).as_i64(), Some(2));
        assert_eq!(SqlValue::Integer(3).as_f64(), Some(3.0));
        assert_eq!(SqlValue::Null.as_text(), None);
        assert!(SqlValue::Null.is_null());
        assert_eq!(SqlValue::Integer(7).type_name(), "INTEGER");
    }

    #[test]
    fn test_sql_literal_quotes_text() {
        assert_eq!(SqlValue::from("it's").to_sql_literal(), "'it''s'");
        assert_eq!(SqlValue::from(5i64).to_sql_literal(), "5");
        assert_eq!(SqlValue::Null.to_sql_literal(), "NULL");
    }

    #[test]
    fn test_row_set_lookup() {
        let mut set = RowSet::new(vec!["SEQNO".into(), "TimeStart".into()]);
        set.push_row(vec![SqlValue::Integer(1), SqlValue::from("2020-01-01")]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.column_index("TIMESTART"), Some(1));
        assert_eq!(set.column_index("missing"), None);
        assert_eq!(set.scalar(), Some(&SqlValue::Integer(1)));
        assert_eq!(set.value(3, 0), None);
    }
}
