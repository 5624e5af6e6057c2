//! Exception log.
//!
//! Statement failures are never raised. They are recorded here and the caller
//! inspects the log of the connection, of the cascade, or of the result that
//! was being built when the failure occurred.

use crate::identity::{format_datetime, DbNo, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::Level;

/// One recorded backend failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbException {
    pub message: String,
    /// Backend error code, 0 when the backend gave none.
    pub code: i32,
    pub db_no: Option<DbNo>,
    pub timestamp: Timestamp,
}

impl DbException {
    pub fn new(message: impl Into<String>, code: i32) -> Self {
        Self {
            message: message.into(),
            code,
            db_no: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_db_no(mut self, db_no: DbNo) -> Self {
        self.db_no = Some(db_no);
        self
    }
}

impl fmt::Display for DbException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {}", self.code)?;
        if let Some(db_no) = self.db_no {
            write!(f, " from cascade entry {}", db_no)?;
        }
        write!(
            f,
            " at {}: {}",
            format_datetime(&self.timestamp),
            self.message
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionLog {
    entries: Vec<DbException>,
}

impl ExceptionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, exception: DbException) {
        self.entries.push(exception);
    }

    /// Append every entry of `other`.
    pub fn add_log(&mut self, other: &ExceptionLog) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// Append to `target` the entries of this log from index `start` on.
    ///
    /// Callers remember `len()` before an operation and copy what the
    /// operation added afterwards.
    pub fn copy_since(&self, target: &mut ExceptionLog, start: usize) {
        if let Some(tail) = self.entries.get(start..) {
            target.entries.extend(tail.iter().cloned());
        }
    }

    pub fn entries(&self) -> &[DbException] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Emit the log as tracing events at `level`.
    pub fn print(&self, level: Level) {
        let text = self.to_string();
        match level {
            Level::ERROR => tracing::error!("{}", text),
            Level::WARN => tracing::warn!("{}", text),
            Level::INFO => tracing::info!("{}", text),
            Level::DEBUG => tracing::debug!("{}", text),
            Level::TRACE => tracing::trace!("{}", text),
        }
    }
}

impl fmt::Display for ExceptionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "The database exception log is empty");
        }
        writeln!(f, "Database exception log:-")?;
        for entry in &self.entries {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_log() {
        let log = ExceptionLog::new();
        assert!(log.is_empty());
        assert_eq!(log.to_string(), "The database exception log is empty");
    }

    #[test]
    fn test_add_and_display() {
        let mut log = ExceptionLog::new();
        log.add(DbException::new("no such table: CALIBVLD", 1).with_db_no(0));
        assert_eq!(log.len(), 1);
        let text = log.to_string();
        assert!(text.contains("Database exception log"));
        assert!(text.contains("no such table: CALIBVLD"));
        assert!(text.contains("cascade entry 0"));
    }

    #[test]
    fn test_copy_since() {
        let mut source = ExceptionLog::new();
        source.add(DbException::new("first", 1));
        let mark = source.len();
        source.add(DbException::new("second", 2));
        source.add(DbException::new("third", 3));

        let mut target = ExceptionLog::new();
        source.copy_since(&mut target, mark);
        let messages: Vec<&str> = target.entries().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["second", "third"]);

        // A start past the end copies nothing.
        let mut none = ExceptionLog::new();
        source.copy_since(&mut none, 10);
        assert!(none.is_empty());
    }

    #[test]
    fn test_add_log() {
        let mut a = ExceptionLog::new();
        a.add(DbException::new("a", 1));
        let mut b = ExceptionLog::new();
        b.add(DbException::new("b", 2));
        a.add_log(&b);
        assert_eq!(a.len(), 2);
        a.clear();
        assert!(a.is_empty());
    }
}
