//! Statements.
//!
//! A [`Statement`] keeps its connection open for as long as it lives. Errors
//! are never raised: they go to the statement's own exception log, the
//! connection's, and the cascade-wide log, and the call returns a failure
//! value.

use crate::backend::RowSet;
use crate::connection::Connection;
use condb_core::{DbException, DbNo, ExceptionLog};
use tracing::Level;

pub struct Statement<'c> {
    conn: &'c mut Connection,
    global_log: &'c mut ExceptionLog,
    log: ExceptionLog,
}

impl<'c> Statement<'c> {
    pub(crate) fn new(conn: &'c mut Connection, global_log: &'c mut ExceptionLog) -> Self {
        conn.connect_statement();
        Self {
            conn,
            global_log,
            log: ExceptionLog::new(),
        }
    }

    pub fn db_no(&self) -> DbNo {
        self.conn.db_no()
    }

    pub fn url(&self) -> &str {
        self.conn.url()
    }

    pub fn exception_log(&self) -> &ExceptionLog {
        &self.log
    }

    /// Emit the statement's exceptions at `level`; returns true if there
    /// were any.
    pub fn print_exceptions(&self, level: Level) -> bool {
        if self.log.is_empty() {
            return false;
        }
        self.log.print(level);
        true
    }

    pub fn clear_exceptions(&mut self) {
        self.log.clear();
    }

    fn record(&mut self, message: String) {
        let exception = DbException::new(message, 0).with_db_no(self.conn.db_no());
        self.conn.record_exception(exception.message.clone());
        self.global_log.add(exception.clone());
        self.log.add(exception);
    }

    /// Run a statement returning no rows. Returns false on failure.
    pub fn execute_update(&mut self, sql: &str) -> bool {
        tracing::trace!(db_no = self.db_no(), sql, "Executing update");
        let result = match self.conn.backend() {
            Ok(backend) => backend.execute(sql).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(_) => true,
            Err(message) => {
                self.record(message);
                false
            }
        }
    }

    /// Run a query. Returns `None` on failure.
    pub fn execute_query(&mut self, sql: &str) -> Option<RowSet> {
        tracing::trace!(db_no = self.db_no(), sql, "Executing query");
        let result = match self.conn.backend() {
            Ok(backend) => backend.query(sql).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(set) => Some(set),
            Err(message) => {
                self.record(message);
                None
            }
        }
    }

    pub(crate) fn lock_tables(&mut self, tables: &[String]) -> bool {
        let result = match self.conn.backend() {
            Ok(backend) => backend.lock_tables(tables).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => true,
            Err(message) => {
                self.record(message);
                false
            }
        }
    }

    pub(crate) fn unlock_tables(&mut self) -> bool {
        let result = match self.conn.backend() {
            Ok(backend) => backend.unlock_tables().map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => true,
            Err(message) => {
                self.record(message);
                false
            }
        }
    }

    pub(crate) fn rollback_tables(&mut self) -> bool {
        let result = match self.conn.backend() {
            Ok(backend) => backend.rollback_tables().map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => true,
            Err(message) => {
                self.record(message);
                false
            }
        }
    }

    /// Column names of `table`, upper case. Empty on failure.
    pub fn column_names(&mut self, table: &str) -> Vec<String> {
        let result = match self.conn.backend() {
            Ok(backend) => backend.column_names(table).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(names) => names.into_iter().map(|n| n.to_uppercase()).collect(),
            Err(message) => {
                self.record(message);
                Vec::new()
            }
        }
    }

    /// Mark a table as present on this statement's connection.
    pub fn set_table_exists(&mut self, table: &str) {
        self.conn.set_table_exists(table);
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        self.conn.disconnect_statement();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteFactory;
    use condb_core::BackendDescriptor;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn make_test_connection(dir: &TempDir) -> Connection {
        let url = format!("sqlite://{}", dir.path().join("stmt.db").display());
        Connection::open_new(
            BackendDescriptor::new(url, "", ""),
            Arc::new(SqliteFactory),
            2,
            1,
            Duration::ZERO,
        )
        .unwrap()
    }

    #[test]
    fn test_statement_pins_connection() {
        let dir = TempDir::new().unwrap();
        let mut conn = make_test_connection(&dir);
        let mut global = ExceptionLog::new();
        {
            let mut stmt = Statement::new(&mut conn, &mut global);
            assert!(stmt.execute_update("create table T (X integer)"));
            assert!(stmt.execute_update("insert into T values (1)"));
            let set = stmt.execute_query("select X from T").unwrap();
            assert_eq!(set.len(), 1);
            assert!(!stmt.print_exceptions(Level::DEBUG));
        }
        assert_eq!(conn.num_connected_statements(), 0);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_errors_are_logged_not_raised() {
        let dir = TempDir::new().unwrap();
        let mut conn = make_test_connection(&dir);
        let mut global = ExceptionLog::new();
        {
            let mut stmt = Statement::new(&mut conn, &mut global);
            assert!(stmt.execute_query("select * from NOPE").is_none());
            assert!(!stmt.execute_update("insert into NOPE values (1)"));
            assert_eq!(stmt.exception_log().len(), 2);
            assert_eq!(stmt.exception_log().entries()[0].db_no, Some(2));
            assert!(stmt.print_exceptions(Level::DEBUG));
        }
        assert_eq!(global.len(), 2);
    }
}
