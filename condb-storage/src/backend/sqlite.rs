//! SQLite backend.
//!
//! URLs are `sqlite://<path>` or `sqlite::memory:`. User and password are
//! accepted and ignored. Table locks map onto an immediate transaction, which
//! holds the database write lock until `unlock_tables` commits it or
//! `rollback_tables` discards it; other sessions wait on the busy timeout
//! meanwhile.

use super::{Backend, BackendFactory, RowSet, SqlValue};
use condb_core::{BackendDescriptor, BackendError, ConnectionError};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::time::Duration;

/// URL of a private in-memory database.
pub const MEMORY_URL: &str = "sqlite::memory:";

/// How long a session waits for another one's lock before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SqliteBackend {
    conn: Connection,
    url: String,
}

impl SqliteBackend {
    pub fn open(url: &str) -> Result<Self, ConnectionError> {
        let conn = if url == MEMORY_URL {
            Connection::open_in_memory()
        } else {
            let path = sqlite_path(url).ok_or_else(|| ConnectionError::UnsupportedUrl {
                url: url.to_string(),
            })?;
            Connection::open(path)
        }
        .map_err(|e| ConnectionError::BadConnection {
            url: url.to_string(),
            attempts: 1,
            reason: e.to_string(),
        })?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| ConnectionError::BadConnection {
                url: url.to_string(),
                attempts: 1,
                reason: e.to_string(),
            })?;

        Ok(Self {
            conn,
            url: url.to_string(),
        })
    }

    fn statement_error(sql: &str, e: rusqlite::Error) -> BackendError {
        BackendError::Statement {
            sql: sql.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Filesystem path of a `sqlite:` URL.
fn sqlite_path(url: &str) -> Option<&str> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

fn to_sql_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Integer(v),
        ValueRef::Real(v) => SqlValue::Real(v),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            SqlValue::Text(String::from_utf8_lossy(t).into_owned())
        }
    }
}

impl Backend for SqliteBackend {
    fn url(&self) -> &str {
        &self.url
    }

    fn execute(&mut self, sql: &str) -> Result<usize, BackendError> {
        self.conn
            .execute(sql, [])
            .map_err(|e| Self::statement_error(sql, e))
    }

    fn query(&mut self, sql: &str) -> Result<RowSet, BackendError> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| Self::statement_error(sql, e))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let num_columns = columns.len();

        let mut set = RowSet::new(columns);
        let mut rows = stmt.query([]).map_err(|e| Self::statement_error(sql, e))?;
        while let Some(row) = rows.next().map_err(|e| Self::statement_error(sql, e))? {
            let mut values = Vec::with_capacity(num_columns);
            for col in 0..num_columns {
                let value = row
                    .get_ref(col)
                    .map_err(|e| Self::statement_error(sql, e))?;
                values.push(to_sql_value(value));
            }
            set.push_row(values);
        }
        Ok(set)
    }

    fn table_names(&mut self) -> Result<Vec<String>, BackendError> {
        let set = self.query(
            "select name from sqlite_master where type = 'table' \
             union select name from sqlite_temp_master where type = 'table'",
        )?;
        Ok(set
            .rows()
            .iter()
            .filter_map(|r| r.first().and_then(SqlValue::as_text))
            .collect())
    }

    fn column_names(&mut self, table: &str) -> Result<Vec<String>, BackendError> {
        let set = self.query(&format!("pragma table_info({})", table))?;
        let name_col = set.column_index("name").ok_or_else(|| BackendError::Schema {
            reason: "pragma table_info returned no name column".to_string(),
        })?;
        Ok(set
            .rows()
            .iter()
            .filter_map(|r| r.get(name_col).and_then(SqlValue::as_text))
            .collect())
    }

    fn lock_tables(&mut self, tables: &[String]) -> Result<(), BackendError> {
        if !self.conn.is_autocommit() {
            return Err(BackendError::Lock {
                tables: tables.join(", "),
                reason: "a lock is already held by this session".to_string(),
            });
        }
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| BackendError::Lock {
                tables: tables.join(", "),
                reason: e.to_string(),
            })
    }

    fn unlock_tables(&mut self) -> Result<(), BackendError> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| BackendError::Lock {
                tables: String::new(),
                reason: e.to_string(),
            })
    }

    fn rollback_tables(&mut self) -> Result<(), BackendError> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| BackendError::Lock {
                tables: String::new(),
                reason: e.to_string(),
            })
    }
}

/// Factory for `sqlite:` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteFactory;

impl BackendFactory for SqliteFactory {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn accepts(&self, url: &str) -> bool {
        url == MEMORY_URL || sqlite_path(url).is_some()
    }

    fn open(&self, descriptor: &BackendDescriptor) -> Result<Box<dyn Backend>, ConnectionError> {
        if !self.accepts(&descriptor.url) {
            return Err(ConnectionError::UnsupportedUrl {
                url: descriptor.url.clone(),
            });
        }
        tracing::trace!(url = %descriptor.url, user = %descriptor.user, "Opening sqlite backend");
        Ok(Box::new(SqliteBackend::open(&descriptor.url)?))
    }

    fn is_volatile(&self, url: &str) -> bool {
        url == MEMORY_URL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_test_backend() -> SqliteBackend {
        SqliteBackend::open(MEMORY_URL).unwrap()
    }

    #[test]
    fn test_url_parsing() {
        assert_eq!(sqlite_path("sqlite:///tmp/a.db"), Some("/tmp/a.db"));
        assert_eq!(sqlite_path("sqlite:rel.db"), Some("rel.db"));
        assert_eq!(sqlite_path("sqlite://"), None);
        assert_eq!(sqlite_path("mysql://host/db"), None);
        let factory = SqliteFactory;
        assert!(factory.accepts(MEMORY_URL));
        assert!(factory.is_volatile(MEMORY_URL));
        assert!(!factory.is_volatile("sqlite:///tmp/a.db"));
    }

    #[test]
    fn test_unsupported_url() {
        let desc = BackendDescriptor::new("mysql://localhost/db", "u", "p");
        assert!(matches!(
            SqliteFactory.open(&desc),
            Err(ConnectionError::UnsupportedUrl { .. })
        ));
    }

    #[test]
    fn test_execute_and_query() {
        let mut backend = make_test_backend();
        backend
            .execute("create table CALIB (SEQNO integer, ROW_COUNTER integer, GAIN real, NAME text)")
            .unwrap();
        let n = backend
            .execute("insert into CALIB values (1, 1, 1.5, 'a'), (1, 2, 2.5, NULL)")
            .unwrap();
        assert_eq!(n, 2);

        let set = backend.query("select * from CALIB order by ROW_COUNTER").unwrap();
        assert_eq!(set.columns(), &["SEQNO", "ROW_COUNTER", "GAIN", "NAME"]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.value(0, 2), Some(&SqlValue::Real(1.5)));
        assert_eq!(set.value(1, 3), Some(&SqlValue::Null));
    }

    #[test]
    fn test_statement_error_is_reported() {
        let mut backend = make_test_backend();
        let err = backend.query("select * from MISSING").unwrap_err();
        assert!(matches!(err, BackendError::Statement { ref sql, .. } if sql.contains("MISSING")));
    }

    #[test]
    fn test_table_and_column_names() {
        let mut backend = make_test_backend();
        backend.execute("create table CALIBVLD (SEQNO integer, EPOCH tinyint)").unwrap();
        backend.execute("create temporary table SCRATCH (X integer)").unwrap();
        let tables = backend.table_names().unwrap();
        assert!(tables.contains(&"CALIBVLD".to_string()));
        assert!(tables.contains(&"SCRATCH".to_string()));
        assert_eq!(backend.column_names("CALIBVLD").unwrap(), vec!["SEQNO", "EPOCH"]);
    }

    #[test]
    fn test_lock_is_exclusive_across_sessions() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("lock.db").display());
        let mut a = SqliteBackend::open(&url).unwrap();
        a.execute("create table LOCALSEQNO (TABLENAME char(64), LASTUSEDSEQNO int)").unwrap();

        let tables = vec!["LOCALSEQNO".to_string()];
        a.lock_tables(&tables).unwrap();
        assert!(a.lock_tables(&tables).is_err());
        a.execute("insert into LOCALSEQNO values ('*', 0)").unwrap();
        a.unlock_tables().unwrap();
        // Unlocking twice is harmless.
        a.unlock_tables().unwrap();

        let mut b = SqliteBackend::open(&url).unwrap();
        let set = b.query("select LASTUSEDSEQNO from LOCALSEQNO").unwrap();
        assert_eq!(set.scalar(), Some(&SqlValue::Integer(0)));
    }
}
