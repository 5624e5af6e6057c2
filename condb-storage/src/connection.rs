//! Managed connection to one backend.
//!
//! A connection is temporary by default: it closes itself as soon as the
//! last statement using it detaches, and reopens transparently for the next
//! one. Permanent connections stay open until the cascade is dropped.

use crate::backend::{Backend, BackendFactory};
use condb_core::{
    BackendDescriptor, BackendError, ConnectionError, ConnectionStatus, DbException, DbNo,
    ExceptionLog, VALIDATED_MAX_CONNECTION_ATTEMPTS,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

/// Name of the table used to probe for temporary table support.
const TMP_TABLE_PROBE: &str = "TEST_CONDB_SUPPORTS_TMP_TBLS";

pub struct Connection {
    descriptor: BackendDescriptor,
    factory: Arc<dyn BackendFactory>,
    backend: Option<Box<dyn Backend>>,
    db_no: DbNo,
    is_temporary: bool,
    num_connected_statements: u32,
    url_validated: bool,
    max_attempts: u32,
    retry_delay: Duration,
    existing_tables: BTreeSet<String>,
    exception_log: ExceptionLog,
}

impl Connection {
    /// Open a connection and read the backend's table list.
    ///
    /// Fails with [`ConnectionError::BadConnection`] when the backend cannot
    /// be reached within `max_attempts` tries.
    pub fn open_new(
        descriptor: BackendDescriptor,
        factory: Arc<dyn BackendFactory>,
        db_no: DbNo,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Result<Self, ConnectionError> {
        if !factory.accepts(&descriptor.url) {
            return Err(ConnectionError::UnsupportedUrl {
                url: descriptor.url.clone(),
            });
        }
        let is_temporary = !factory.is_volatile(&descriptor.url);
        let mut conn = Self {
            descriptor,
            factory,
            backend: None,
            db_no,
            is_temporary,
            num_connected_statements: 0,
            url_validated: false,
            max_attempts: max_attempts.max(1),
            retry_delay,
            existing_tables: BTreeSet::new(),
            exception_log: ExceptionLog::new(),
        };

        if !conn.open() {
            let reason = conn
                .exception_log
                .entries()
                .last()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown failure".to_string());
            return Err(ConnectionError::BadConnection {
                url: conn.descriptor.url.clone(),
                attempts: conn.max_attempts,
                reason,
            });
        }
        tracing::info!(url = %conn.url(), db_no, "Successfully opened connection");
        conn.url_validated = true;
        conn.refresh_table_list();
        Ok(conn)
    }

    pub fn url(&self) -> &str {
        &self.descriptor.url
    }

    pub fn user(&self) -> &str {
        &self.descriptor.user
    }

    pub fn db_no(&self) -> DbNo {
        self.db_no
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_none()
    }

    pub fn is_temporary(&self) -> bool {
        self.is_temporary
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_temporary
    }

    /// Pin the connection open (`true`) or let it close when idle.
    ///
    /// Connections to volatile backends (in-memory databases) always stay
    /// permanent, closing them would lose their data.
    pub fn set_permanent(&mut self, permanent: bool) {
        if !permanent && self.factory.is_volatile(&self.descriptor.url) {
            tracing::debug!(url = %self.url(), "Keeping connection to volatile backend permanent");
            return;
        }
        self.is_temporary = !permanent;
        if !permanent {
            self.close_idle();
        }
    }

    pub fn num_connected_statements(&self) -> u32 {
        self.num_connected_statements
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.is_closed() {
            ConnectionStatus::Closed
        } else {
            ConnectionStatus::Open
        }
    }

    pub fn exception_log(&self) -> &ExceptionLog {
        &self.exception_log
    }

    pub fn clear_exception_log(&mut self) {
        self.exception_log.clear();
    }

    /// Emit the exception log at `level`; returns true if it had entries.
    pub fn print_exception_log(&self, level: Level) -> bool {
        if !self.exception_log.is_empty() {
            self.exception_log.print(level);
        }
        !self.exception_log.is_empty()
    }

    pub(crate) fn record_exception(&mut self, message: impl Into<String>) {
        self.exception_log
            .add(DbException::new(message, 0).with_db_no(self.db_no));
    }

    // ========================================================================
    // OPEN / CLOSE
    // ========================================================================

    /// Open the connection if it is closed.
    ///
    /// Tries up to the retry budget, waiting `attempt * retry_delay` between
    /// tries. Once the URL has been validated the budget is 100 attempts.
    pub fn open(&mut self) -> bool {
        if !self.is_closed() {
            return true;
        }
        self.exception_log.clear();

        let max_attempts = if self.url_validated {
            VALIDATED_MAX_CONNECTION_ATTEMPTS
        } else {
            self.max_attempts
        };

        for attempt in 1..=max_attempts {
            match self.factory.open(&self.descriptor) {
                Ok(backend) => {
                    self.backend = Some(backend);
                    if attempt > 1 {
                        tracing::warn!(url = %self.url(), attempt, "Connection opened after retrying");
                    }
                    tracing::debug!(url = %self.url(), "Opened connection");
                    return true;
                }
                Err(ConnectionError::UnsupportedUrl { url }) => {
                    self.record_exception(format!("Unable to open connection: URL '{}' is invalid", url));
                    tracing::error!(url = %url, "Unable to open connection: URL is invalid");
                    return false;
                }
                Err(e) => {
                    self.record_exception(format!(
                        "Failing to open: {} for user {} (attempt {}): {}",
                        self.descriptor.url, self.descriptor.user, attempt, e
                    ));
                    if attempt < max_attempts {
                        if attempt == 1 {
                            tracing::error!(url = %self.url(), error = %e, "Connection failed, retrying");
                        }
                        let wait = self.retry_delay * attempt;
                        tracing::info!(url = %self.url(), wait_ms = wait.as_millis() as u64, "Waiting before trying again");
                        std::thread::sleep(wait);
                    }
                }
            }
        }

        tracing::error!(
            url = %self.url(),
            user = %self.descriptor.user,
            attempts = max_attempts,
            "Failed to open a connection"
        );
        false
    }

    /// Close the connection.
    ///
    /// Refuses while statements are attached unless `force` is set.
    pub fn close(&mut self, force: bool) -> bool {
        self.exception_log.clear();
        if self.is_closed() {
            return true;
        }
        if self.num_connected_statements > 0 {
            if !force {
                tracing::info!(
                    url = %self.url(),
                    statements = self.num_connected_statements,
                    "Unable to close connection, it still has active statements"
                );
                return false;
            }
            tracing::info!(
                url = %self.url(),
                statements = self.num_connected_statements,
                "Closing connection even though it still has active statements"
            );
        }
        self.backend = None;
        tracing::debug!(url = %self.url(), "Closed connection");
        true
    }

    /// Close a temporary connection that no statement is using.
    pub fn close_idle(&mut self) {
        if self.is_temporary && self.num_connected_statements == 0 {
            self.close(false);
        }
    }

    pub(crate) fn connect_statement(&mut self) {
        self.num_connected_statements += 1;
    }

    pub(crate) fn disconnect_statement(&mut self) {
        self.num_connected_statements = self.num_connected_statements.saturating_sub(1);
        if self.num_connected_statements == 0 {
            self.close_idle();
        }
    }

    /// The open backend, opening it first if needed.
    pub(crate) fn backend(&mut self) -> Result<&mut (dyn Backend + 'static), ConnectionError> {
        if !self.open() {
            return Err(ConnectionError::NotOpen {
                url: self.descriptor.url.clone(),
            });
        }
        self.backend
            .as_deref_mut()
            .ok_or_else(|| ConnectionError::NotOpen {
                url: self.descriptor.url.clone(),
            })
    }

    // ========================================================================
    // TABLE LIST
    // ========================================================================

    /// Re-read the table list from the backend.
    pub fn refresh_table_list(&mut self) -> bool {
        let names = match self.backend() {
            Ok(backend) => backend.table_names(),
            Err(e) => Err(BackendError::Schema {
                reason: e.to_string(),
            }),
        };
        match names {
            Ok(names) => {
                for name in names {
                    self.set_table_exists(&name);
                }
                true
            }
            Err(e) => {
                self.record_exception(e.to_string());
                tracing::error!(url = %self.url(), error = %e, "Failed to list tables");
                false
            }
        }
    }

    pub fn set_table_exists(&mut self, table: &str) {
        self.existing_tables.insert(table.to_uppercase());
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.existing_tables.contains(&table.to_uppercase())
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.existing_tables.iter().map(String::as_str)
    }

    /// Probe temporary table support by creating and dropping a table.
    pub fn supports_temporary_tables(&mut self) -> bool {
        let create = format!("create temporary table {} ( id integer )", TMP_TABLE_PROBE);
        let drop = format!("drop table {}", TMP_TABLE_PROBE);
        let result = self.backend().map_err(|e| e.to_string()).and_then(|backend| {
            backend.execute(&create).map_err(|e| e.to_string())?;
            backend.execute(&drop).map_err(|e| e.to_string())
        });
        match result {
            Ok(_) => true,
            Err(reason) => {
                tracing::debug!(url = %self.url(), reason = %reason, "Backend does not accept temporary tables");
                false
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(true);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.descriptor.url)
            .field("db_no", &self.db_no)
            .field("is_temporary", &self.is_temporary)
            .field("is_closed", &self.is_closed())
            .field("num_connected_statements", &self.num_connected_statements)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sqlite::MEMORY_URL;
    use crate::backend::{RowSet, SqliteFactory};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Factory that fails a fixed number of times before delegating to sqlite.
    struct FlakyFactory {
        failures_left: AtomicU32,
        opens: AtomicU32,
    }

    impl FlakyFactory {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                opens: AtomicU32::new(0),
            }
        }
    }

    impl BackendFactory for FlakyFactory {
        fn name(&self) -> &str {
            "flaky"
        }

        fn accepts(&self, url: &str) -> bool {
            SqliteFactory.accepts(url)
        }

        fn open(&self, descriptor: &BackendDescriptor) -> Result<Box<dyn Backend>, ConnectionError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ConnectionError::BadConnection {
                    url: descriptor.url.clone(),
                    attempts: 1,
                    reason: "server busy".to_string(),
                });
            }
            SqliteFactory.open(descriptor)
        }
    }

    fn make_test_connection(dir: &TempDir) -> Connection {
        let url = format!("sqlite://{}", dir.path().join("conn.db").display());
        Connection::open_new(
            BackendDescriptor::new(url, "reader", ""),
            Arc::new(SqliteFactory),
            0,
            3,
            Duration::ZERO,
        )
        .unwrap()
    }

    #[test]
    fn test_new_connection_is_open_and_temporary() {
        let dir = TempDir::new().unwrap();
        let conn = make_test_connection(&dir);
        assert!(!conn.is_closed());
        assert!(conn.is_temporary());
        assert_eq!(conn.status(), ConnectionStatus::Open);
    }

    #[test]
    fn test_memory_connection_is_permanent() {
        let mut conn = Connection::open_new(
            BackendDescriptor::new(MEMORY_URL, "", ""),
            Arc::new(SqliteFactory),
            0,
            1,
            Duration::ZERO,
        )
        .unwrap();
        assert!(conn.is_permanent());
        conn.set_permanent(false);
        assert!(conn.is_permanent());
    }

    #[test]
    fn test_idle_temporary_connection_closes() {
        let dir = TempDir::new().unwrap();
        let mut conn = make_test_connection(&dir);
        conn.connect_statement();
        conn.close_idle();
        assert!(!conn.is_closed());
        conn.disconnect_statement();
        assert!(conn.is_closed());

        // Reopens on demand.
        assert!(conn.backend().is_ok());
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_close_refuses_with_statements_unless_forced() {
        let dir = TempDir::new().unwrap();
        let mut conn = make_test_connection(&dir);
        conn.set_permanent(true);
        conn.connect_statement();
        assert!(!conn.close(false));
        assert!(!conn.is_closed());
        assert!(conn.close(true));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_retry_until_success() {
        let factory = Arc::new(FlakyFactory::new(2));
        let conn = Connection::open_new(
            BackendDescriptor::new(MEMORY_URL, "", ""),
            factory.clone(),
            0,
            5,
            Duration::ZERO,
        )
        .unwrap();
        assert!(!conn.is_closed());
        assert_eq!(factory.opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let factory = Arc::new(FlakyFactory::new(10));
        let err = Connection::open_new(
            BackendDescriptor::new(MEMORY_URL, "", ""),
            factory.clone(),
            0,
            3,
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, ConnectionError::BadConnection { attempts: 3, .. }));
        assert_eq!(factory.opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unsupported_url_fails_fast() {
        let err = Connection::open_new(
            BackendDescriptor::new("oracle://db", "", ""),
            Arc::new(SqliteFactory),
            0,
            3,
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, ConnectionError::UnsupportedUrl { .. }));
    }

    #[test]
    fn test_table_list_and_tmp_table_probe() {
        let dir = TempDir::new().unwrap();
        let mut conn = make_test_connection(&dir);
        conn.set_permanent(true);
        conn.backend()
            .unwrap()
            .execute("create table CALIBVLD (SEQNO integer)")
            .unwrap();
        assert!(!conn.table_exists("CALIBVLD"));
        assert!(conn.refresh_table_list());
        assert!(conn.table_exists("calibvld"));
        assert!(conn.supports_temporary_tables());
        let set: RowSet = conn
            .backend()
            .unwrap()
            .query("select count(*) from sqlite_temp_master")
            .unwrap();
        assert_eq!(set.scalar().and_then(|v| v.as_i64()), Some(0));
    }
}
