//! The cascade: an ordered list of backends.
//!
//! Entry 0 has the highest priority. Data found in an earlier entry shadows
//! the same data in later ones, which lets a development database override
//! production constants. At most one entry is *authorizing*: it hosts the
//! `GLOBALSEQNO` table and may issue sequence numbers unique across the
//! whole cascade (see [`crate::seqno`]).

use crate::backend::{BackendFactory, SqliteFactory};
use crate::connection::Connection;
use crate::statement::Statement;
use condb_core::{
    CascadeConfig, CascadeStatus, ConfigError, DbNo, DbiResult, EntryStatus, ExceptionLog,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;
use tracing::Level;

/// Table whose presence marks an authorizing entry.
pub const GLOBAL_SEQNO_TABLE: &str = "GLOBALSEQNO";

/// Table of locally issued sequence numbers.
pub const LOCAL_SEQNO_TABLE: &str = "LOCALSEQNO";

/// Version-shear marker: its presence means the schema is newer than this
/// library understands.
pub const STATE_FLAGS_TABLE: &str = "DBI_STATE_FLAGS";

static TMP_TABLE_LINE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\s*CREATE\s+TEMPORARY\s+TABLE\s+([^\s(]+)").ok());

pub struct Cascade {
    connections: Vec<Connection>,
    global_seqno_db: Option<DbNo>,
    temporary_tables: BTreeMap<String, DbNo>,
    temp_connection: Option<DbNo>,
    /// `(table, is_global, db_no)` combinations whose sequence counter has
    /// been checked against the validity table.
    pub(crate) checked_seqno: HashSet<(String, bool, DbNo)>,
    exception_log: ExceptionLog,
    quiet: bool,
}

impl Cascade {
    /// Build a cascade, opening every entry.
    ///
    /// Any unreachable entry, a `DBI_STATE_FLAGS` table on any entry, or a
    /// failing temporary tables file fails the whole construction.
    pub fn new(config: &CascadeConfig, factory: Arc<dyn BackendFactory>) -> DbiResult<Self> {
        if config.backends.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "ENV_TSQL_URL".to_string(),
            }
            .into());
        }
        let max_attempts = if config.quiet {
            1
        } else {
            config.max_connection_attempts
        };

        let mut connections = Vec::with_capacity(config.backends.len());
        for (db_no, descriptor) in config.backends.iter().enumerate() {
            let conn = Connection::open_new(
                descriptor.clone(),
                factory.clone(),
                db_no,
                max_attempts,
                config.retry_delay,
            )?;
            connections.push(conn);
        }

        let mut cascade = Self {
            connections,
            global_seqno_db: None,
            temporary_tables: BTreeMap::new(),
            temp_connection: None,
            checked_seqno: HashSet::new(),
            exception_log: ExceptionLog::new(),
            quiet: config.quiet,
        };

        for conn in &cascade.connections {
            if conn.table_exists(STATE_FLAGS_TABLE) {
                tracing::error!(
                    url = %conn.url(),
                    table = STATE_FLAGS_TABLE,
                    "This version of the access layer does not support the schema of this database"
                );
                return Err(ConfigError::IncompatibleSchema {
                    table: STATE_FLAGS_TABLE.to_string(),
                    db_no: conn.db_no(),
                }
                .into());
            }
        }

        cascade.global_seqno_db = cascade
            .connections
            .iter()
            .find(|c| c.table_exists(GLOBAL_SEQNO_TABLE))
            .map(Connection::db_no);

        if let Some(path) = &config.tmp_tables_file {
            cascade.process_tmp_tables_file(path)?;
        }

        if !cascade.quiet {
            tracing::info!("{}", cascade.status());
        }
        Ok(cascade)
    }

    /// Cascade of SQLite backends described by the `ENV_TSQL_*` variables.
    pub fn from_env() -> DbiResult<Self> {
        let config = CascadeConfig::from_env()?;
        Self::new(&config, Arc::new(SqliteFactory))
    }

    /// Quiet reachability probe: one attempt per entry, no warnings.
    pub fn can_connect(config: &CascadeConfig, factory: Arc<dyn BackendFactory>) -> bool {
        let config = config.clone().with_quiet(true);
        match Self::new(&config, factory) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Cascade is not reachable");
                false
            }
        }
    }

    pub fn num_db(&self) -> usize {
        self.connections.len()
    }

    pub fn url(&self, db_no: DbNo) -> Option<&str> {
        self.connections.get(db_no).map(Connection::url)
    }

    pub fn connection(&self, db_no: DbNo) -> Option<&Connection> {
        self.connections.get(db_no)
    }

    /// Entry hosting `GLOBALSEQNO`, if any.
    pub fn authorizing_db(&self) -> Option<DbNo> {
        self.global_seqno_db
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Errors of every statement run through this cascade.
    pub fn exception_log(&self) -> &ExceptionLog {
        &self.exception_log
    }

    pub fn status(&self) -> CascadeStatus {
        CascadeStatus {
            entries: self
                .connections
                .iter()
                .map(|c| EntryStatus {
                    db_no: c.db_no(),
                    status: c.status(),
                    authorizing: Some(c.db_no()) == self.global_seqno_db,
                    permanent: c.is_permanent(),
                    url: c.url().to_string(),
                })
                .collect(),
        }
    }

    // ========================================================================
    // STATEMENTS AND CONNECTION LIFETIME
    // ========================================================================

    /// Statement on entry `db_no`, or `None` if there is no such entry or it
    /// cannot be opened.
    pub fn create_statement(&mut self, db_no: DbNo) -> Option<Statement<'_>> {
        let Self {
            connections,
            exception_log,
            ..
        } = self;
        let conn = connections.get_mut(db_no)?;
        if !conn.open() {
            exception_log.add_log(conn.exception_log());
            tracing::error!(db_no, url = %conn.url(), "Cannot open connection for statement");
            return None;
        }
        Some(Statement::new(conn, exception_log))
    }

    /// Pin every connection open.
    pub fn hold_connections(&mut self) {
        for conn in &mut self.connections {
            conn.connect_statement();
        }
    }

    /// Undo one [`hold_connections`](Self::hold_connections).
    pub fn release_connections(&mut self) {
        for conn in &mut self.connections {
            conn.disconnect_statement();
        }
    }

    /// Hold every connection open until the returned guard drops.
    pub fn maintain_connections(&mut self) -> ConnectionMaintainer<'_> {
        ConnectionMaintainer::new(self)
    }

    pub fn set_permanent(&mut self, db_no: DbNo, permanent: bool) {
        if let Some(conn) = self.connections.get_mut(db_no) {
            conn.set_permanent(permanent);
        }
    }

    pub fn set_all_permanent(&mut self, permanent: bool) {
        for conn in &mut self.connections {
            conn.set_permanent(permanent);
        }
    }

    /// Close every connection that is neither permanent nor in use.
    pub fn close_idle_connections(&mut self) {
        for conn in &mut self.connections {
            conn.close_idle();
        }
    }

    // ========================================================================
    // TABLES
    // ========================================================================

    pub fn table_exists(&self, table: &str, db_no: DbNo) -> bool {
        self.connections
            .get(db_no)
            .is_some_and(|c| c.table_exists(table))
    }

    /// First entry holding `table`, optionally restricted to `select`.
    ///
    /// Table names are upper case; a name with lower case letters is
    /// rejected.
    pub fn table_db_no(&self, table: &str, select: Option<DbNo>) -> Option<DbNo> {
        if table.chars().any(|c| c.is_lowercase()) {
            tracing::error!(table, "Table names must be upper case");
            return None;
        }
        self.connections
            .iter()
            .filter(|c| select.map_or(true, |s| s == c.db_no()))
            .find(|c| c.table_exists(table))
            .map(Connection::db_no)
    }

    pub fn is_temporary_table(&self, table: &str, db_no: DbNo) -> bool {
        self.temporary_tables.get(table) == Some(&db_no)
    }

    /// Refresh every entry's table list.
    pub fn refresh_table_lists(&mut self) {
        for conn in &mut self.connections {
            conn.refresh_table_list();
        }
    }

    /// Create a temporary table and its validity table.
    ///
    /// `description` is the parenthesised column list. The first entry that
    /// accepts the table gets it and its connection is made permanent so the
    /// table survives. Returns the entry or `None` if no entry accepts it.
    pub fn create_temporary_table(&mut self, table: &str, description: &str) -> Option<DbNo> {
        let table = table.to_uppercase();
        let description = description.trim();
        if table.is_empty() || !description.starts_with('(') || !description.ends_with(')') {
            tracing::error!(table = %table, description, "Illegal temporary table arguments");
            return None;
        }

        let create = format!("create temporary table {} {}", table, description);
        let mut accepted = None;
        for db_no in 0..self.connections.len() {
            // Pinned so the table is not lost when the statement detaches.
            self.set_permanent(db_no, true);
            let Some(mut stmt) = self.create_statement(db_no) else {
                continue;
            };
            if stmt.execute_update(&create) {
                stmt.set_table_exists(&table);
                accepted = Some(db_no);
                break;
            }
            stmt.print_exceptions(Level::DEBUG);
            drop(stmt);
            self.set_permanent(db_no, false);
        }

        let db_no = accepted?;
        tracing::info!(
            db_no,
            url = self.url(db_no).unwrap_or_default(),
            "Making connection permanent to preserve temporary tables"
        );

        let vld = vld_table_ddl(&table, true);
        tracing::info!(db_no, sql = %vld, "Validity table creation");
        let mut stmt = self.create_statement(db_no)?;
        if !stmt.execute_update(&vld) {
            stmt.print_exceptions(Level::ERROR);
            return None;
        }
        stmt.set_table_exists(&format!("{}VLD", table));
        drop(stmt);
        self.temporary_tables.insert(table, db_no);
        Some(db_no)
    }

    /// First entry that supports temporary tables; its connection is made
    /// permanent.
    pub fn temp_connection(&mut self) -> Option<DbNo> {
        if self.temp_connection.is_none() {
            for conn in &mut self.connections {
                let was_temporary = conn.is_temporary();
                conn.set_permanent(true);
                if conn.supports_temporary_tables() {
                    tracing::info!(db_no = conn.db_no(), url = %conn.url(), "Selected connection for temporary tables");
                    self.temp_connection = Some(conn.db_no());
                    break;
                }
                conn.set_permanent(!was_temporary);
            }
        }
        self.temp_connection
    }

    /// Run the statements of a temporary tables file.
    ///
    /// Every non-blank line is one statement. `CREATE TEMPORARY TABLE <name>`
    /// lines register the table; names not ending in `VLD` become temporary
    /// tables of the chosen entry.
    pub fn process_tmp_tables_file(&mut self, path: &Path) -> Result<DbNo, ConfigError> {
        let file_error = |line: usize, reason: String| ConfigError::TemporaryTablesFile {
            path: path.display().to_string(),
            line,
            reason,
        };

        let db_no = self.temp_connection().ok_or_else(|| {
            tracing::error!("Could not find a cascade connection that accepts temporary tables");
            file_error(0, "no cascade entry accepts temporary tables".to_string())
        })?;
        let text = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to open temporary tables file");
            file_error(0, e.to_string())
        })?;

        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                tracing::debug!(line = idx + 1, "Skipped a blank line");
                continue;
            }
            let table = TMP_TABLE_LINE
                .as_ref()
                .and_then(|re| re.captures(line))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string());

            let Some(mut stmt) = self.create_statement(db_no) else {
                return Err(file_error(idx + 1, "cannot open temporary table connection".to_string()));
            };
            if !stmt.execute_update(line) {
                tracing::error!(line = idx + 1, sql = line, "Failed to execute temporary tables statement");
                let reason = stmt
                    .exception_log()
                    .entries()
                    .last()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                return Err(file_error(idx + 1, reason));
            }
            let Some(table) = table else {
                continue;
            };
            stmt.set_table_exists(&table);
            drop(stmt);
            tracing::info!(table = %table, db_no, "Registered table");
            if !table.ends_with("VLD") {
                self.temporary_tables.insert(table.clone(), db_no);
                tracing::info!(table = %table, db_no, "Registered temporary table");
            }
        }
        Ok(db_no)
    }
}

impl Drop for Cascade {
    fn drop(&mut self) {
        tracing::debug!(num_db = self.connections.len(), "Closing cascade");
    }
}

impl std::fmt::Debug for Cascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cascade")
            .field("connections", &self.connections)
            .field("global_seqno_db", &self.global_seqno_db)
            .field("temporary_tables", &self.temporary_tables)
            .finish()
    }
}

/// DDL of a validity table.
pub fn vld_table_ddl(table: &str, temporary: bool) -> String {
    format!(
        "create {}table {}VLD ( SEQNO integer not null primary key, \
         TIMESTART datetime not null, TIMEEND datetime not null, \
         EPOCH tinyint, REALITY tinyint, DETECTORMASK tinyint, SIMMASK tinyint, \
         TASK integer, AGGREGATENO integer, \
         CREATIONDATE datetime not null, INSERTDATE datetime not null )",
        if temporary { "temporary " } else { "" },
        table
    )
}

// ============================================================================
// CONNECTION MAINTAINER
// ============================================================================

/// Keeps every connection of a cascade open while it lives.
///
/// Multi-statement operations hold one so that temporary connections are not
/// closed and reopened between their statements.
pub struct ConnectionMaintainer<'a> {
    cascade: &'a mut Cascade,
}

impl<'a> ConnectionMaintainer<'a> {
    pub fn new(cascade: &'a mut Cascade) -> Self {
        cascade.hold_connections();
        Self { cascade }
    }
}

impl Deref for ConnectionMaintainer<'_> {
    type Target = Cascade;

    fn deref(&self) -> &Cascade {
        self.cascade
    }
}

impl DerefMut for ConnectionMaintainer<'_> {
    fn deref_mut(&mut self) -> &mut Cascade {
        self.cascade
    }
}

impl Drop for ConnectionMaintainer<'_> {
    fn drop(&mut self) {
        self.cascade.release_connections();
    }
}

// ============================================================================
// TABLE LOCK
// ============================================================================

/// Write lock on the sequence table (and a data validity table) for the
/// lifetime of the guard.
///
/// The lock is released when the guard drops, on every exit path. Changes
/// made under it are committed, unless the guard was abandoned, in which
/// case they are rolled back.
pub struct TableLock<'c> {
    stmt: Statement<'c>,
    tables: Vec<String>,
    locked: bool,
    abandoned: bool,
}

impl<'c> TableLock<'c> {
    /// Lock `seqno_table`, plus `<data_table>VLD` when given.
    pub fn acquire(mut stmt: Statement<'c>, seqno_table: &str, data_table: Option<&str>) -> Self {
        let mut tables = vec![seqno_table.to_string()];
        if let Some(data) = data_table {
            tables.push(format!("{}VLD", data));
        }
        tracing::debug!(tables = %tables.join(", "), "Lock requested");
        let locked = stmt.lock_tables(&tables);
        stmt.print_exceptions(Level::ERROR);
        Self {
            stmt,
            tables,
            locked,
            abandoned: false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Roll back instead of committing when the lock is released.
    pub fn abandon(&mut self) {
        self.abandoned = true;
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }
}

impl<'c> Deref for TableLock<'c> {
    type Target = Statement<'c>;

    fn deref(&self) -> &Statement<'c> {
        &self.stmt
    }
}

impl<'c> DerefMut for TableLock<'c> {
    fn deref_mut(&mut self) -> &mut Statement<'c> {
        &mut self.stmt
    }
}

impl Drop for TableLock<'_> {
    fn drop(&mut self) {
        if self.locked {
            let released = if self.abandoned {
                tracing::warn!(tables = %self.tables.join(", "), "Rolling back and releasing lock");
                self.stmt.rollback_tables()
            } else {
                tracing::debug!(tables = %self.tables.join(", "), "Releasing lock");
                self.stmt.unlock_tables()
            };
            if !released {
                self.stmt.print_exceptions(Level::ERROR);
            }
            self.locked = false;
        }
    }
}
