//! Sequence number allocation.
//!
//! Every new validity record needs a SEQNO. Global numbers come from the
//! `GLOBALSEQNO` table of the authorizing entry and are unique across the
//! whole cascade; local numbers come from a per-entry `LOCALSEQNO` table,
//! created on demand. Both tables map a table name to its last used number,
//! with the `'*'` row giving the start of the entry's band.
//!
//! Allocation never fails loudly: it returns 0 and logs why.

use crate::cascade::{Cascade, TableLock, GLOBAL_SEQNO_TABLE, LOCAL_SEQNO_TABLE};
use condb_core::{DbNo, SeqNo, MAX_LOCAL_SEQNO};
use tracing::Level;

/// Which kind of SEQNO a caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqNoRequest {
    /// Must be global.
    Global,
    /// Global if the entry is the authorizing one and the table is not
    /// temporary, local otherwise.
    Auto,
    /// Must be local.
    Local,
}

impl SeqNoRequest {
    /// `> 0` global, `0` automatic, `< 0` local.
    pub fn from_i32(require_global: i32) -> Self {
        match require_global.signum() {
            1 => SeqNoRequest::Global,
            0 => SeqNoRequest::Auto,
            _ => SeqNoRequest::Local,
        }
    }
}

impl Cascade {
    /// Allocate a SEQNO for `table` on entry `db_no`; 0 on failure.
    ///
    /// A global request that cannot be honored (no authorizing entry, or a
    /// temporary table) falls back to a local number with a warning.
    pub fn allocate_seq_no(&mut self, table: &str, request: SeqNoRequest, db_no: DbNo) -> SeqNo {
        let is_temporary = self.is_temporary_table(table, db_no);
        let wants_global = match request {
            SeqNoRequest::Global => true,
            SeqNoRequest::Auto => Some(db_no) == self.authorizing_db() && !is_temporary,
            SeqNoRequest::Local => false,
        };

        if wants_global {
            match self.authorizing_db() {
                None => tracing::warn!(
                    table,
                    "Unable to issue global SEQNO - no authorizing DB in cascade, will issue local one instead"
                ),
                Some(_) if is_temporary => tracing::warn!(
                    table,
                    "Unable to issue global SEQNO - table is temporary, will issue local one instead"
                ),
                Some(auth) => return self.reserve_next_seq_no(table, true, auth),
            }
        }
        self.reserve_next_seq_no(table, false, db_no)
    }

    /// Reserve the next SEQNO of `table` under the table lock.
    ///
    /// The first reservation for each `(table, is_global, db_no)` also
    /// checks that the counter is not behind the highest SEQNO already in
    /// the entry's band of the validity table, and catches up if it is.
    pub fn reserve_next_seq_no(&mut self, table: &str, is_global: bool, db_no: DbNo) -> SeqNo {
        let seqno_table = if is_global {
            GLOBAL_SEQNO_TABLE
        } else {
            LOCAL_SEQNO_TABLE
        };
        let seqno_table_exists = self.table_exists(seqno_table, db_no);
        let table_exists = self.table_exists(table, db_no);
        let is_temporary = self.is_temporary_table(table, db_no);

        if !seqno_table_exists {
            if is_global {
                tracing::error!(db_no, table, "Unable to issue global SEQNO - entry is not an authorizing DB");
                return 0;
            }
            if !self.create_local_seqno_table(db_no) {
                return 0;
            }
        }

        let key = (table.to_string(), is_global, db_no);
        let needs_check = table_exists && self.checked_seqno.insert(key);
        let data_table = (!is_temporary && table_exists).then_some(table);

        let Some(stmt) = self.create_statement(db_no) else {
            return 0;
        };
        let mut lock = TableLock::acquire(stmt, seqno_table, data_table);
        if !lock.is_locked() {
            tracing::error!(db_no, table = seqno_table, "Unable to lock sequence table");
            return 0;
        }

        let sql = format!(
            "select * from {} where TABLENAME = '*' or TABLENAME = '{}' order by TABLENAME",
            seqno_table, table
        );
        tracing::debug!(db_no, sql = %sql, "Last used SEQNO query");
        let Some(set) = lock.execute_query(&sql) else {
            lock.print_exceptions(Level::DEBUG);
            lock.abandon();
            tracing::error!(db_no, table, "Unable to find default SeqNo due to above error");
            return 0;
        };
        let Some(seq_default) = set.value(0, 1).and_then(|v| v.as_i64()) else {
            tracing::error!(db_no, table, "Unable to find default SeqNo");
            return 0;
        };
        let mut seq_table = set
            .value(1, 1)
            .and_then(|v| v.as_i64())
            .unwrap_or(seq_default);
        tracing::debug!(db_no, table, last_used = seq_table, "Query returned last used SEQNO");

        if needs_check {
            let seq_min = seq_default;
            let seq_max = seq_default + i64::from(MAX_LOCAL_SEQNO);
            let sql = format!(
                "select max(SEQNO) from {}VLD where SEQNO between {} and {}",
                table, seq_min, seq_max
            );
            tracing::debug!(db_no, sql = %sql, "Max SEQNO query");
            let Some(set) = lock.execute_query(&sql) else {
                lock.print_exceptions(Level::ERROR);
                lock.abandon();
                return 0;
            };
            let highest = set.scalar().and_then(|v| v.as_i64()).unwrap_or(0).max(0);
            if highest > seq_table {
                tracing::error!(
                    db_no,
                    seqno_table,
                    table,
                    last_used = seq_table,
                    highest,
                    band_start = seq_min,
                    band_end = seq_max,
                    "Sequence table is out of date, it will be updated"
                );
                seq_table = highest;
            }
        }

        let delete = format!("delete from {} where TABLENAME='{}'", seqno_table, table);
        tracing::debug!(sql = %delete, "SEQNO entry removal");
        if !lock.execute_update(&delete) {
            lock.print_exceptions(Level::ERROR);
            lock.abandon();
            return 0;
        }

        let next = seq_table + 1;
        let insert = format!("insert into  {} values('{}',{})", seqno_table, table, next);
        tracing::debug!(sql = %insert, "SEQNO entry add");
        // A failed insert must not leave the counter row deleted.
        if !lock.execute_update(&insert) {
            lock.print_exceptions(Level::ERROR);
            lock.abandon();
            return 0;
        }

        match SeqNo::try_from(next) {
            Ok(seq_no) => seq_no,
            Err(_) => {
                tracing::error!(db_no, table, next, "Allocated SEQNO is out of range");
                lock.abandon();
                0
            }
        }
    }

    fn create_local_seqno_table(&mut self, db_no: DbNo) -> bool {
        let Some(mut stmt) = self.create_statement(db_no) else {
            return false;
        };
        let create = format!(
            "CREATE TABLE {}(TABLENAME      CHAR(64) NOT NULL PRIMARY KEY,\n LASTUSEDSEQNO  INT )",
            LOCAL_SEQNO_TABLE
        );
        let prime = format!("INSERT INTO {} VALUES ('*',0)", LOCAL_SEQNO_TABLE);
        for sql in [create, prime] {
            tracing::info!(db_no, sql = %sql, "Local SEQNO table setup");
            if !stmt.execute_update(&sql) {
                stmt.print_exceptions(Level::ERROR);
                return false;
            }
        }
        stmt.set_table_exists(LOCAL_SEQNO_TABLE);
        true
    }
}
