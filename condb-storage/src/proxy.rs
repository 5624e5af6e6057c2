//! Per-table SQL.
//!
//! [`DbProxy`] knows the name of one conditions table `T` and its validity
//! table `TVLD`, and turns every question the resolver and accessor ask into
//! SQL run on one cascade entry. Statement failures are logged and come back
//! as empty answers.

use crate::backend::RowSet;
use crate::cascade::Cascade;
use crate::row::read_validity_records;
use condb_core::{
    format_datetime, parse_datetime, time_ceiling, time_floor, timestamp_from_secs, DbNo, SeqNo,
    Task, Timestamp, ValidityContext, ValidityRecord, ANY_TASK,
};
use tracing::Level;

#[derive(Debug, Clone)]
pub struct DbProxy {
    table_name: String,
    vld_table_name: String,
    has_epoch: bool,
    sql_condition: String,
    order_context_query: bool,
}

impl DbProxy {
    pub fn new(table_name: &str, order_context_query: bool) -> Self {
        let table_name = table_name.to_uppercase();
        Self {
            vld_table_name: format!("{}VLD", table_name),
            table_name,
            has_epoch: false,
            sql_condition: String::new(),
            order_context_query,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn vld_table_name(&self) -> &str {
        &self.vld_table_name
    }

    /// True if the validity table has an `EPOCH` column, which switches
    /// priority resolution from creation date to epoch.
    pub fn has_epoch(&self) -> bool {
        self.has_epoch
    }

    pub fn sql_condition(&self) -> &str {
        &self.sql_condition
    }

    pub fn set_sql_condition(&mut self, sql: &str) {
        self.sql_condition = sql.to_string();
    }

    pub fn order_context_query(&self) -> bool {
        self.order_context_query
    }

    /// True if the data table exists on `select`, or on any entry.
    pub fn table_exists(&self, cascade: &Cascade, select: Option<DbNo>) -> bool {
        cascade.table_db_no(&self.table_name, select).is_some()
    }

    /// Re-read the validity table's columns from the first entry holding it.
    pub fn refresh_meta_data(&mut self, cascade: &mut Cascade) {
        let Some(db_no) = cascade.table_db_no(&self.vld_table_name, None) else {
            tracing::debug!(table = %self.vld_table_name, "No meta-data, table not found");
            return;
        };
        let Some(mut stmt) = cascade.create_statement(db_no) else {
            return;
        };
        let columns = stmt.column_names(&self.vld_table_name);
        stmt.print_exceptions(Level::DEBUG);
        self.has_epoch = columns.iter().any(|c| c == "EPOCH");
        tracing::debug!(table = %self.vld_table_name, db_no, has_epoch = self.has_epoch, "Stored meta-data");
    }

    fn run_query(&self, cascade: &mut Cascade, db_no: DbNo, sql: &str) -> Option<RowSet> {
        let mut stmt = cascade.create_statement(db_no)?;
        let set = stmt.execute_query(sql);
        stmt.print_exceptions(Level::DEBUG);
        set
    }

    fn run_update(&self, cascade: &mut Cascade, db_no: DbNo, sql: &str) -> bool {
        let Some(mut stmt) = cascade.create_statement(db_no) else {
            return false;
        };
        if !stmt.execute_update(sql) || stmt.print_exceptions(Level::ERROR) {
            tracing::error!(db_no, sql, "Maintenance statement failed");
            return false;
        }
        true
    }

    // ========================================================================
    // VALIDITY QUERIES
    // ========================================================================

    /// SQL selecting validity rows overlapping the time gate around the
    /// context.
    pub fn standard_context(context: &ValidityContext, time_gate_secs: i64) -> String {
        let (start_gate, end_gate) = gate_window(&context.timestamp, time_gate_secs);
        format!(
            "TIMESTART <= '{}' and TIMEEND > '{}' and DETECTORMASK & {} and SIMMASK & {}",
            format_datetime(&end_gate),
            format_datetime(&start_gate),
            context.detector.bits(),
            context.sim.bits()
        )
    }

    /// Full SQL of a validity query with an explicit context condition.
    pub fn validity_sql(&self, context_sql: &str, task: Task) -> String {
        let order_by = if self.has_epoch {
            "EPOCH desc,TIMESTART desc,INSERTDATE desc"
        } else {
            "CREATIONDATE desc"
        };
        let mut sql = format!("select * from {} where ", self.vld_table_name);
        if !self.sql_condition.is_empty() {
            sql.push_str(&self.sql_condition);
            sql.push_str(" and ");
        }
        sql.push_str(context_sql);
        if task != ANY_TASK {
            sql.push_str(&format!(" and  TASK = {}", task));
        }
        sql.push_str(&format!(" order by {}", order_by));
        sql
    }

    /// Validity rows for a standard context, highest priority first.
    pub fn query_validity(
        &self,
        cascade: &mut Cascade,
        context: &ValidityContext,
        task: Task,
        db_no: DbNo,
        time_gate_secs: i64,
    ) -> Vec<ValidityRecord> {
        let context_sql = Self::standard_context(context, time_gate_secs);
        self.query_validity_sql(cascade, &context_sql, task, db_no)
    }

    /// Validity rows for an arbitrary context condition, highest priority
    /// first.
    pub fn query_validity_sql(
        &self,
        cascade: &mut Cascade,
        context_sql: &str,
        task: Task,
        db_no: DbNo,
    ) -> Vec<ValidityRecord> {
        let sql = self.validity_sql(context_sql, task);
        tracing::debug!(db_no, sql = %sql, "Validity query");
        match self.run_query(cascade, db_no, &sql) {
            Some(set) => read_validity_records(&set, db_no, &self.table_name),
            None => Vec::new(),
        }
    }

    /// The validity row with `seq_no`, if present and not excluded by the
    /// SQL condition.
    pub fn query_validity_seqno(
        &self,
        cascade: &mut Cascade,
        seq_no: SeqNo,
        db_no: DbNo,
    ) -> Option<ValidityRecord> {
        let mut sql = format!("select * from {} where ", self.vld_table_name);
        if !self.sql_condition.is_empty() {
            sql.push_str(&self.sql_condition);
            sql.push_str(" and ");
        }
        sql.push_str(&format!("SEQNO = {}", seq_no));
        tracing::debug!(db_no, sql = %sql, "SEQNO validity query");
        let set = self.run_query(cascade, db_no, &sql)?;
        read_validity_records(&set, db_no, &self.table_name)
            .into_iter()
            .next()
    }

    /// Every validity row of an entry, or just `seq_no` when given.
    pub fn query_all_validities(
        &self,
        cascade: &mut Cascade,
        db_no: DbNo,
        seq_no: Option<SeqNo>,
    ) -> Vec<ValidityRecord> {
        let mut conditions = Vec::new();
        if !self.sql_condition.is_empty() {
            conditions.push(self.sql_condition.clone());
        }
        if let Some(seq_no) = seq_no.filter(|s| *s > 0) {
            conditions.push(format!("SEQNO = {}", seq_no));
        }
        let mut sql = format!("select * from {}", self.vld_table_name);
        if !conditions.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&conditions.join(" and "));
        }
        tracing::debug!(db_no, sql = %sql, "All validities query");
        match self.run_query(cascade, db_no, &sql) {
            Some(set) => read_validity_records(&set, db_no, &self.table_name),
            None => Vec::new(),
        }
    }

    /// Nearest validity boundaries beyond the time gate that could belong to
    /// a record of at least the priority of `lowest`.
    ///
    /// Returns `(start, end)`, wide open when there is no such boundary.
    #[allow(clippy::too_many_arguments)]
    pub fn find_time_boundaries(
        &self,
        cascade: &mut Cascade,
        context: &ValidityContext,
        task: Task,
        db_no: DbNo,
        time_gate_secs: i64,
        lowest: &ValidityRecord,
        resolve_by_creation_date: bool,
    ) -> (Timestamp, Timestamp) {
        tracing::debug!(
            table = %self.table_name,
            context = %context,
            task,
            lowest_creation = %format_datetime(&lowest.creation_date),
            lowest_epoch = lowest.epoch,
            resolve_by = if resolve_by_creation_date { "CREATIONDATE" } else { "EPOCH" },
            db_no,
            "Finding time boundaries"
        );

        let mut start = time_floor();
        let mut end = time_ceiling();
        let (start_gate, end_gate) = gate_window(&context.timestamp, time_gate_secs);
        let start_gate = format_datetime(&start_gate);
        let end_gate = format_datetime(&end_gate);

        let probes = [
            ("min(TIMESTART)", "TIMESTART >", &end_gate, true),
            ("min(TIMEEND)", "TIMEEND >", &end_gate, true),
            ("max(TIMESTART)", "TIMESTART <", &start_gate, false),
            ("max(TIMEEND)", "TIMEEND <", &start_gate, false),
        ];

        let Some(mut stmt) = cascade.create_statement(db_no) else {
            return (start, end);
        };
        for (select, compare, gate, is_upper) in probes {
            let mut sql = format!(
                "select {} from {} where {} '{}' and DETECTORMASK & {} and SIMMASK & {}",
                select,
                self.vld_table_name,
                compare,
                gate,
                context.detector.bits(),
                context.sim.bits()
            );
            if task != ANY_TASK {
                sql.push_str(&format!(" and  TASK = {}", task));
            }
            if resolve_by_creation_date {
                sql.push_str(&format!(
                    " and CREATIONDATE >= '{}'",
                    format_datetime(&lowest.creation_date)
                ));
            } else {
                sql.push_str(&format!(" and EPOCH >= {}", lowest.epoch));
            }
            if !self.sql_condition.is_empty() {
                sql.push_str(&format!(" and {}", self.sql_condition));
            }
            tracing::trace!(sql = %sql, "Time boundary probe");

            let set = stmt.execute_query(&sql);
            stmt.print_exceptions(Level::DEBUG);
            let Some(ts) = set
                .as_ref()
                .and_then(RowSet::scalar)
                .and_then(|v| v.as_text())
                .and_then(|text| parse_datetime(&text))
            else {
                continue;
            };
            if is_upper && ts < end {
                end = ts;
            }
            if !is_upper && ts > start {
                start = ts;
            }
        }

        tracing::debug!(
            table = %self.table_name,
            start = %format_datetime(&start),
            end = %format_datetime(&end),
            "Found time boundaries"
        );
        (start, end)
    }

    // ========================================================================
    // DATA QUERIES
    // ========================================================================

    /// Data rows of one SEQNO.
    pub fn query_seqno(&self, cascade: &mut Cascade, seq_no: SeqNo, db_no: DbNo) -> Option<RowSet> {
        let mut sql = format!("select * from {} where SEQNO= {}", self.table_name, seq_no);
        if self.order_context_query {
            sql.push_str(" order by ROW_COUNTER");
        }
        tracing::debug!(db_no, sql = %sql, "SeqNo query");
        self.run_query(cascade, db_no, &sql)
    }

    /// SQL selecting the data rows of several SEQNOs, runs of consecutive
    /// numbers collapsed into `between` ranges.
    pub fn seqnos_sql(&self, seq_nos: &[SeqNo], data_sql: &str) -> Option<String> {
        if seq_nos.is_empty() {
            return None;
        }
        let mut sorted = seq_nos.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut terms = Vec::new();
        let mut i = 0;
        while i < sorted.len() {
            let first = sorted[i];
            let mut last = first;
            let mut j = i + 1;
            while j < sorted.len() && sorted[j] == last + 1 {
                last = sorted[j];
                j += 1;
            }
            if last > first {
                terms.push(format!("SEQNO between {} and {}", first, last));
            } else {
                terms.push(format!("SEQNO = {}", first));
            }
            i = j;
        }

        let mut sql = format!("select * from {} where ", self.table_name);
        if data_sql.is_empty() {
            sql.push_str(&terms.join(" or "));
        } else {
            sql.push_str(&format!("( {} )  and ({})", terms.join(" or "), data_sql));
        }
        sql.push_str(" order by SEQNO");
        if self.order_context_query {
            sql.push_str(",ROW_COUNTER");
        }
        Some(sql)
    }

    /// Data rows of several SEQNOs in one query, ordered by SEQNO.
    pub fn query_seqnos(
        &self,
        cascade: &mut Cascade,
        seq_nos: &[SeqNo],
        db_no: DbNo,
        data_sql: &str,
    ) -> Option<RowSet> {
        let sql = self.seqnos_sql(seq_nos, data_sql)?;
        tracing::debug!(db_no, sql = %sql, "SeqNos query");
        self.run_query(cascade, db_no, &sql)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Delete a SEQNO from the data and validity tables.
    pub fn remove_seqno(&self, cascade: &mut Cascade, seq_no: SeqNo, db_no: DbNo) -> bool {
        [&self.table_name, &self.vld_table_name].iter().all(|table| {
            let sql = format!("delete from  {} where SEQNO = {}", table, seq_no);
            tracing::debug!(db_no, sql = %sql, "RemoveSeqNo");
            self.run_update(cascade, db_no, &sql)
        })
    }

    pub fn replace_insert_date(
        &self,
        cascade: &mut Cascade,
        ts: &Timestamp,
        seq_no: SeqNo,
        db_no: DbNo,
    ) -> bool {
        let sql = format!(
            "update  {} set INSERTDATE = '{}' where SEQNO = {}",
            self.vld_table_name,
            format_datetime(ts),
            seq_no
        );
        tracing::debug!(db_no, sql = %sql, "ReplaceInsertDate");
        self.run_update(cascade, db_no, &sql)
    }

    /// Renumber a SEQNO in the validity and data tables.
    pub fn replace_seqno(
        &self,
        cascade: &mut Cascade,
        old_seq_no: SeqNo,
        new_seq_no: SeqNo,
        db_no: DbNo,
    ) -> bool {
        if cascade.connection(db_no).is_none() {
            tracing::error!(db_no, "Cannot renumber, no connection to cascade entry");
            return false;
        }
        [&self.vld_table_name, &self.table_name].iter().all(|table| {
            let sql = format!(
                "update  {} set SEQNO = {} where SEQNO = {}",
                table, new_seq_no, old_seq_no
            );
            tracing::debug!(db_no, sql = %sql, "ReplaceSeqNo");
            self.run_update(cascade, db_no, &sql)
        })
    }
}

/// `[ts - gate, ts + gate)` to whole seconds.
fn gate_window(ts: &Timestamp, time_gate_secs: i64) -> (Timestamp, Timestamp) {
    let secs = ts.timestamp();
    (
        timestamp_from_secs(secs - time_gate_secs),
        timestamp_from_secs(secs + time_gate_secs),
    )
}
