//! Query results.
//!
//! A [`QueryResult`] is either a [`SimpleResult`], the rows of one validity
//! record, or an [`AggregatedResult`], one simple component per aggregate
//! presented as a single table. Results live in a
//! [`ResultCache`](crate::cache::ResultCache) and are read through
//! [`ResultHandle`]s, which keep a client count so the cache never drops a
//! result somebody still reads.

use crate::backend::{RowSet, SqlValue};
use crate::row::{RowReader, TableRow};
use condb_core::{
    ExceptionLog, ResultKey, Task, ValidityContext, ValidityRecord,
};
use once_cell::unsync::OnceCell;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_RESULT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// SHARED STATE
// ============================================================================

/// State common to both result shapes.
#[derive(Debug)]
pub struct ResultCore {
    id: u64,
    table_name: String,
    sql_qualifiers: String,
    can_reuse: Cell<bool>,
    num_clients: Cell<u32>,
    eff_vrec: RefCell<ValidityRecord>,
    key: RefCell<Option<ResultKey>>,
    exception_log: RefCell<ExceptionLog>,
    from_db: bool,
}

impl ResultCore {
    fn new(table_name: &str, eff_vrec: ValidityRecord, sql_qualifiers: &str, from_db: bool) -> Self {
        Self {
            id: NEXT_RESULT_ID.fetch_add(1, Ordering::Relaxed),
            table_name: table_name.to_string(),
            sql_qualifiers: sql_qualifiers.to_string(),
            can_reuse: Cell::new(true),
            num_clients: Cell::new(0),
            eff_vrec: RefCell::new(eff_vrec),
            key: RefCell::new(None),
            exception_log: RefCell::new(ExceptionLog::new()),
            from_db,
        }
    }

    fn is_extended(&self) -> bool {
        !self.sql_qualifiers.is_empty()
    }

    /// Standard-context test shared by both shapes.
    ///
    /// A reusable result whose record no longer covers the context and that
    /// nobody reads is retired on the way.
    fn satisfies(&self, context: &ValidityContext, task: Task) -> bool {
        if self.is_extended() {
            return false;
        }
        let vrec = self.eff_vrec.borrow();
        if self.can_reuse.get() && vrec.is_compatible(context, task) {
            return true;
        }
        if self.can_reuse.get() && vrec.has_expired_for(context, task) && self.num_clients.get() == 0 {
            self.can_reuse.set(false);
        }
        false
    }

    fn satisfies_qualifiers(&self, sql_qualifiers: &str) -> bool {
        self.can_reuse.get() && self.is_extended() && self.sql_qualifiers == sql_qualifiers
    }
}

// ============================================================================
// SIMPLE RESULT
// ============================================================================

/// Rows of a single validity record.
#[derive(Debug)]
pub struct SimpleResult<R: TableRow> {
    core: ResultCore,
    rows: Vec<R>,
    index_map: OnceCell<HashMap<u32, usize>>,
}

impl<R: TableRow> SimpleResult<R> {
    pub fn from_rows(
        table_name: &str,
        rows: Vec<R>,
        vrec: ValidityRecord,
        sql_qualifiers: &str,
        from_db: bool,
    ) -> Self {
        Self {
            core: ResultCore::new(table_name, vrec, sql_qualifiers, from_db),
            rows,
            index_map: OnceCell::new(),
        }
    }

    /// Result without rows, e.g. for a gap.
    pub fn empty(table_name: &str, vrec: ValidityRecord, sql_qualifiers: &str) -> Self {
        Self::from_rows(table_name, Vec::new(), vrec, sql_qualifiers, true)
    }

    /// Fill rows from data-table rows sharing `columns`.
    ///
    /// Rows that fail to fill are logged, recorded in the result's exception
    /// log and skipped.
    pub fn from_data_rows(
        table_name: &str,
        columns: &[String],
        values: &[&[SqlValue]],
        vrec: ValidityRecord,
        sql_qualifiers: &str,
        fill_options: &str,
    ) -> Self {
        let mut log = ExceptionLog::new();
        let mut rows = Vec::with_capacity(values.len());
        for (position, row) in values.iter().enumerate() {
            let mut reader = RowReader::for_data_row(columns, row).with_fill_options(fill_options);
            match R::fill(&mut reader, Some(&vrec)) {
                Ok(filled) => rows.push(filled),
                Err(e) => {
                    tracing::error!(
                        table = table_name,
                        row = R::row_name(),
                        seq_no = vrec.seq_no,
                        position,
                        error = %e,
                        "Failed to fill row"
                    );
                    log.add(condb_core::DbException::new(e.to_string(), 0).with_db_no(vrec.db_no));
                }
            }
        }
        let result = Self::from_rows(table_name, rows, vrec, sql_qualifiers, true);
        *result.core.exception_log.borrow_mut() = log;
        result
    }

    /// Fill rows from every row of a query.
    pub fn from_row_set(
        table_name: &str,
        set: Option<&RowSet>,
        vrec: ValidityRecord,
        sql_qualifiers: &str,
        fill_options: &str,
    ) -> Self {
        match set {
            Some(set) => {
                let values: Vec<&[SqlValue]> = set.rows().iter().map(Vec::as_slice).collect();
                Self::from_data_rows(table_name, set.columns(), &values, vrec, sql_qualifiers, fill_options)
            }
            None => Self::empty(table_name, vrec, sql_qualifiers),
        }
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    /// Validity-record test: the result holds exactly this record's data.
    ///
    /// On a match the effective record is refreshed to `vrec`, whose window
    /// may have been trimmed differently by the latest query.
    pub fn satisfies_vrec(&self, vrec: &ValidityRecord, sql_qualifiers: &str) -> bool {
        let matched = self.holds_vrec(vrec, sql_qualifiers);
        if matched {
            *self.core.eff_vrec.borrow_mut() = vrec.clone();
        }
        matched
    }

    /// The match half of [`satisfies_vrec`](Self::satisfies_vrec), leaving
    /// the effective record alone.
    pub fn holds_vrec(&self, vrec: &ValidityRecord, sql_qualifiers: &str) -> bool {
        let own = self.core.eff_vrec.borrow();
        self.core.can_reuse.get()
            && self.core.sql_qualifiers == sql_qualifiers
            && own.seq_no == vrec.seq_no
            && own.creation_date == vrec.creation_date
    }

    fn index_map(&self) -> &HashMap<u32, usize> {
        self.index_map.get_or_init(|| {
            let mut map = HashMap::new();
            // Filled back to front so the first row with an index wins.
            for (position, row) in self.rows.iter().enumerate().rev() {
                let index = row.index(position as u32);
                if map.insert(index, position).is_some() && !self.core.is_extended() {
                    tracing::error!(
                        table = %self.core.table_name,
                        row = R::row_name(),
                        index,
                        "Duplicate row index"
                    );
                }
            }
            map
        })
    }

    /// Serialisable form, used by the L2 cache.
    pub fn to_payload(&self) -> SimplePayload<R> {
        SimplePayload {
            validity: self.core.eff_vrec.borrow().clone(),
            rows: self.rows.clone(),
        }
    }

    /// Rebuild from an L2 payload. Restored results are not from the
    /// database, so they are never saved back.
    pub fn from_payload(table_name: &str, payload: SimplePayload<R>) -> Self {
        Self::from_rows(table_name, payload.rows, payload.validity, "", false)
    }
}

/// A simple result as stored in the L2 cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "R: TableRow")]
pub struct SimplePayload<R: TableRow> {
    pub validity: ValidityRecord,
    pub rows: Vec<R>,
}

// ============================================================================
// AGGREGATED RESULT
// ============================================================================

/// One simple component per aggregate, presented as a single table.
///
/// Components stay connected while the aggregated result lives.
#[derive(Debug)]
pub struct AggregatedResult<R: TableRow> {
    core: ResultCore,
    components: Vec<ResultHandle<R>>,
    /// `(component, row)` of every row, in presentation order.
    row_keys: Vec<(usize, usize)>,
    index_map: OnceCell<HashMap<u32, usize>>,
}

impl<R: TableRow> AggregatedResult<R> {
    /// Assemble from components. `global_vrec` is the aggregate -1 record;
    /// its window is narrowed to the intersection of every component's.
    pub fn new(
        table_name: &str,
        components: Vec<ResultHandle<R>>,
        mut global_vrec: ValidityRecord,
        sql_qualifiers: &str,
    ) -> Self {
        let mut row_keys = Vec::new();
        for (component_idx, component) in components.iter().enumerate() {
            let vrec = component.validity_record();
            global_vrec.and_time_window(vrec.time_start(), vrec.time_end());
            drop(vrec);
            row_keys.extend((0..component.num_rows()).map(|row| (component_idx, row)));
        }
        let from_db = components.iter().all(|c| c.is_from_db());
        Self {
            core: ResultCore::new(table_name, global_vrec, sql_qualifiers, from_db),
            components,
            row_keys,
            index_map: OnceCell::new(),
        }
    }

    pub fn components(&self) -> &[ResultHandle<R>] {
        &self.components
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    fn row(&self, row: usize) -> Option<&R> {
        let (component, position) = *self.row_keys.get(row)?;
        self.components.get(component)?.row(position)
    }

    fn index_map(&self) -> &HashMap<u32, usize> {
        self.index_map.get_or_init(|| {
            let mut map = HashMap::new();
            for row in (0..self.row_keys.len()).rev() {
                let Some(value) = self.row(row) else {
                    continue;
                };
                let index = value.index(row as u32);
                if map.insert(index, row).is_some() && !self.core.is_extended() {
                    tracing::error!(
                        table = %self.core.table_name,
                        row = R::row_name(),
                        index,
                        "Duplicate row index"
                    );
                }
            }
            map
        })
    }
}

// ============================================================================
// QUERY RESULT
// ============================================================================

#[derive(Debug)]
pub enum QueryResult<R: TableRow> {
    Simple(SimpleResult<R>),
    Aggregated(AggregatedResult<R>),
}

impl<R: TableRow> QueryResult<R> {
    fn core(&self) -> &ResultCore {
        match self {
            QueryResult::Simple(r) => &r.core,
            QueryResult::Aggregated(r) => &r.core,
        }
    }

    /// Process-unique id.
    pub fn id(&self) -> u64 {
        self.core().id
    }

    pub fn table_name(&self) -> &str {
        &self.core().table_name
    }

    pub fn row_name(&self) -> &'static str {
        R::row_name()
    }

    pub fn sql_qualifiers(&self) -> &str {
        &self.core().sql_qualifiers
    }

    /// Product of an extended (raw SQL) query.
    pub fn is_extended(&self) -> bool {
        self.core().is_extended()
    }

    pub fn is_aggregated(&self) -> bool {
        matches!(self, QueryResult::Aggregated(_))
    }

    /// False for results restored from the L2 cache.
    pub fn is_from_db(&self) -> bool {
        self.core().from_db
    }

    /// Aggregates answered by this result, the unit of the reuse counter.
    pub fn num_aggregates(&self) -> usize {
        match self {
            QueryResult::Simple(_) => 1,
            QueryResult::Aggregated(r) => r.components.len(),
        }
    }

    pub fn num_rows(&self) -> usize {
        match self {
            QueryResult::Simple(r) => r.rows.len(),
            QueryResult::Aggregated(r) => r.row_keys.len(),
        }
    }

    pub fn row(&self, row: usize) -> Option<&R> {
        match self {
            QueryResult::Simple(r) => r.rows.get(row),
            QueryResult::Aggregated(r) => r.row(row),
        }
    }

    /// Row by natural index (see [`TableRow::index`]).
    pub fn row_by_index(&self, index: u32) -> Option<&R> {
        let position = match self {
            QueryResult::Simple(r) => r.index_map().get(&index).copied(),
            QueryResult::Aggregated(r) => r.index_map().get(&index).copied(),
        }?;
        self.row(position)
    }

    /// Effective validity record of the whole result.
    pub fn validity_record(&self) -> Ref<'_, ValidityRecord> {
        self.core().eff_vrec.borrow()
    }

    /// Validity record of the component holding `row`.
    pub fn validity_record_for_row(&self, row: usize) -> Option<ValidityRecord> {
        match self {
            QueryResult::Simple(r) => (row < r.rows.len()).then(|| r.core.eff_vrec.borrow().clone()),
            QueryResult::Aggregated(r) => {
                let (component, _) = *r.row_keys.get(row)?;
                let vrec = r.components.get(component)?.validity_record().clone();
                Some(vrec)
            }
        }
    }

    pub fn can_reuse(&self) -> bool {
        self.core().can_reuse.get()
    }

    pub fn set_can_reuse(&self, can_reuse: bool) {
        self.core().can_reuse.set(can_reuse);
    }

    pub fn num_clients(&self) -> u32 {
        self.core().num_clients.get()
    }

    fn connect(&self) {
        let core = self.core();
        core.num_clients.set(core.num_clients.get() + 1);
    }

    fn disconnect(&self) {
        let core = self.core();
        let clients = core.num_clients.get();
        if clients == 0 {
            tracing::error!(id = core.id, table = %core.table_name, "Disconnect without matching connect");
            return;
        }
        core.num_clients.set(clients - 1);
    }

    /// Whether the cache may drop this result.
    ///
    /// Requires no clients *and* no further reuse: an unheld result that is
    /// still reusable stays cached, so `can_delete(None)` is false for it.
    /// With `newer`, a reusable result whose record has expired relative to
    /// `newer`'s is retired first.
    pub fn can_delete(&self, newer: Option<&QueryResult<R>>) -> bool {
        let core = self.core();
        if let Some(newer) = newer {
            if core.can_reuse.get() && core.eff_vrec.borrow().has_expired(&newer.validity_record()) {
                core.can_reuse.set(false);
            }
        }
        core.num_clients.get() == 0 && !core.can_reuse.get()
    }

    // ------------------------------------------------------------------------
    // Query predicates
    // ------------------------------------------------------------------------

    /// Standard-context test.
    pub fn satisfies(&self, context: &ValidityContext, task: Task) -> bool {
        self.core().satisfies(context, task)
    }

    /// Validity-record test; only simple results can answer it.
    pub fn satisfies_vrec(&self, vrec: &ValidityRecord, sql_qualifiers: &str) -> bool {
        match self {
            QueryResult::Simple(r) => r.satisfies_vrec(vrec, sql_qualifiers),
            QueryResult::Aggregated(_) => false,
        }
    }

    pub fn holds_vrec(&self, vrec: &ValidityRecord, sql_qualifiers: &str) -> bool {
        match self {
            QueryResult::Simple(r) => r.holds_vrec(vrec, sql_qualifiers),
            QueryResult::Aggregated(_) => false,
        }
    }

    /// Extended-query test.
    pub fn satisfies_qualifiers(&self, sql_qualifiers: &str) -> bool {
        self.core().satisfies_qualifiers(sql_qualifiers)
    }

    // ------------------------------------------------------------------------
    // Fingerprint and diagnostics
    // ------------------------------------------------------------------------

    /// Compute and store the fingerprint.
    pub fn generate_key(&self) {
        let core = self.core();
        let mut key = ResultKey::new(core.table_name.clone(), R::row_name());
        match self {
            QueryResult::Simple(r) => {
                let vrec = r.core.eff_vrec.borrow();
                key.add_vrec_key(vrec.seq_no, vrec.creation_date);
            }
            QueryResult::Aggregated(r) => {
                for component in &r.components {
                    let vrec = component.validity_record();
                    key.add_vrec_key(vrec.seq_no, vrec.creation_date);
                }
            }
        }
        *core.key.borrow_mut() = Some(key);
    }

    pub fn key(&self) -> Option<ResultKey> {
        self.core().key.borrow().clone()
    }

    pub fn exception_log(&self) -> Ref<'_, ExceptionLog> {
        self.core().exception_log.borrow()
    }

    /// Record the entries `source` gained since `start`.
    pub fn capture_exception_log(&self, source: &ExceptionLog, start: usize) {
        source.copy_since(&mut self.core().exception_log.borrow_mut(), start);
    }

    /// The simple results making up this one, for the L2 cache. Gap
    /// components carry no data and are left out.
    pub fn simple_payloads(&self) -> Vec<SimplePayload<R>> {
        match self {
            QueryResult::Simple(r) if r.core.eff_vrec.borrow().is_gap => Vec::new(),
            QueryResult::Simple(r) => vec![r.to_payload()],
            QueryResult::Aggregated(r) => r
                .components
                .iter()
                .flat_map(|c| c.simple_payloads())
                .collect(),
        }
    }
}

impl<R: TableRow> fmt::Display for QueryResult<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        write!(
            f,
            "{} result {} for {}::{} rows {} clients {}{}",
            if self.is_aggregated() { "Aggregated" } else { "Simple" },
            core.id,
            core.table_name,
            R::row_name(),
            self.num_rows(),
            core.num_clients.get(),
            if core.can_reuse.get() { "" } else { " (stale)" }
        )?;
        if core.is_extended() {
            write!(f, " qualifiers '{}'", core.sql_qualifiers)?;
        }
        write!(f, " vrec {}", core.eff_vrec.borrow())
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Connected reference to a cached result.
///
/// The result's client count is raised while the handle lives, which keeps
/// the cache from dropping it.
#[must_use]
pub struct ResultHandle<R: TableRow> {
    result: Rc<QueryResult<R>>,
}

impl<R: TableRow> ResultHandle<R> {
    pub fn new(result: Rc<QueryResult<R>>) -> Self {
        result.connect();
        Self { result }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.result, &b.result)
    }

    /// The shared result, for storing in a cache pool.
    pub fn shared(&self) -> &Rc<QueryResult<R>> {
        &self.result
    }
}

impl<R: TableRow> Clone for ResultHandle<R> {
    fn clone(&self) -> Self {
        Self::new(self.result.clone())
    }
}

impl<R: TableRow> Deref for ResultHandle<R> {
    type Target = QueryResult<R>;

    fn deref(&self) -> &QueryResult<R> {
        &self.result
    }
}

impl<R: TableRow> Drop for ResultHandle<R> {
    fn drop(&mut self) {
        self.result.disconnect();
    }
}

impl<R: TableRow> fmt::Debug for ResultHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("id", &self.result.id())
            .field("clients", &self.result.num_clients())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use condb_core::{
        parse_datetime, Detector, DetectorMask, RowError, SimFlag, SimMask, Timestamp,
        ValidityRange, DATABASE_SOURCE,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Gain {
        channel: u32,
        gain: f64,
    }

    impl TableRow for Gain {
        fn row_name() -> &'static str {
            "Gain"
        }

        fn fill(reader: &mut RowReader<'_>, _vrec: Option<&ValidityRecord>) -> Result<Self, RowError> {
            Ok(Self {
                channel: reader.next_u32()?,
                gain: reader.next_f64()?,
            })
        }

        fn index(&self, _position: u32) -> u32 {
            self.channel
        }
    }

    fn ts(text: &str) -> Timestamp {
        parse_datetime(text).unwrap()
    }

    fn make_test_vrec(seq: u32, agg: i32, start: &str, end: &str) -> ValidityRecord {
        let range = ValidityRange::new(DetectorMask::MCAPTAIN, SimMask::DATA, ts(start), ts(end), DATABASE_SOURCE);
        ValidityRecord::new(seq, agg, range, 0, ts("2020-01-01 00:00:00"), ts("2020-01-01 00:00:00"), 0, 0)
    }

    fn make_test_simple(seq: u32, agg: i32, channels: &[u32]) -> Rc<QueryResult<Gain>> {
        let rows = channels.iter().map(|&c| Gain { channel: c, gain: c as f64 / 10.0 }).collect();
        let vrec = make_test_vrec(seq, agg, "2020-01-01 00:00:00", "2020-06-01 00:00:00");
        Rc::new(QueryResult::Simple(SimpleResult::from_rows("CALIB", rows, vrec, "", true)))
    }

    fn make_test_context(date: &str) -> ValidityContext {
        ValidityContext::new(Detector::MCaptain, SimFlag::Data, ts(date))
    }

    #[test]
    fn test_handles_count_clients() {
        let result = make_test_simple(1, -1, &[1, 2]);
        let a = ResultHandle::new(result.clone());
        let b = a.clone();
        assert_eq!(result.num_clients(), 2);
        assert!(ResultHandle::ptr_eq(&a, &b));
        drop(a);
        assert_eq!(result.num_clients(), 1);
        drop(b);
        assert_eq!(result.num_clients(), 0);
    }

    #[test]
    fn test_satisfies_context() {
        let result = make_test_simple(1, -1, &[1]);
        assert!(result.satisfies(&make_test_context("2020-03-01 00:00:00"), 0));
        assert!(!result.satisfies(&make_test_context("2020-03-01 00:00:00"), 1));

        // Outside the window with no clients: retired.
        assert!(!result.satisfies(&make_test_context("2021-03-01 00:00:00"), 0));
        assert!(!result.can_reuse());
        assert!(!result.satisfies(&make_test_context("2020-03-01 00:00:00"), 0));
    }

    #[test]
    fn test_held_result_not_retired_by_context() {
        let result = make_test_simple(1, -1, &[1]);
        let _held = ResultHandle::new(result.clone());
        assert!(!result.satisfies(&make_test_context("2021-03-01 00:00:00"), 0));
        assert!(result.can_reuse());
    }

    #[test]
    fn test_satisfies_vrec_refreshes_window() {
        let result = make_test_simple(4, 0, &[1]);
        let mut narrower = make_test_vrec(4, 0, "2020-02-01 00:00:00", "2020-03-01 00:00:00");
        assert!(result.satisfies_vrec(&narrower, ""));
        assert_eq!(result.validity_record().time_start(), ts("2020-02-01 00:00:00"));
        assert!(!result.satisfies_vrec(&narrower, "other"));
        narrower.seq_no = 5;
        assert!(!result.satisfies_vrec(&narrower, ""));
    }

    #[test]
    fn test_extended_only_matches_qualifiers() {
        let vrec = make_test_vrec(1, -1, "2020-01-01 00:00:00", "2020-06-01 00:00:00");
        let result: QueryResult<Gain> =
            QueryResult::Simple(SimpleResult::from_rows("CALIB", Vec::new(), vrec, "ctx;;", true));
        assert!(result.is_extended());
        assert!(!result.satisfies(&make_test_context("2020-03-01 00:00:00"), 0));
        assert!(result.satisfies_qualifiers("ctx;;"));
        assert!(!result.satisfies_qualifiers("ctx;x;"));

        let plain = make_test_simple(1, -1, &[1]);
        assert!(!plain.satisfies_qualifiers(""));
    }

    #[test]
    fn test_can_delete() {
        let result = make_test_simple(1, -1, &[1]);
        assert!(!result.can_delete(None));

        let overlapping = make_test_simple(2, -1, &[1]);
        assert!(!result.can_delete(Some(&*overlapping)));

        let later = Rc::new(QueryResult::Simple(SimpleResult::<Gain>::from_rows(
            "CALIB",
            Vec::new(),
            make_test_vrec(3, -1, "2020-07-01 00:00:00", "2020-08-01 00:00:00"),
            "",
            true,
        )));
        let held = ResultHandle::new(result.clone());
        assert!(!result.can_delete(Some(&*later)));
        assert!(!result.can_reuse());
        drop(held);
        assert!(result.can_delete(None));
    }

    #[test]
    fn test_aggregated_rows_and_window() {
        let c0 = make_test_simple(10, 0, &[1, 2]);
        let c1 = Rc::new(QueryResult::Simple(SimpleResult::from_rows(
            "CALIB",
            vec![Gain { channel: 7, gain: 0.7 }],
            make_test_vrec(11, 1, "2020-03-01 00:00:00", "2020-04-01 00:00:00"),
            "",
            true,
        )));
        let global = make_test_vrec(0, -1, "2019-01-01 00:00:00", "2021-01-01 00:00:00");
        let agg = QueryResult::Aggregated(AggregatedResult::new(
            "CALIB",
            vec![ResultHandle::new(c0.clone()), ResultHandle::new(c1.clone())],
            global,
            "",
        ));

        assert_eq!(c0.num_clients(), 1);
        assert_eq!(agg.num_rows(), 3);
        assert_eq!(agg.row(2).unwrap().channel, 7);
        assert_eq!(agg.row_by_index(2).unwrap().gain, 0.2);
        assert!(agg.row_by_index(99).is_none());
        assert_eq!(agg.validity_record_for_row(2).unwrap().seq_no, 11);
        assert_eq!(agg.validity_record().time_start(), ts("2020-03-01 00:00:00"));
        assert_eq!(agg.validity_record().time_end(), ts("2020-04-01 00:00:00"));
        assert!(!agg.satisfies_vrec(&make_test_vrec(10, 0, "2020-01-01 00:00:00", "2020-06-01 00:00:00"), ""));

        agg.generate_key();
        let key = agg.key().unwrap();
        assert_eq!(key.num_vrecs(), 2);
        assert_eq!(key.table_row_name(), "CALIB::Gain");
        assert_eq!(agg.simple_payloads().len(), 2);

        drop(agg);
        assert_eq!(c0.num_clients(), 0);
    }

    #[test]
    fn test_duplicate_index_first_row_wins() {
        let result = make_test_simple(1, -1, &[3, 3, 4]);
        let row = result.row_by_index(3).unwrap();
        assert!(std::ptr::eq(row, result.row(0).unwrap()));
    }

    #[test]
    fn test_fill_from_data_rows() {
        let mut set = RowSet::new(vec!["SEQNO".into(), "ROW_COUNTER".into(), "CHANNEL".into(), "GAIN".into()]);
        set.push_row(vec![SqlValue::Integer(1), SqlValue::Integer(1), SqlValue::Integer(5), SqlValue::Real(1.5)]);
        set.push_row(vec![SqlValue::Integer(1), SqlValue::Integer(2), SqlValue::from("bad"), SqlValue::Real(2.5)]);
        let vrec = make_test_vrec(1, -1, "2020-01-01 00:00:00", "2020-06-01 00:00:00");
        let result: QueryResult<Gain> =
            QueryResult::Simple(SimpleResult::from_row_set("CALIB", Some(&set), vrec, "", ""));
        assert_eq!(result.num_rows(), 1);
        assert_eq!(result.row(0).unwrap().channel, 5);
        assert_eq!(result.exception_log().len(), 1);
        assert!(result.is_from_db());
    }

    #[test]
    fn test_payload_restores_not_from_db() {
        let result = make_test_simple(1, -1, &[1, 2]);
        let payload = result.simple_payloads().remove(0);
        let restored = SimpleResult::from_payload("CALIB", payload);
        assert_eq!(restored.rows().len(), 2);
        assert!(!QueryResult::Simple(restored).is_from_db());
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            #[test]
            fn prop_can_delete_requires_no_clients(ops in prop::collection::vec(any::<bool>(), 0..40)) {
                let result = make_test_simple(1, -1, &[1]);
                result.set_can_reuse(false);
                let mut handles = Vec::new();
                for connect in ops {
                    if connect {
                        handles.push(ResultHandle::new(result.clone()));
                    } else {
                        handles.pop();
                    }
                    prop_assert_eq!(result.num_clients() as usize, handles.len());
                    prop_assert_eq!(result.can_delete(None), handles.is_empty());
                }
            }
        }
    }
}
