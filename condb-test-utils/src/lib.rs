//! condb Test Utilities
//!
//! Shared test infrastructure for the condb workspace:
//! - Scratch SQLite cascades in a temporary directory
//! - Seeding helpers for conditions and validity tables
//! - A sample row type and a backend factory that fails on demand
//! - Proptest generators for contexts and validity records
//! - Custom assertions on validity windows

pub use condb_core::{
    parse_datetime, AggregateNo, BackendDescriptor, CascadeConfig, ConnectionError, DbNo, DbiConfig,
    Detector, DetectorMask, RowError, SeqNo, SimFlag, SimMask, Task, Timestamp, ValidityContext,
    ValidityRange, ValidityRecord, DATABASE_SOURCE,
};
pub use condb_storage::{
    vld_table_ddl, Backend, BackendFactory, Cascade, RowReader, SqliteBackend, SqliteFactory,
    TableRow,
};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// ============================================================================
// SAMPLE ROW TYPE
// ============================================================================

/// A gain calibration row: `CHANNEL integer, GAIN real`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainRow {
    pub channel: u32,
    pub gain: f64,
}

impl TableRow for GainRow {
    fn row_name() -> &'static str {
        "GainRow"
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

    fn can_l2_cache() -> bool {
        true
    }
}

/// Data columns of the tables [`GainRow`] reads.
pub const GAIN_COLUMNS: &str = "CHANNEL integer, GAIN real";

// ============================================================================
// FLAKY BACKENDS
// ============================================================================

/// A [`SqliteFactory`] whose first `failures` opens are refused.
#[derive(Debug, Default)]
pub struct FlakyFactory {
    inner: SqliteFactory,
    failures_left: AtomicU32,
    opens: AtomicU32,
}

impl FlakyFactory {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: SqliteFactory,
            failures_left: AtomicU32::new(failures),
            opens: AtomicU32::new(0),
        }
    }

    /// Open attempts so far, failed ones included.
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl BackendFactory for FlakyFactory {
    fn name(&self) -> &str {
        "flaky-sqlite"
    }

    fn accepts(&self, url: &str) -> bool {
        self.inner.accepts(url)
    }

    fn open(&self, descriptor: &BackendDescriptor) -> Result<Box<dyn Backend>, ConnectionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionError::BadConnection {
                url: descriptor.url.clone(),
                attempts: 1,
                reason: "refused by test factory".to_string(),
            });
        }
        self.inner.open(descriptor)
    }

    fn is_volatile(&self, url: &str) -> bool {
        self.inner.is_volatile(url)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Scratch databases and seeding helpers.

    use super::*;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Start of the global SEQNO band handed out by an authorizing entry.
    pub const GLOBAL_SEQNO_START: i64 = 100_000_000;

    /// One `<TABLE>VLD` row to seed.
    #[derive(Debug, Clone)]
    pub struct ValiditySeed {
        pub seq_no: SeqNo,
        pub time_start: String,
        pub time_end: String,
        pub epoch: i32,
        pub detector_mask: u32,
        pub sim_mask: u32,
        pub task: Task,
        pub aggregate_no: AggregateNo,
        pub creation_date: String,
        pub insert_date: String,
    }

    impl ValiditySeed {
        /// Non-aggregated, task 0, MCaptain data, created at the window start.
        pub fn new(seq_no: SeqNo, time_start: &str, time_end: &str) -> Self {
            Self {
                seq_no,
                time_start: time_start.to_string(),
                time_end: time_end.to_string(),
                epoch: 0,
                detector_mask: Detector::MCaptain.bits(),
                sim_mask: SimFlag::Data.bits(),
                task: 0,
                aggregate_no: -1,
                creation_date: time_start.to_string(),
                insert_date: time_start.to_string(),
            }
        }

        pub fn with_aggregate(mut self, aggregate_no: AggregateNo) -> Self {
            self.aggregate_no = aggregate_no;
            self
        }

        pub fn with_task(mut self, task: Task) -> Self {
            self.task = task;
            self
        }

        pub fn with_epoch(mut self, epoch: i32) -> Self {
            self.epoch = epoch;
            self
        }

        pub fn with_sim_mask(mut self, sim_mask: u32) -> Self {
            self.sim_mask = sim_mask;
            self
        }

        pub fn with_creation_date(mut self, date: &str) -> Self {
            self.creation_date = date.to_string();
            self
        }

        pub fn with_insert_date(mut self, date: &str) -> Self {
            self.insert_date = date.to_string();
            self
        }

        pub fn insert_sql(&self, table: &str) -> String {
            format!(
                "insert into {}VLD values ({}, '{}', '{}', {}, 0, {}, {}, {}, {}, '{}', '{}')",
                table,
                self.seq_no,
                self.time_start,
                self.time_end,
                self.epoch,
                self.detector_mask,
                self.sim_mask,
                self.task,
                self.aggregate_no,
                self.creation_date,
                self.insert_date
            )
        }
    }

    /// A set of SQLite files forming a cascade, highest priority first.
    pub struct ScratchDb {
        dir: TempDir,
        urls: Vec<String>,
    }

    impl ScratchDb {
        /// `entries` file-backed databases named `db0.db`, `db1.db`, ...
        pub fn new(entries: usize) -> Self {
            let dir = TempDir::new().expect("temporary directory");
            let urls = (0..entries)
                .map(|i| format!("sqlite://{}", dir.path().join(format!("db{}.db", i)).display()))
                .collect();
            Self { dir, urls }
        }

        pub fn dir(&self) -> &Path {
            self.dir.path()
        }

        pub fn url(&self, db_no: DbNo) -> &str {
            &self.urls[db_no]
        }

        pub fn urls(&self) -> &[String] {
            &self.urls
        }

        /// Run `sql` directly on entry `db_no`, outside any cascade.
        pub fn execute(&self, db_no: DbNo, sql: &str) {
            let mut backend = SqliteBackend::open(self.url(db_no)).expect("open scratch database");
            backend
                .execute(sql)
                .unwrap_or_else(|e| panic!("{} failed: {}", sql, e));
        }

        /// Create `<table>` with `data_columns` and its `<table>VLD`.
        pub fn create_table(&self, db_no: DbNo, table: &str, data_columns: &str) {
            self.execute(
                db_no,
                &format!(
                    "create table {} (SEQNO integer not null, ROW_COUNTER integer not null, {})",
                    table, data_columns
                ),
            );
            self.execute(db_no, &vld_table_ddl(table, false));
        }

        /// Make entry `db_no` the authorizing one.
        pub fn make_authorizing(&self, db_no: DbNo) {
            self.execute(
                db_no,
                "create table GLOBALSEQNO (TABLENAME char(64) not null primary key, LASTUSEDSEQNO int)",
            );
            self.execute(
                db_no,
                &format!("insert into GLOBALSEQNO values ('*', {})", GLOBAL_SEQNO_START),
            );
        }

        /// Create `LOCALSEQNO` up front, as a deployed entry would have it.
        pub fn create_local_seqno_table(&self, db_no: DbNo) {
            self.execute(
                db_no,
                "create table LOCALSEQNO (TABLENAME char(64) not null primary key, LASTUSEDSEQNO int)",
            );
            self.execute(db_no, "insert into LOCALSEQNO values ('*', 0)");
        }

        pub fn insert_validity(&self, db_no: DbNo, table: &str, seed: &ValiditySeed) {
            self.execute(db_no, &seed.insert_sql(table));
        }

        /// Insert one validity record and its gain rows.
        pub fn seed_gains(&self, db_no: DbNo, table: &str, seed: &ValiditySeed, gains: &[(u32, f64)]) {
            self.insert_validity(db_no, table, seed);
            for (i, (channel, gain)) in gains.iter().enumerate() {
                self.execute(
                    db_no,
                    &format!(
                        "insert into {} values ({}, {}, {}, {})",
                        table,
                        seed.seq_no,
                        i + 1,
                        channel,
                        gain
                    ),
                );
            }
        }

        pub fn cascade_config(&self) -> CascadeConfig {
            CascadeConfig::new(
                self.urls
                    .iter()
                    .map(|u| BackendDescriptor::new(u.clone(), "", ""))
                    .collect(),
            )
            .with_max_connection_attempts(1)
            .with_retry_delay(Duration::ZERO)
        }

        pub fn cascade(&self) -> Cascade {
            Cascade::new(&self.cascade_config(), Arc::new(SqliteFactory)).expect("scratch cascade")
        }

        pub fn dbi_config(&self) -> DbiConfig {
            DbiConfig::default().with_max_connection_attempts(1)
        }
    }

    /// MCaptain data context at `ts`.
    pub fn data_context(ts: &str) -> ValidityContext {
        ValidityContext::new(
            Detector::MCaptain,
            SimFlag::Data,
            parse_datetime(ts).expect("fixture timestamp"),
        )
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for condb value types.

    use super::*;
    use proptest::prelude::*;

    /// Timestamps between 2015 and 2030, whole seconds.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_420_070_400i64..1_893_456_000i64).prop_map(condb_core::timestamp_from_secs)
    }

    pub fn arb_detector() -> impl Strategy<Value = Detector> {
        prop::sample::select(Detector::ALL.to_vec())
    }

    pub fn arb_sim_flag() -> impl Strategy<Value = SimFlag> {
        prop::sample::select(SimFlag::ALL.to_vec())
    }

    pub fn arb_context() -> impl Strategy<Value = ValidityContext> {
        (arb_detector(), arb_sim_flag(), arb_timestamp())
            .prop_map(|(det, sim, ts)| ValidityContext::new(det, sim, ts))
    }

    /// A range with a non-empty window of up to a year.
    pub fn arb_validity_range() -> impl Strategy<Value = ValidityRange> {
        (
            1u32..4,
            1u32..16,
            arb_timestamp(),
            1i64..31_536_000,
        )
            .prop_map(|(det, sim, start, len)| {
                ValidityRange::new(
                    DetectorMask::from_bits_truncate(det),
                    SimMask::from_bits_truncate(sim),
                    start,
                    start + chrono::Duration::seconds(len),
                    DATABASE_SOURCE,
                )
            })
    }

    pub fn arb_validity_record() -> impl Strategy<Value = ValidityRecord> {
        (
            1u32..1_000_000,
            -1i32..4,
            arb_validity_range(),
            0i32..3,
            arb_timestamp(),
            0i32..3,
        )
            .prop_map(|(seq, agg, range, task, created, epoch)| {
                ValidityRecord::new(seq, agg, range, task, created, created, epoch, 0)
            })
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on validity records.

    use super::*;

    /// Assert the record's window is exactly `[start, end)`.
    #[track_caller]
    pub fn assert_window(vrec: &ValidityRecord, start: &str, end: &str) {
        let start = parse_datetime(start).expect("start timestamp");
        let end = parse_datetime(end).expect("end timestamp");
        assert_eq!(
            (vrec.time_start(), vrec.time_end()),
            (start, end),
            "Unexpected window for {}",
            vrec
        );
    }

    #[track_caller]
    pub fn assert_gap(vrec: &ValidityRecord) {
        assert!(vrec.is_gap, "Expected a gap, got {}", vrec);
        assert_eq!(vrec.seq_no, 0, "Gap with a SEQNO: {}", vrec);
    }

    /// Assert the record contains `ts` in its half-open window.
    #[track_caller]
    pub fn assert_covers(vrec: &ValidityRecord, ts: &Timestamp) {
        assert!(
            vrec.time_start() <= *ts && *ts < vrec.time_end(),
            "{} does not cover {}",
            vrec,
            condb_core::format_datetime(ts)
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_scratch_db_seeds_a_cascade() {
        let db = ScratchDb::new(2);
        db.create_table(0, "CALIB", GAIN_COLUMNS);
        db.make_authorizing(1);
        db.seed_gains(
            0,
            "CALIB",
            &ValiditySeed::new(1, "2020-01-01 00:00:00", "2021-01-01 00:00:00"),
            &[(1, 0.5)],
        );

        let mut cascade = db.cascade();
        assert_eq!(cascade.num_db(), 2);
        assert_eq!(cascade.authorizing_db(), Some(1));
        assert_eq!(cascade.table_db_no("CALIBVLD", None), Some(0));

        let mut stmt = cascade.create_statement(0).unwrap();
        let set = stmt.execute_query("select * from CALIB").unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_flaky_factory_refuses_then_opens() {
        let db = ScratchDb::new(1);
        let factory = FlakyFactory::new(1);
        let desc = BackendDescriptor::new(db.url(0), "", "");
        assert!(factory.open(&desc).is_err());
        assert!(factory.open(&desc).is_ok());
        assert_eq!(factory.opens(), 2);
    }

    #[test]
    fn test_seed_sql_column_order() {
        let sql = ValiditySeed::new(7, "2020-01-01", "2020-02-01")
            .with_aggregate(3)
            .with_task(2)
            .insert_sql("CALIB");
        assert_eq!(
            sql,
            "insert into CALIBVLD values (7, '2020-01-01', '2020-02-01', 0, 0, 1, 1, 2, 3, '2020-01-01', '2020-01-01')"
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_ranges_are_non_empty(range in generators::arb_validity_range()) {
            prop_assert!(range.time_start < range.time_end);
        }

        #[test]
        fn prop_generated_records_are_not_gaps(vrec in generators::arb_validity_record()) {
            prop_assert!(!vrec.is_gap);
            prop_assert!(vrec.seq_no > 0);
        }
    }
}
