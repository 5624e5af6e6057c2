//! Validity resolution.
//!
//! A [`ValidityResolver`] runs the validity query of one table for one
//! context and folds the rows, visited in priority order, into one effective
//! [`ValidityRecord`] per aggregate. Slot 0 always holds aggregate -1. An
//! aggregate without covering data keeps a gap record, so that the absence
//! of data is cached like any other answer.

use crate::accessor::QueryServices;
use crate::proxy::DbProxy;
use condb_core::{
    time_floor, AggregateNo, Detector, DetectorMask, SeqNo, SimFlag, SimMask, Task, Timestamp,
    ValidityContext, ValidityRecord, NON_AGGREGATED,
};
use std::collections::BTreeMap;

/// Windows shorter than this are reported as suspicious.
const MIN_SANE_WINDOW_SECS: i64 = 5;

#[derive(Debug, Clone)]
pub struct ValidityResolver {
    vrecs: Vec<ValidityRecord>,
    agg_index: BTreeMap<AggregateNo, usize>,
    gap: ValidityRecord,
    is_extended: bool,
    task: Task,
}

/// Bookkeeping of one fold, used to tune the time gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub num_rows: usize,
    pub sum_windows_secs: i64,
    pub found_data: bool,
    /// Slot of the lowest-priority record used, `None` for the gap.
    pub lowest: Option<usize>,
}

impl ValidityResolver {
    fn with_gap(gap: ValidityRecord, task: Task, is_extended: bool) -> Self {
        let mut resolver = Self {
            vrecs: Vec::new(),
            agg_index: BTreeMap::new(),
            gap,
            is_extended,
            task,
        };
        resolver.add_new_gap(NON_AGGREGATED);
        resolver
    }

    /// Resolve a standard context query.
    ///
    /// Cascade entries are tried in priority order (only `select_db` when
    /// given) and within each entry the sim flags associated with the
    /// context's, stopping at the first query that yields data. With
    /// `find_full_time_window` the windows are opened up beyond the time gate
    /// to the nearest boundary of a competing record.
    pub fn standard(
        proxy: &DbProxy,
        services: &mut QueryServices<'_>,
        context: &ValidityContext,
        task: Task,
        select_db: Option<usize>,
        find_full_time_window: bool,
    ) -> Self {
        let table = proxy.table_name();
        let gate_secs = services.time_gates.get(table);
        let gap = ValidityRecord::gap(context, task, gate_secs, find_full_time_window);
        let mut resolver = Self::with_gap(gap, task, false);

        let sim = context.sim;
        let mut sim_try = sim;
        let mut num_rows = 0;
        let mut sum_windows_secs = 0;

        if !proxy.table_exists(services.cascade, None) {
            tracing::warn!(table, "Query for table, table does not exist!");
        } else {
            let resolve_by_creation_date = !proxy.has_epoch();
            let mut found_data = false;

            for db_no in 0..services.cascade.num_db() {
                if found_data {
                    break;
                }
                if !proxy.table_exists(services.cascade, Some(db_no)) {
                    continue;
                }
                if select_db.is_some_and(|s| s != db_no) {
                    continue;
                }

                for candidate in services.associations.get(sim) {
                    if found_data {
                        break;
                    }
                    sim_try = candidate;
                    let context_try = context.with_sim(sim_try);
                    let rows =
                        proxy.query_validity(services.cascade, &context_try, task, db_no, gate_secs);
                    let stats = resolver.fold_rows(
                        &context.timestamp,
                        &rows,
                        db_no,
                        resolve_by_creation_date,
                        table,
                    );
                    found_data = stats.found_data;
                    num_rows += stats.num_rows;
                    sum_windows_secs += stats.sum_windows_secs;

                    if find_full_time_window {
                        let lowest = stats
                            .lowest
                            .and_then(|i| resolver.vrecs.get(i))
                            .unwrap_or(&resolver.gap)
                            .clone();
                        let (start, end) = proxy.find_time_boundaries(
                            services.cascade,
                            &context_try,
                            task,
                            db_no,
                            gate_secs,
                            &lowest,
                            resolve_by_creation_date,
                        );
                        tracing::debug!(table, "Trimming validity records to time boundaries");
                        resolver.and_time_window(start, end);
                    }
                }
            }
        }

        if sim != sim_try {
            tracing::info!(
                table,
                requested = %sim,
                matched = %sim_try,
                "Imposing requested SimFlag on records matched with an associated one"
            );
            resolver.impose_sim_mask(sim.mask());
        }

        tracing::debug!(
            table,
            context = %context,
            sim_used = %sim_try,
            num_rows,
            num_aggregates = resolver.vrecs.len(),
            "Resolved validity"
        );

        if let Some(gate) =
            services
                .time_gates
                .adapt(table, resolver.vrecs.len(), sum_windows_secs, num_rows)
        {
            tracing::debug!(table, gate, "Adapted time gate");
        }
        resolver
    }

    /// Resolve an extended (raw SQL) context.
    ///
    /// Rows are kept as found, in arrival order after the gap slot; the
    /// first cascade entry with any rows wins.
    pub fn extended(
        proxy: &DbProxy,
        services: &mut QueryServices<'_>,
        context_sql: &str,
        task: Task,
    ) -> Self {
        let table = proxy.table_name();
        let context = ValidityContext::new(Detector::Unknown, SimFlag::Unknown, time_floor());
        let gap = ValidityRecord::gap(&context, task, 0, true);
        let mut resolver = Self::with_gap(gap, task, true);

        if !proxy.table_exists(services.cascade, None) {
            tracing::warn!(table, "Query for table, table does not exist!");
        } else if context_sql.is_empty() {
            tracing::warn!(table, "Null extended query for table");
        } else {
            for db_no in 0..services.cascade.num_db() {
                let rows = proxy.query_validity_sql(services.cascade, context_sql, task, db_no);
                if rows.is_empty() {
                    continue;
                }
                for mut vrec in rows {
                    vrec.db_no = db_no;
                    // Aggregate numbers may repeat here, the last one wins.
                    resolver.agg_index.insert(vrec.aggregate_no, resolver.vrecs.len());
                    resolver.vrecs.push(vrec);
                }
                break;
            }
        }
        tracing::debug!(
            table,
            context = context_sql,
            num_records = resolver.vrecs.len(),
            "Resolved extended validity"
        );
        resolver
    }

    /// Resolver holding a single known record, used to rebuild a result
    /// from a validity record.
    pub fn from_record(vrec: &ValidityRecord, time_gate_secs: i64) -> Self {
        let context = ValidityContext::new(
            detector_of(vrec.range.detector_mask),
            sim_of(vrec.range.sim_mask),
            vrec.time_start(),
        );
        let gap = ValidityRecord::gap(&context, vrec.task, time_gate_secs, false);
        let mut resolver = Self {
            vrecs: Vec::new(),
            agg_index: BTreeMap::new(),
            gap,
            is_extended: false,
            task: vrec.task,
        };
        resolver.add_new_agg(vrec.clone(), vrec.aggregate_no);
        resolver
    }

    // ========================================================================
    // FOLDING
    // ========================================================================

    /// Fold validity rows, highest priority first, into the slots.
    pub fn fold_rows(
        &mut self,
        query_time: &Timestamp,
        rows: &[ValidityRecord],
        db_no: usize,
        resolve_by_creation_date: bool,
        table: &str,
    ) -> FoldStats {
        let mut stats = FoldStats::default();
        for row in rows {
            let index = match self.index_of_aggregate(row.aggregate_no) {
                Some(index) => index,
                None => self.add_new_gap(row.aggregate_no),
            };

            let cur = &mut self.vrecs[index];
            cur.trim(query_time, row);
            if !cur.is_gap {
                stats.found_data = true;
                cur.db_no = db_no;
            }

            let replace_lowest = match stats.lowest.and_then(|i| self.vrecs.get(i)) {
                None => true,
                Some(lowest) if lowest.is_gap => true,
                Some(lowest) => lowest.is_higher_priority(&self.vrecs[index], resolve_by_creation_date),
            };
            if replace_lowest {
                stats.lowest = Some(index);
            }

            let window = row.time_end().timestamp() - row.time_start().timestamp();
            if window < MIN_SANE_WINDOW_SECS {
                tracing::warn!(table, vrec = %row, "Detected suspiciously small validity time interval");
            }
            stats.sum_windows_secs = stats.sum_windows_secs.saturating_add(window);
            stats.num_rows += 1;
        }
        stats
    }

    fn and_time_window(&mut self, start: Timestamp, end: Timestamp) {
        for vrec in &mut self.vrecs {
            vrec.and_time_window(start, end);
        }
        self.gap.and_time_window(start, end);
    }

    fn impose_sim_mask(&mut self, mask: SimMask) {
        for vrec in &mut self.vrecs {
            vrec.range.sim_mask = mask;
        }
    }

    fn add_new_agg(&mut self, vrec: ValidityRecord, aggregate_no: AggregateNo) -> usize {
        if let Some(index) = self.index_of_aggregate(aggregate_no) {
            return index;
        }
        let index = self.vrecs.len();
        self.vrecs.push(vrec);
        self.agg_index.insert(aggregate_no, index);
        index
    }

    fn add_new_gap(&mut self, aggregate_no: AggregateNo) -> usize {
        let index = self.add_new_agg(self.gap.clone(), aggregate_no);
        self.vrecs[index].aggregate_no = aggregate_no;
        index
    }

    // ========================================================================
    // LOOKUPS
    // ========================================================================

    pub fn num_validity_records(&self) -> usize {
        self.vrecs.len()
    }

    pub fn validity_records(&self) -> &[ValidityRecord] {
        &self.vrecs
    }

    /// Record in slot `index`, or the gap when out of range.
    pub fn validity_record(&self, index: usize) -> &ValidityRecord {
        self.vrecs.get(index).unwrap_or(&self.gap)
    }

    /// Record with `seq_no`, or the gap when there is none.
    pub fn validity_record_from_seqno(&self, seq_no: SeqNo) -> &ValidityRecord {
        self.vrecs
            .iter()
            .find(|v| v.seq_no == seq_no)
            .unwrap_or(&self.gap)
    }

    pub fn index_of_aggregate(&self, aggregate_no: AggregateNo) -> Option<usize> {
        self.agg_index.get(&aggregate_no).copied()
    }

    pub fn gap(&self) -> &ValidityRecord {
        &self.gap
    }

    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    /// True for a plain non-aggregated answer: one slot, aggregate -1.
    pub fn is_non_aggregated(&self) -> bool {
        !self.is_extended
            && self.vrecs.len() == 1
            && self.vrecs[0].aggregate_no == NON_AGGREGATED
    }

    pub fn task(&self) -> Task {
        self.task
    }

    /// SEQNOs of every non-gap slot past the first, in slot order.
    pub fn data_seq_nos(&self) -> Vec<SeqNo> {
        self.vrecs
            .iter()
            .skip(1)
            .filter(|v| !v.is_gap)
            .map(|v| v.seq_no)
            .collect()
    }

    /// Name under which the result of this query is saved in the L2 cache.
    ///
    /// Empty for extended queries and when every slot is a gap.
    pub fn l2_cache_name(&self) -> String {
        if self.is_extended {
            return String::new();
        }
        let mut data = self.vrecs.iter().filter(|v| !v.is_gap);
        let Some(first) = data.next() else {
            return String::new();
        };
        let (mut seq_lo, mut seq_hi, mut ts) = (first.seq_no, first.seq_no, first.creation_date);
        for vrec in data {
            seq_lo = seq_lo.min(vrec.seq_no);
            seq_hi = seq_hi.max(vrec.seq_no);
            ts = ts.max(vrec.creation_date);
        }
        ValidityRecord::l2_cache_name_for(seq_lo, seq_hi, &ts)
    }
}

pub(crate) fn detector_of(mask: DetectorMask) -> Detector {
    Detector::ALL
        .into_iter()
        .find(|d| mask.contains(d.mask()))
        .unwrap_or(Detector::Unknown)
}

pub(crate) fn sim_of(mask: SimMask) -> SimFlag {
    SimFlag::ALL
        .into_iter()
        .find(|s| mask.contains(s.mask()))
        .unwrap_or(SimFlag::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use condb_core::{parse_datetime, ValidityRange, DATABASE_SOURCE};

    const DAY: i64 = 86_400;

    fn ts(text: &str) -> Timestamp {
        parse_datetime(text).unwrap()
    }

    fn make_test_context(date: &str) -> ValidityContext {
        ValidityContext::new(Detector::MCaptain, SimFlag::Data, ts(date))
    }

    fn make_test_vrec(seq: SeqNo, agg: AggregateNo, start: &str, end: &str, created: &str) -> ValidityRecord {
        let range = ValidityRange::new(
            DetectorMask::MCAPTAIN,
            SimMask::DATA,
            ts(start),
            ts(end),
            DATABASE_SOURCE,
        );
        ValidityRecord::new(seq, agg, range, 0, ts(created), ts(created), 0, 0)
    }

    fn make_test_resolver(date: &str, full: bool) -> ValidityResolver {
        let gap = ValidityRecord::gap(&make_test_context(date), 0, 10 * DAY, full);
        ValidityResolver::with_gap(gap, 0, false)
    }

    #[test]
    fn test_overlap_resolved_by_priority() {
        let a = make_test_vrec(1, -1, "2020-01-01 00:00:00", "2020-06-01 00:00:00", "2019-12-01 00:00:00");
        let b = make_test_vrec(2, -1, "2020-03-01 00:00:00", "2020-09-01 00:00:00", "2020-01-01 00:00:00");
        let rows = vec![b.clone(), a.clone()];

        let mut april = make_test_resolver("2020-04-01 00:00:00", true);
        let stats = april.fold_rows(&ts("2020-04-01 00:00:00"), &rows, 0, true, "CALIB");
        assert!(stats.found_data);
        assert_eq!(stats.num_rows, 2);
        let vrec = april.validity_record(0);
        assert_eq!(vrec.seq_no, 2);
        assert_eq!(vrec.time_start(), ts("2020-03-01 00:00:00"));
        assert_eq!(vrec.time_end(), ts("2020-09-01 00:00:00"));

        let mut february = make_test_resolver("2020-02-01 00:00:00", true);
        february.fold_rows(&ts("2020-02-01 00:00:00"), &rows, 0, true, "CALIB");
        let vrec = february.validity_record(0);
        assert_eq!(vrec.seq_no, 1);
        assert_eq!(vrec.time_start(), ts("2020-01-01 00:00:00"));
        assert_eq!(vrec.time_end(), ts("2020-03-01 00:00:00"));
    }

    #[test]
    fn test_gate_bounds_windows() {
        let a = make_test_vrec(1, -1, "2020-01-01 00:00:00", "2020-06-01 00:00:00", "2019-12-01 00:00:00");
        let mut resolver = make_test_resolver("2020-04-01 00:00:00", false);
        resolver.fold_rows(&ts("2020-04-01 00:00:00"), &[a], 3, true, "CALIB");
        let vrec = resolver.validity_record(0);
        assert_eq!(vrec.db_no, 3);
        assert_eq!(vrec.time_start(), ts("2020-03-22 00:00:00"));
        assert_eq!(vrec.time_end(), ts("2020-04-11 00:00:00"));
    }

    #[test]
    fn test_aggregates_get_their_own_slots() {
        let rows = vec![
            make_test_vrec(5, 1, "2020-01-01 00:00:00", "2020-02-01 00:00:00", "2020-01-01 00:00:00"),
            make_test_vrec(4, 0, "2020-01-01 00:00:00", "2020-12-01 00:00:00", "2020-01-01 00:00:00"),
        ];
        let mut resolver = make_test_resolver("2020-04-01 00:00:00", false);
        resolver.fold_rows(&ts("2020-04-01 00:00:00"), &rows, 0, true, "CALIB");

        assert_eq!(resolver.num_validity_records(), 3);
        assert!(resolver.validity_record(0).is_gap);
        assert_eq!(resolver.validity_record(0).aggregate_no, -1);
        // Aggregate 1 ended before the query time: still a gap, trimmed.
        let agg1 = resolver.validity_record(resolver.index_of_aggregate(1).unwrap());
        assert!(agg1.is_gap);
        assert_eq!(agg1.aggregate_no, 1);
        let agg0 = resolver.validity_record(resolver.index_of_aggregate(0).unwrap());
        assert_eq!(agg0.seq_no, 4);
        assert!(!resolver.is_non_aggregated());
        assert_eq!(resolver.data_seq_nos(), vec![4]);

        assert!(resolver.validity_record(99).is_gap);
        assert!(resolver.validity_record_from_seqno(77).is_gap);
        assert_eq!(resolver.validity_record_from_seqno(4).aggregate_no, 0);
    }

    #[test]
    fn test_no_rows_leaves_gap_at_full_gate() {
        let mut resolver = make_test_resolver("2020-04-01 00:00:00", false);
        let stats = resolver.fold_rows(&ts("2020-04-01 00:00:00"), &[], 0, true, "CALIB");
        assert!(!stats.found_data);
        assert!(resolver.is_non_aggregated());
        let gap = resolver.validity_record(0);
        assert!(gap.is_gap);
        assert_eq!(gap.time_end().timestamp() - gap.time_start().timestamp(), 20 * DAY);
        assert_eq!(resolver.l2_cache_name(), "");
    }

    #[test]
    fn test_l2_cache_name_spans_seqnos() {
        let rows = vec![
            make_test_vrec(7, 0, "2020-01-01 00:00:00", "2020-12-01 00:00:00", "2020-01-05 00:00:00"),
            make_test_vrec(3, 1, "2020-01-01 00:00:00", "2020-12-01 00:00:00", "2020-01-09 00:00:00"),
        ];
        let mut resolver = make_test_resolver("2020-04-01 00:00:00", false);
        resolver.fold_rows(&ts("2020-04-01 00:00:00"), &rows, 0, true, "CALIB");
        assert_eq!(resolver.l2_cache_name(), "3_7_2020-01-09_00:00:00");
    }

    #[test]
    fn test_from_record() {
        let vrec = make_test_vrec(9, 2, "2020-01-01 00:00:00", "2020-12-01 00:00:00", "2020-01-01 00:00:00");
        let resolver = ValidityResolver::from_record(&vrec, DAY);
        assert_eq!(resolver.num_validity_records(), 1);
        assert_eq!(resolver.index_of_aggregate(2), Some(0));
        assert_eq!(resolver.validity_record(0).seq_no, 9);
        assert_eq!(resolver.gap().time_start(), ts("2019-12-31 00:00:00"));
        assert_eq!(resolver.l2_cache_name(), "9_2020-01-01_00:00:00");
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_rows() -> impl Strategy<Value = Vec<ValidityRecord>> {
            prop::collection::vec((0i64..400, 1i64..200, 0i64..1000, -1i32..2), 0..12).prop_map(
                |specs| {
                    let base = ts("2020-01-01 00:00:00").timestamp();
                    let mut rows: Vec<ValidityRecord> = specs
                        .into_iter()
                        .enumerate()
                        .map(|(i, (start, len, created, agg))| {
                            let range = ValidityRange::new(
                                DetectorMask::MCAPTAIN,
                                SimMask::DATA,
                                condb_core::timestamp_from_secs(base + start * DAY),
                                condb_core::timestamp_from_secs(base + (start + len) * DAY),
                                DATABASE_SOURCE,
                            );
                            let created = condb_core::timestamp_from_secs(base + created * 60);
                            ValidityRecord::new(i as SeqNo + 1, agg, range, 0, created, created, 0, 0)
                        })
                        .collect();
                    rows.sort_by(|a, b| b.creation_date.cmp(&a.creation_date));
                    rows
                },
            )
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(200))]

            #[test]
            fn prop_trimming_is_idempotent(rows in arb_rows(), day in 0i64..400) {
                let date = condb_core::timestamp_from_secs(ts("2020-01-01 00:00:00").timestamp() + day * DAY);
                let context = ValidityContext::new(Detector::MCaptain, SimFlag::Data, date);
                let gap = ValidityRecord::gap(&context, 0, 10 * DAY, false);

                let mut first = ValidityResolver::with_gap(gap.clone(), 0, false);
                first.fold_rows(&date, &rows, 0, true, "CALIB");

                let trimmed: Vec<ValidityRecord> =
                    first.validity_records().iter().filter(|v| !v.is_gap).cloned().collect();
                let mut second = ValidityResolver::with_gap(gap, 0, false);
                second.fold_rows(&date, &trimmed, 0, true, "CALIB");

                for vrec in &trimmed {
                    let again = second.validity_record(second.index_of_aggregate(vrec.aggregate_no).unwrap());
                    prop_assert_eq!(again.seq_no, vrec.seq_no);
                    prop_assert_eq!(again.time_start(), vrec.time_start());
                    prop_assert_eq!(again.time_end(), vrec.time_end());
                }
            }

            #[test]
            fn prop_effective_window_contains_query_time(rows in arb_rows(), day in 0i64..400) {
                let date = condb_core::timestamp_from_secs(ts("2020-01-01 00:00:00").timestamp() + day * DAY);
                let context = ValidityContext::new(Detector::MCaptain, SimFlag::Data, date);
                let mut resolver = ValidityResolver::with_gap(
                    ValidityRecord::gap(&context, 0, 10 * DAY, false), 0, false);
                resolver.fold_rows(&date, &rows, 0, true, "CALIB");
                for vrec in resolver.validity_records() {
                    prop_assert!(vrec.time_start() <= date && date < vrec.time_end());
                }
            }
        }
    }
}
