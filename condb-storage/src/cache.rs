//! Per-table result cache.
//!
//! Results are held in pools keyed by aggregate number. Pool -1 holds the
//! answers to whole queries, standard or extended; the other pools hold the
//! components of aggregated results so they can be shared between queries.
//!
//! Pools are FIFO: new results are appended and unwanted ones are purged from
//! anywhere in the pool. A result is only ever dropped once no
//! [`ResultHandle`] refers to it.

use crate::result::{QueryResult, ResultHandle};
use crate::row::TableRow;
use condb_core::{
    AggregateNo, SimFlagAssociation, Task, ValidityContext, ValidityRecord, NON_AGGREGATED,
};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

// ============================================================================
// STATISTICS
// ============================================================================

/// Usage counters of one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Results currently held.
    pub current: usize,
    /// High-water mark of `current`.
    pub max: usize,
    /// Results adopted since creation.
    pub adopted: usize,
    /// Aggregates answered from the cache.
    pub reused: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>10}{:>10}{:>10}{:>10}",
            self.current, self.max, self.adopted, self.reused
        )
    }
}

// ============================================================================
// CACHE
// ============================================================================

pub struct ResultCache<R: TableRow> {
    table_name: String,
    pools: BTreeMap<AggregateNo, Vec<Rc<QueryResult<R>>>>,
    current: usize,
    max: usize,
    adopted: usize,
    reused: Cell<usize>,
}

impl<R: TableRow> ResultCache<R> {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            pools: BTreeMap::new(),
            current: 0,
            max: 0,
            adopted: 0,
            reused: Cell::new(0),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn len(&self) -> usize {
        self.current
    }

    pub fn is_empty(&self) -> bool {
        self.current == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            current: self.current,
            max: self.max,
            adopted: self.adopted,
            reused: self.reused.get(),
        }
    }

    fn hit(&self, result: &Rc<QueryResult<R>>) -> ResultHandle<R> {
        self.reused.set(self.reused.get() + result.num_aggregates());
        tracing::trace!(
            table = %self.table_name,
            rows = result.num_rows(),
            "Cache search succeeded"
        );
        ResultHandle::new(result.clone())
    }

    // ------------------------------------------------------------------------
    // Searches
    // ------------------------------------------------------------------------

    /// Primary search: a result answering `context` and `task`.
    ///
    /// The context is tried as given and then with each sim flag associated
    /// with its own.
    pub fn search(
        &self,
        context: &ValidityContext,
        task: Task,
        associations: &SimFlagAssociation,
    ) -> Option<ResultHandle<R>> {
        let pool = self.pools.get(&NON_AGGREGATED)?;
        for sim in associations.get(context.sim) {
            let context_try = context.with_sim(sim);
            tracing::trace!(table = %self.table_name, context = %context_try, task, "Searching cache");
            if let Some(result) = pool.iter().find(|r| r.satisfies(&context_try, task)) {
                return Some(self.hit(result));
            }
        }
        None
    }

    /// Secondary search: the component holding exactly `vrec`'s data.
    pub fn search_vrec(&self, vrec: &ValidityRecord, sql_qualifiers: &str) -> Option<ResultHandle<R>> {
        let pool = self.pools.get(&vrec.aggregate_no)?;
        pool.iter()
            .find(|r| r.satisfies_vrec(vrec, sql_qualifiers))
            .map(|r| self.hit(r))
    }

    /// Whether `search_vrec` would succeed, without counting a reuse or
    /// touching the matching result.
    pub fn contains_vrec(&self, vrec: &ValidityRecord, sql_qualifiers: &str) -> bool {
        self.pools
            .get(&vrec.aggregate_no)
            .is_some_and(|pool| pool.iter().any(|r| r.holds_vrec(vrec, sql_qualifiers)))
    }

    /// Search for the answer to an extended query.
    pub fn search_qualifiers(&self, sql_qualifiers: &str) -> Option<ResultHandle<R>> {
        let pool = self.pools.get(&NON_AGGREGATED)?;
        pool.iter()
            .find(|r| r.satisfies_qualifiers(sql_qualifiers))
            .map(|r| self.hit(r))
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Take ownership of a new result and hand back the first handle to it.
    ///
    /// The result's pool is purged of entries it supersedes first.
    pub fn adopt(&mut self, result: QueryResult<R>, generate_key: bool) -> ResultHandle<R> {
        let aggregate_no = result.validity_record().aggregate_no;
        let result = Rc::new(result);

        let mut pool = self.pools.remove(&aggregate_no).unwrap_or_default();
        self.purge_pool(&mut pool, Some(&*result));
        pool.push(result.clone());
        self.pools.insert(aggregate_no, pool);

        self.current += 1;
        self.adopted += 1;
        self.max = self.max.max(self.current);
        tracing::debug!(
            table = %self.table_name,
            aggregate_no,
            size = self.current,
            "Adopted result"
        );

        if generate_key {
            result.generate_key();
            if let Some(key) = result.key() {
                tracing::info!(table = %self.table_name, key = %key, "Caching new results");
            }
        }
        ResultHandle::new(result)
    }

    fn purge_pool(&mut self, pool: &mut Vec<Rc<QueryResult<R>>>, newer: Option<&QueryResult<R>>) {
        let before = pool.len();
        pool.retain(|r| {
            let purge = r.num_clients() == 0 && newer.map_or(true, |n| r.can_delete(Some(n)));
            if purge {
                tracing::debug!(table = %self.table_name, vrec = %r.validity_record(), "Purging result");
            }
            !purge
        });
        self.current -= before - pool.len();
    }

    /// Drop every result of pool `aggregate_no` nobody reads. With `newer`,
    /// only those it supersedes or that are stale.
    pub fn purge(&mut self, aggregate_no: AggregateNo, newer: Option<&QueryResult<R>>) {
        if let Some(mut pool) = self.pools.remove(&aggregate_no) {
            self.purge_pool(&mut pool, newer);
            self.pools.insert(aggregate_no, pool);
        }
    }

    /// Purge every pool, pool -1 first since its aggregated results hold
    /// the components in the others.
    pub fn purge_all(&mut self) {
        self.purge(NON_AGGREGATED, None);
        let pools: Vec<AggregateNo> = self.pools.keys().copied().collect();
        for aggregate_no in pools {
            self.purge(aggregate_no, None);
        }
    }

    /// Stop reusing every held result. Results stay alive for their
    /// current readers.
    pub fn set_stale(&mut self) {
        for result in self.pools.values().flatten() {
            result.set_can_reuse(false);
        }
    }

    /// Every held result, pool by pool.
    pub fn results(&self) -> impl Iterator<Item = &QueryResult<R>> {
        self.pools.values().flatten().map(|r| r.as_ref())
    }
}

impl<R: TableRow> Drop for ResultCache<R> {
    fn drop(&mut self) {
        self.purge_all();
        if self.current > 0 {
            tracing::debug!(
                table = %self.table_name,
                remaining = self.current,
                "Cache dropped while results are still read"
            );
        }
    }
}

impl<R: TableRow> fmt::Debug for ResultCache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("table_name", &self.table_name)
            .field("pools", &self.pools.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::SimpleResult;
    use crate::row::RowReader;
    use condb_core::{
        parse_datetime, Detector, DetectorMask, RowError, SimFlag, SimMask, Timestamp,
        ValidityRange, DATABASE_SOURCE,
    };
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pedestal {
        value: i64,
    }

    impl TableRow for Pedestal {
        fn row_name() -> &'static str {
            "Pedestal"
        }

        fn fill(reader: &mut RowReader<'_>, _vrec: Option<&ValidityRecord>) -> Result<Self, RowError> {
            Ok(Self { value: reader.next_i64()? })
        }
    }

    fn ts(text: &str) -> Timestamp {
        parse_datetime(text).unwrap()
    }

    fn make_test_vrec(seq: u32, agg: AggregateNo, sim: SimMask, start: &str, end: &str) -> ValidityRecord {
        let range = ValidityRange::new(DetectorMask::MCAPTAIN, sim, ts(start), ts(end), DATABASE_SOURCE);
        ValidityRecord::new(seq, agg, range, 0, ts("2020-01-01 00:00:00"), ts("2020-01-01 00:00:00"), 0, 0)
    }

    fn make_test_result(seq: u32, agg: AggregateNo, start: &str, end: &str) -> QueryResult<Pedestal> {
        let vrec = make_test_vrec(seq, agg, SimMask::DATA, start, end);
        QueryResult::Simple(SimpleResult::from_rows("PEDESTAL", vec![Pedestal { value: seq as i64 }], vrec, "", true))
    }

    fn make_test_context(sim: SimFlag, date: &str) -> ValidityContext {
        ValidityContext::new(Detector::MCaptain, sim, ts(date))
    }

    #[test]
    fn test_adopt_then_search() {
        let mut cache = ResultCache::new("PEDESTAL");
        let associations = SimFlagAssociation::new();
        let adopted = cache.adopt(make_test_result(1, -1, "2020-01-01 00:00:00", "2020-02-01 00:00:00"), true);
        assert!(adopted.key().is_some());

        let found = cache
            .search(&make_test_context(SimFlag::Data, "2020-01-15 00:00:00"), 0, &associations)
            .unwrap();
        assert!(ResultHandle::ptr_eq(&adopted, &found));
        assert_eq!(found.num_clients(), 2);
        assert!(cache
            .search(&make_test_context(SimFlag::Data, "2020-03-15 00:00:00"), 0, &associations)
            .is_none());
        assert_eq!(cache.stats().reused, 1);
    }

    #[test]
    fn test_search_follows_sim_associations() {
        let mut cache = ResultCache::new("PEDESTAL");
        let _held = cache.adopt(make_test_result(1, -1, "2020-01-01 00:00:00", "2020-02-01 00:00:00"), false);
        let mc = make_test_context(SimFlag::MC, "2020-01-15 00:00:00");

        assert!(cache.search(&mc, 0, &SimFlagAssociation::new()).is_none());

        let mut associations = SimFlagAssociation::new();
        associations.set(SimFlag::MC, vec![SimFlag::MC, SimFlag::Data]);
        assert!(cache.search(&mc, 0, &associations).is_some());
    }

    #[test]
    fn test_search_vrec_uses_aggregate_pool() {
        let mut cache = ResultCache::new("PEDESTAL");
        let _component = cache.adopt(make_test_result(4, 2, "2020-01-01 00:00:00", "2020-02-01 00:00:00"), false);
        let vrec = make_test_vrec(4, 2, SimMask::DATA, "2020-01-10 00:00:00", "2020-01-20 00:00:00");
        assert!(cache.search_vrec(&vrec, "").is_some());
        assert!(cache.search_vrec(&vrec.with_aggregate(3), "").is_none());
        assert!(cache.search_qualifiers("").is_none());
    }

    #[test]
    fn test_contains_vrec_has_no_side_effects() {
        let mut cache = ResultCache::new("PEDESTAL");
        let component = cache.adopt(make_test_result(4, 2, "2020-01-01 00:00:00", "2020-02-01 00:00:00"), false);
        let trimmed = make_test_vrec(4, 2, SimMask::DATA, "2020-01-10 00:00:00", "2020-01-20 00:00:00");

        assert!(cache.contains_vrec(&trimmed, ""));
        assert!(!cache.contains_vrec(&trimmed.with_aggregate(3), ""));
        assert_eq!(cache.stats().reused, 0);
        assert_eq!(component.num_clients(), 1);
        assert_eq!(component.validity_record().time_start(), ts("2020-01-01 00:00:00"));

        assert!(cache.search_vrec(&trimmed, "").is_some());
        assert_eq!(cache.stats().reused, 1);
        assert_eq!(component.validity_record().time_start(), ts("2020-01-10 00:00:00"));
    }

    #[test]
    fn test_adopt_purges_superseded_results() {
        let mut cache = ResultCache::new("PEDESTAL");
        drop(cache.adopt(make_test_result(1, -1, "2020-01-01 00:00:00", "2020-02-01 00:00:00"), false));
        assert_eq!(cache.len(), 1);

        // Disjoint in time: the first result has expired and nobody reads it.
        drop(cache.adopt(make_test_result(2, -1, "2020-02-01 00:00:00", "2020-03-01 00:00:00"), false));
        assert_eq!(cache.len(), 1);

        // Overlapping: both stay.
        drop(cache.adopt(make_test_result(3, -1, "2020-02-15 00:00:00", "2020-04-01 00:00:00"), false));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats(), CacheStats { current: 2, max: 2, adopted: 3, reused: 0 });
    }

    #[test]
    fn test_set_stale_keeps_readers() {
        let mut cache = ResultCache::new("PEDESTAL");
        let associations = SimFlagAssociation::new();
        let held = cache.adopt(make_test_result(1, -1, "2020-01-01 00:00:00", "2020-02-01 00:00:00"), false);
        cache.set_stale();

        let context = make_test_context(SimFlag::Data, "2020-01-15 00:00:00");
        assert!(cache.search(&context, 0, &associations).is_none());

        cache.purge_all();
        assert_eq!(cache.len(), 1);
        assert_eq!(held.row(0).unwrap().value, 1);

        drop(held);
        cache.purge_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stats_display() {
        let stats = CacheStats { current: 1, max: 2, adopted: 3, reused: 4 };
        assert_eq!(stats.to_string(), "         1         2         3         4");
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Adopt(u8),
            Release(usize),
            Purge,
            Stale,
        }

        fn arb_op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..6).prop_map(Op::Adopt),
                (0usize..8).prop_map(Op::Release),
                Just(Op::Purge),
                Just(Op::Stale),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            #[test]
            fn prop_purge_never_drops_read_results(ops in prop::collection::vec(arb_op(), 1..40)) {
                let mut cache = ResultCache::new("PEDESTAL");
                let mut handles: Vec<ResultHandle<Pedestal>> = Vec::new();
                let mut seq = 0;
                for op in ops {
                    match op {
                        Op::Adopt(month) => {
                            seq += 1;
                            let start = format!("2020-{:02}-01 00:00:00", month + 1);
                            let end = format!("2020-{:02}-01 00:00:00", month + 2);
                            handles.push(cache.adopt(make_test_result(seq, -1, &start, &end), false));
                        }
                        Op::Release(i) => {
                            if i < handles.len() {
                                drop(handles.remove(i));
                            }
                        }
                        Op::Purge => cache.purge_all(),
                        Op::Stale => cache.set_stale(),
                    }
                    for handle in &handles {
                        prop_assert!(cache.results().any(|r| r.id() == handle.id()));
                    }
                    prop_assert!(cache.len() >= handles.len());
                    prop_assert!(cache.stats().max >= cache.len());
                }
            }
        }
    }
}
