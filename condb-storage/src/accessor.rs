//! Table accessors.
//!
//! A [`TableAccessor`] answers every query on one table for one row type.
//! Each query is first put to the table's [`ResultCache`]; only on a miss
//! are the validity records resolved and the data fetched, after which the
//! new result is adopted by the cache (and, if enabled, saved to the L2
//! cache). Queries never fail: the worst answer is an empty result.

use crate::backend::SqlValue;
use crate::cache::{CacheStats, ResultCache};
use crate::cascade::Cascade;
use crate::l2::L2Cache;
use crate::proxy::DbProxy;
use crate::resolver::{detector_of, sim_of, ValidityResolver};
use crate::result::{AggregatedResult, QueryResult, ResultHandle, SimplePayload, SimpleResult};
use crate::row::TableRow;
use condb_core::{
    time_floor, DbNo, Detector, SeqNo, SimFlag, SimFlagAssociation, Task, TimeGates, Timestamp,
    ValidityContext, ValidityRecord, ANY_TASK,
};
use chrono::Duration;
use std::collections::HashMap;
use std::rc::Rc;

/// Shared state a query needs besides the accessor itself.
pub struct QueryServices<'a> {
    pub cascade: &'a mut Cascade,
    pub time_gates: &'a mut TimeGates,
    pub associations: &'a SimFlagAssociation,
    pub l2: Option<&'a L2Cache>,
}

impl QueryServices<'_> {
    /// Run `f` with every cascade connection held open.
    pub fn with_connections_held<T>(&mut self, f: impl FnOnce(&mut QueryServices<'_>) -> T) -> T {
        let mut maintainer = self.cascade.maintain_connections();
        let mut held = QueryServices {
            cascade: &mut *maintainer,
            time_gates: &mut *self.time_gates,
            associations: self.associations,
            l2: self.l2,
        };
        f(&mut held)
    }
}

/// `"{context}[ and  Task = t];{data};{fill}"`, the cache key of an
/// extended query.
pub fn sql_qualifiers(context_sql: &str, task: Task, data_sql: &str, fill_options: &str) -> String {
    let mut qualifiers = context_sql.to_string();
    if task != ANY_TASK {
        qualifiers.push_str(&format!(" and  Task = {}", task));
    }
    format!("{};{};{}", qualifiers, data_sql, fill_options)
}

pub struct TableAccessor<R: TableRow> {
    proxy: DbProxy,
    cache: ResultCache<R>,
}

impl<R: TableRow> TableAccessor<R> {
    pub fn new(table_name: &str, order_context_query: bool) -> Self {
        let proxy = DbProxy::new(table_name, order_context_query);
        let cache = ResultCache::new(proxy.table_name());
        Self { proxy, cache }
    }

    pub fn table_name(&self) -> &str {
        self.proxy.table_name()
    }

    pub fn row_name(&self) -> &'static str {
        R::row_name()
    }

    pub fn proxy(&self) -> &DbProxy {
        &self.proxy
    }

    pub fn cache(&self) -> &ResultCache<R> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ResultCache<R> {
        &mut self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn table_exists(&self, cascade: &Cascade) -> bool {
        self.proxy.table_exists(cascade, None)
    }

    /// Condition applied to every validity query; changing it retires the
    /// cached results.
    pub fn set_sql_condition(&mut self, sql: &str) {
        if self.proxy.sql_condition() != sql {
            self.proxy.set_sql_condition(sql);
            self.cache.set_stale();
        }
    }

    pub fn refresh_meta_data(&mut self, cascade: &mut Cascade) {
        self.proxy.refresh_meta_data(cascade);
    }

    pub fn purge(&mut self) {
        self.cache.purge_all();
    }

    pub fn set_stale(&mut self) {
        self.cache.set_stale();
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Answer a standard context query.
    ///
    /// With `find_full_time_window` the result's window is widened to the
    /// true extent of its validity rather than the time gate.
    pub fn query(
        &mut self,
        services: &mut QueryServices<'_>,
        context: &ValidityContext,
        task: Task,
        find_full_time_window: bool,
    ) -> ResultHandle<R> {
        if let Some(hit) = self.cache.search(context, task, services.associations) {
            return hit;
        }
        services.with_connections_held(|services| {
            let start = services.cascade.exception_log().len();
            let resolver =
                ValidityResolver::standard(&self.proxy, services, context, task, None, find_full_time_window);

            if resolver.is_non_aggregated() {
                let vrec = resolver.validity_record(0).clone();
                let handle = self.fetch_vrec(services, &vrec, true);
                handle.capture_exception_log(services.cascade.exception_log(), start);
                return handle;
            }

            if services.l2.is_some_and(L2Cache::can_read) && R::can_l2_cache() {
                self.restore_if_worthwhile(services, &resolver);
            }

            let components: Vec<ResultHandle<R>> = (1..resolver.num_validity_records())
                .map(|slot| {
                    let vrec = resolver.validity_record(slot);
                    if vrec.is_gap {
                        return self.fetch_component(services, vrec);
                    }
                    match self.cache.search_vrec(vrec, "") {
                        Some(hit) => hit,
                        None => self.fetch_component(services, vrec),
                    }
                })
                .collect();

            let global = resolver.validity_record(0).clone();
            let result = QueryResult::Aggregated(AggregatedResult::new(
                self.proxy.table_name(),
                components,
                global,
                "",
            ));
            result.capture_exception_log(services.cascade.exception_log(), start);
            let handle = self.cache.adopt(result, true);
            self.save_to_l2(services, &resolver.l2_cache_name(), &handle);
            handle
        })
    }

    /// Answer an extended query: `context_sql` selects validity rows
    /// directly, `data_sql` further restricts the data rows and
    /// `fill_options` is handed to the row type.
    ///
    /// Extended results are never saved to the L2 cache.
    pub fn query_extended(
        &mut self,
        services: &mut QueryServices<'_>,
        context_sql: &str,
        task: Task,
        data_sql: &str,
        fill_options: &str,
    ) -> ResultHandle<R> {
        let qualifiers = sql_qualifiers(context_sql, task, data_sql, fill_options);
        tracing::debug!(table = %self.proxy.table_name(), qualifiers = %qualifiers, "Extended query");
        if let Some(hit) = self.cache.search_qualifiers(&qualifiers) {
            return hit;
        }
        services.with_connections_held(|services| {
            let start = services.cascade.exception_log().len();
            let resolver = ValidityResolver::extended(&self.proxy, services, context_sql, task);
            let table = self.proxy.table_name();

            let vrecs = &resolver.validity_records()[1..];
            let mut components = Vec::with_capacity(vrecs.len());
            if let Some(db_no) = vrecs.first().map(|v| v.db_no) {
                let seq_nos: Vec<SeqNo> = vrecs.iter().map(|v| v.seq_no).collect();
                let set = self.proxy.query_seqnos(services.cascade, &seq_nos, db_no, data_sql);

                let mut by_seqno: HashMap<SeqNo, Vec<&[SqlValue]>> = HashMap::new();
                let mut columns: &[String] = &[];
                if let Some(set) = set.as_ref() {
                    columns = set.columns();
                    let seq_col = set.column_index("SEQNO");
                    for row in set.rows() {
                        let seq_no = seq_col
                            .and_then(|c| row.get(c))
                            .and_then(|v| v.as_i64())
                            .and_then(|v| SeqNo::try_from(v).ok());
                        if let Some(seq_no) = seq_no {
                            by_seqno.entry(seq_no).or_default().push(row.as_slice());
                        }
                    }
                }

                // Components belong to this result alone: they carry its
                // qualifiers and must not answer searches on their own.
                for vrec in vrecs {
                    let rows = by_seqno.get(&vrec.seq_no).map(Vec::as_slice).unwrap_or(&[]);
                    let component = SimpleResult::from_data_rows(
                        table,
                        columns,
                        rows,
                        vrec.clone(),
                        &qualifiers,
                        fill_options,
                    );
                    components.push(ResultHandle::new(Rc::new(QueryResult::Simple(component))));
                }
            }

            let result = QueryResult::Aggregated(AggregatedResult::new(
                table,
                components,
                resolver.validity_record(0).clone(),
                &qualifiers,
            ));
            result.capture_exception_log(services.cascade.exception_log(), start);
            self.cache.adopt(result, true)
        })
    }

    /// Answer a query for the data of one SEQNO on entry `db_no`.
    ///
    /// The record's window is not trimmed by its neighbours, so the result
    /// is never reused.
    pub fn query_seqno(&mut self, services: &mut QueryServices<'_>, seq_no: SeqNo, db_no: DbNo) -> ResultHandle<R> {
        services.with_connections_held(|services| {
            let start = services.cascade.exception_log().len();
            match self.proxy.query_validity_seqno(services.cascade, seq_no, db_no) {
                Some(vrec) => {
                    let handle = self.fetch_vrec(services, &vrec, false);
                    handle.capture_exception_log(services.cascade.exception_log(), start);
                    handle
                }
                None => {
                    tracing::debug!(table = %self.proxy.table_name(), seq_no, db_no, "No validity record for SEQNO");
                    let context = ValidityContext::new(Detector::Unknown, SimFlag::Unknown, time_floor());
                    let gap = ValidityRecord::gap(&context, ANY_TASK, 0, true);
                    let result = QueryResult::Simple(SimpleResult::empty(self.proxy.table_name(), gap, ""));
                    result.set_can_reuse(false);
                    result.capture_exception_log(services.cascade.exception_log(), start);
                    self.cache.adopt(result, true)
                }
            }
        })
    }

    /// Answer a query for the data of a known validity record.
    ///
    /// With `can_reuse` the result is cached for later queries and saved to
    /// the L2 cache; otherwise it is handed out stale.
    pub fn query_validity_record(
        &mut self,
        services: &mut QueryServices<'_>,
        vrec: &ValidityRecord,
        can_reuse: bool,
    ) -> ResultHandle<R> {
        services.with_connections_held(|services| {
            let start = services.cascade.exception_log().len();
            let handle = self.fetch_vrec(services, vrec, can_reuse);
            handle.capture_exception_log(services.cascade.exception_log(), start);
            handle
        })
    }

    /// Creation date for a new record `vrec` on entry `db_no` so that it
    /// overlays the data currently in force at its start: one minute after
    /// the creation date of that data, or the record's own start when
    /// nothing is overlaid.
    pub fn query_overlay_creation_date(
        &mut self,
        services: &mut QueryServices<'_>,
        vrec: &ValidityRecord,
        db_no: DbNo,
    ) -> Timestamp {
        let context = ValidityContext::new(
            detector_of(vrec.range.detector_mask),
            sim_of(vrec.range.sim_mask),
            vrec.time_start(),
        );
        services.with_connections_held(|services| {
            let resolver = ValidityResolver::standard(&self.proxy, services, &context, vrec.task, Some(db_no), false);
            let overlaid = resolver
                .index_of_aggregate(vrec.aggregate_no)
                .map(|slot| resolver.validity_record(slot))
                .unwrap_or(resolver.gap());
            let date = if overlaid.is_gap {
                vrec.time_start()
            } else {
                overlaid.creation_date + Duration::seconds(60)
            };
            tracing::debug!(
                table = %self.proxy.table_name(),
                vrec = %vrec,
                overlaid = %overlaid,
                date = %condb_core::format_datetime(&date),
                "Overlay creation date"
            );
            date
        })
    }

    // ========================================================================
    // FETCHING
    // ========================================================================

    fn fetch_vrec(&mut self, services: &mut QueryServices<'_>, vrec: &ValidityRecord, can_reuse: bool) -> ResultHandle<R> {
        if can_reuse && !vrec.is_gap {
            if let Some(hit) = self.cache.search_vrec(vrec, "") {
                return hit;
            }
            if services.l2.is_some_and(L2Cache::can_read) && R::can_l2_cache() {
                let gate = services.time_gates.get(self.proxy.table_name());
                let resolver = ValidityResolver::from_record(vrec, gate);
                if self.restore_from_l2(services, &resolver) {
                    if let Some(hit) = self.cache.search_vrec(vrec, "") {
                        return hit;
                    }
                }
            }
        }

        let result = self.build_simple(services, vrec);
        let handle = self.cache.adopt(result, true);
        if can_reuse {
            self.save_to_l2(services, &vrec.l2_cache_name(), &handle);
        } else {
            handle.set_can_reuse(false);
        }
        handle
    }

    /// Component of an aggregated result, adopted into its aggregate's pool.
    fn fetch_component(&mut self, services: &mut QueryServices<'_>, vrec: &ValidityRecord) -> ResultHandle<R> {
        let result = self.build_simple(services, vrec);
        self.cache.adopt(result, false)
    }

    fn build_simple(&self, services: &mut QueryServices<'_>, vrec: &ValidityRecord) -> QueryResult<R> {
        let table = self.proxy.table_name();
        if vrec.seq_no == 0 {
            return QueryResult::Simple(SimpleResult::empty(table, vrec.clone(), ""));
        }
        let set = self.proxy.query_seqno(services.cascade, vrec.seq_no, vrec.db_no);
        QueryResult::Simple(SimpleResult::from_row_set(table, set.as_ref(), vrec.clone(), "", ""))
    }

    // ========================================================================
    // L2 CACHE
    // ========================================================================

    /// Restore unless most of the aggregates are already in memory: then a
    /// validity boundary was probably crossed in only a few of them and
    /// loading the full set would be wasted.
    fn restore_if_worthwhile(&mut self, services: &QueryServices<'_>, resolver: &ValidityResolver) {
        let mut present = 0;
        let mut required = 0;
        for vrec in resolver.validity_records()[1..].iter().filter(|v| !v.is_gap) {
            if self.cache.contains_vrec(vrec, "") {
                present += 1;
            } else {
                required += 1;
            }
        }
        if required < present {
            tracing::info!(
                table = %self.proxy.table_name(),
                present,
                required,
                "Skipping search of L2 cache"
            );
        } else {
            self.restore_from_l2(services, resolver);
        }
    }

    /// Adopt the results saved under the resolver's name that are not in
    /// memory yet. Returns true if any rows were restored.
    fn restore_from_l2(&mut self, services: &QueryServices<'_>, resolver: &ValidityResolver) -> bool {
        let Some(l2) = services.l2 else {
            return false;
        };
        let name = resolver.l2_cache_name();
        let table = self.proxy.table_name().to_string();
        let entry = match l2.restore::<R>(&table, &name) {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(table = %table, name = %name, error = %e, "L2 cache restore failed");
                return false;
            }
        };

        let mut restored = 0;
        let mut ignored = 0;
        for payload in entry.payloads {
            // The saved window may have been cut by the time gate; the
            // freshly resolved record replaces it.
            let vrec = resolver.validity_record_from_seqno(payload.validity.seq_no).clone();
            if self.cache.search_vrec(&vrec, "").is_some() {
                ignored += payload.rows.len();
                continue;
            }
            restored += payload.rows.len();
            let result = SimpleResult::from_payload(
                &table,
                SimplePayload {
                    validity: vrec,
                    rows: payload.rows,
                },
            );
            drop(self.cache.adopt(QueryResult::Simple(result), true));
        }
        tracing::info!(table = %table, restored, ignored, "Restored rows from L2 cache");
        restored > 0
    }

    fn save_to_l2(&self, services: &QueryServices<'_>, name: &str, result: &QueryResult<R>) -> bool {
        let Some(l2) = services.l2 else {
            return false;
        };
        if !R::can_l2_cache() || !l2.can_write() || !result.is_from_db() || name.is_empty() {
            return false;
        }
        match l2.save(self.proxy.table_name(), name, &result.simple_payloads()) {
            Ok(saved) => saved,
            Err(e) => {
                tracing::warn!(table = %self.proxy.table_name(), name, error = %e, "L2 cache save failed");
                false
            }
        }
    }
}

impl<R: TableRow> std::fmt::Debug for TableAccessor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableAccessor")
            .field("table", &self.proxy.table_name())
            .field("row", &R::row_name())
            .field("cache", &self.cache)
            .finish()
    }
}
