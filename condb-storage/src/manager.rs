//! The database manager.
//!
//! [`DbiManager`] is the context object tying a session together: it owns
//! the cascade, the configuration, time gates, sim-flag associations,
//! rollback tables, the L2 cache and one [`TableAccessor`] per (table, row
//! type). It is constructed explicitly and passed to whoever queries.

use crate::accessor::{QueryServices, TableAccessor};
use crate::backend::{BackendFactory, SqliteFactory};
use crate::cache::CacheStats;
use crate::cascade::Cascade;
use crate::l2::L2Cache;
use crate::result::ResultHandle;
use crate::row::TableRow;
use condb_core::{
    CascadeConfig, ConfigError, DbiConfig, DbiResult, EpochRollback, RollbackDates,
    SimFlagAssociation, Task, TimeGates, ValidityContext,
};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

// ============================================================================
// TYPE-ERASED ACCESSORS
// ============================================================================

/// The row-type independent face of a [`TableAccessor`].
pub trait AnyAccessor {
    fn table_name(&self) -> &str;
    fn row_name(&self) -> &'static str;
    fn set_sql_condition(&mut self, sql: &str);
    fn refresh_meta_data(&mut self, cascade: &mut Cascade);
    fn purge(&mut self);
    fn set_stale(&mut self);
    fn stats(&self) -> CacheStats;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<R: TableRow> AnyAccessor for TableAccessor<R> {
    fn table_name(&self) -> &str {
        TableAccessor::table_name(self)
    }

    fn row_name(&self) -> &'static str {
        R::row_name()
    }

    fn set_sql_condition(&mut self, sql: &str) {
        TableAccessor::set_sql_condition(self, sql);
    }

    fn refresh_meta_data(&mut self, cascade: &mut Cascade) {
        TableAccessor::refresh_meta_data(self, cascade);
    }

    fn purge(&mut self) {
        TableAccessor::purge(self);
    }

    fn set_stale(&mut self) {
        TableAccessor::set_stale(self);
    }

    fn stats(&self) -> CacheStats {
        TableAccessor::stats(self)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct DbiManager {
    config: DbiConfig,
    cascade: Cascade,
    time_gates: TimeGates,
    l2: Option<L2Cache>,
    accessors: BTreeMap<(String, &'static str), Box<dyn AnyAccessor>>,
    is_shut_down: bool,
}

impl DbiManager {
    /// Build the cascade described by `cascade_config` and wrap it.
    pub fn new(
        config: DbiConfig,
        cascade_config: &CascadeConfig,
        factory: Arc<dyn BackendFactory>,
    ) -> DbiResult<Self> {
        config.validate()?;
        let cascade_config = cascade_config
            .clone()
            .with_max_connection_attempts(config.max_connection_attempts);
        let cascade = Cascade::new(&cascade_config, factory)?;
        Self::with_cascade(config, cascade)
    }

    /// Configuration and cascade from the environment, SQLite backends.
    pub fn from_env() -> DbiResult<Self> {
        let config = DbiConfig::from_env()?;
        let cascade_config = CascadeConfig::from_env()?;
        Self::new(config, &cascade_config, Arc::new(SqliteFactory))
    }

    pub fn with_cascade(config: DbiConfig, mut cascade: Cascade) -> DbiResult<Self> {
        config.validate()?;
        if let Some(permanent) = config.make_connections_permanent {
            cascade.set_all_permanent(permanent);
        }
        let l2 = L2Cache::from_config(&config)?;
        let time_gates = TimeGates::new(config.default_time_gate_secs);
        tracing::info!(
            entries = cascade.num_db(),
            l2 = l2.is_some(),
            "Database manager ready"
        );
        Ok(Self {
            config,
            cascade,
            time_gates,
            l2,
            accessors: BTreeMap::new(),
            is_shut_down: false,
        })
    }

    pub fn config(&self) -> &DbiConfig {
        &self.config
    }

    pub fn cascade(&self) -> &Cascade {
        &self.cascade
    }

    pub fn cascade_mut(&mut self) -> &mut Cascade {
        &mut self.cascade
    }

    pub fn time_gates(&self) -> &TimeGates {
        &self.time_gates
    }

    pub fn time_gates_mut(&mut self) -> &mut TimeGates {
        &mut self.time_gates
    }

    pub fn l2_cache(&self) -> Option<&L2Cache> {
        self.l2.as_ref()
    }

    pub fn num_accessors(&self) -> usize {
        self.accessors.len()
    }

    /// True after `shutdown` until an accessor is created again.
    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// SQL condition for `table`: the global condition, then the rollback
    /// date and epoch restrictions that apply to it.
    pub fn sql_condition_for(&self, table: &str) -> String {
        let mut parts = Vec::new();
        if !self.config.sql_condition.is_empty() {
            parts.push(self.config.sql_condition.clone());
        }
        parts.extend(self.config.rollback_dates.condition(table));
        parts.extend(self.config.epoch_rollback.condition(table));
        parts.join(" and ")
    }

    /// The accessor for `table` and row type `R`, created on first use.
    pub fn accessor<R: TableRow>(&mut self, table: &str) -> DbiResult<&mut TableAccessor<R>> {
        let key = (table.to_uppercase(), R::row_name());
        if !self.accessors.contains_key(&key) {
            let mut accessor = TableAccessor::<R>::new(table, self.config.order_context_query);
            accessor.refresh_meta_data(&mut self.cascade);
            let condition = self.sql_condition_for(&key.0);
            if !condition.is_empty() {
                tracing::info!(table = %accessor.table_name(), condition = %condition, "Applying SQL condition");
            }
            accessor.set_sql_condition(&condition);
            tracing::debug!(table = %key.0, row = key.1, "Created table accessor");
            self.accessors.insert(key.clone(), Box::new(accessor));
            self.is_shut_down = false;
        }

        self.accessors
            .get_mut(&key)
            .and_then(|a| a.as_any_mut().downcast_mut::<TableAccessor<R>>())
            .ok_or_else(|| {
                ConfigError::InvalidValue {
                    field: "row type".to_string(),
                    value: key.1.to_string(),
                    reason: format!("another row type named {} is registered for {}", key.1, key.0),
                }
                .into()
            })
    }

    /// Run `f` with the accessor for `table` and the services it queries
    /// through.
    pub fn with_accessor<R: TableRow, T>(
        &mut self,
        table: &str,
        f: impl FnOnce(&mut TableAccessor<R>, &mut QueryServices<'_>) -> T,
    ) -> DbiResult<T> {
        self.accessor::<R>(table)?;
        let key = (table.to_uppercase(), R::row_name());
        let Self {
            config,
            cascade,
            time_gates,
            l2,
            accessors,
            ..
        } = self;
        let accessor = accessors
            .get_mut(&key)
            .and_then(|a| a.as_any_mut().downcast_mut::<TableAccessor<R>>())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "row type".to_string(),
                value: key.1.to_string(),
                reason: format!("accessor for {} is not of this row type", key.0),
            })?;
        let mut services = QueryServices {
            cascade,
            time_gates,
            associations: &config.sim_associations,
            l2: l2.as_ref(),
        };
        Ok(f(accessor, &mut services))
    }

    /// Standard context query on `table`.
    pub fn query<R: TableRow>(
        &mut self,
        table: &str,
        context: &ValidityContext,
        task: Task,
        find_full_time_window: bool,
    ) -> DbiResult<ResultHandle<R>> {
        self.with_accessor::<R, _>(table, |accessor, services| {
            accessor.query(services, context, task, find_full_time_window)
        })
    }

    /// Extended query on `table`.
    pub fn query_extended<R: TableRow>(
        &mut self,
        table: &str,
        context_sql: &str,
        task: Task,
        data_sql: &str,
        fill_options: &str,
    ) -> DbiResult<ResultHandle<R>> {
        self.with_accessor::<R, _>(table, |accessor, services| {
            accessor.query_extended(services, context_sql, task, data_sql, fill_options)
        })
    }

    // ------------------------------------------------------------------------
    // Configuration changes
    // ------------------------------------------------------------------------

    /// Re-derive and apply the SQL condition of every accessor.
    pub fn apply_sql_conditions(&mut self) {
        let conditions: Vec<_> = self
            .accessors
            .keys()
            .map(|(table, _)| self.sql_condition_for(table))
            .collect();
        for (accessor, condition) in self.accessors.values_mut().zip(conditions) {
            accessor.set_sql_condition(&condition);
        }
    }

    pub fn set_global_sql_condition(&mut self, sql: &str) {
        self.config.sql_condition = sql.to_string();
        self.apply_sql_conditions();
    }

    pub fn set_rollback_dates(&mut self, rollback: RollbackDates) {
        self.config.rollback_dates = rollback;
        self.apply_sql_conditions();
    }

    pub fn set_epoch_rollback(&mut self, rollback: EpochRollback) {
        self.config.epoch_rollback = rollback;
        self.apply_sql_conditions();
    }

    pub fn clear_rollbacks(&mut self) {
        self.config.rollback_dates.clear();
        self.config.epoch_rollback.clear();
        self.apply_sql_conditions();
    }

    pub fn set_sim_associations(&mut self, associations: SimFlagAssociation) {
        self.config.sim_associations = associations;
    }

    /// Apply `;`-separated `key=value` requests, then refresh conditions.
    pub fn apply_requests(&mut self, requests: &str) -> DbiResult<()> {
        self.config.apply_requests(requests)?;
        if let Some(permanent) = self.config.make_connections_permanent {
            self.cascade.set_all_permanent(permanent);
        }
        self.apply_sql_conditions();
        Ok(())
    }

    pub fn refresh_meta_data(&mut self, table: &str) {
        let table = table.to_uppercase();
        for ((name, _), accessor) in self.accessors.iter_mut() {
            if *name == table {
                accessor.refresh_meta_data(&mut self.cascade);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Caches
    // ------------------------------------------------------------------------

    pub fn purge_caches(&mut self) {
        for accessor in self.accessors.values_mut() {
            accessor.purge();
        }
    }

    pub fn set_stale(&mut self) {
        for accessor in self.accessors.values_mut() {
            accessor.set_stale();
        }
    }

    /// Cache statistics of every accessor, one line each.
    pub fn statistics(&self) -> String {
        let mut report = format!(
            "{:<40}{:>10}{:>10}{:>10}{:>10}\n",
            "Table::Row", "Current", "Max", "Adopted", "Reused"
        );
        for ((table, row), accessor) in &self.accessors {
            let _ = writeln!(report, "{:<40}{}", format!("{}::{}", table, row), accessor.stats());
        }
        report
    }

    pub fn show_statistics(&self) {
        tracing::info!("Query cache statistics\n{}", self.statistics());
    }

    /// Drop every accessor and close idle connections. The manager stays
    /// usable; accessors are recreated on demand.
    pub fn shutdown(&mut self) {
        if self.is_shut_down {
            return;
        }
        self.show_statistics();
        self.purge_caches();
        self.accessors.clear();
        self.cascade.close_idle_connections();
        self.is_shut_down = true;
        tracing::info!("Database manager shut down");
    }
}

impl Drop for DbiManager {
    fn drop(&mut self) {
        if self.config.shutdown {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for DbiManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbiManager")
            .field("cascade", &self.cascade)
            .field("accessors", &self.accessors.len())
            .field("l2", &self.l2)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::vld_table_ddl;
    use crate::row::RowReader;
    use condb_core::{
        parse_datetime, BackendDescriptor, Detector, RowError, SimFlag, ValidityRecord,
    };
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Setting {
        value: i64,
    }

    impl TableRow for Setting {
        fn row_name() -> &'static str {
            "Setting"
        }

        fn fill(reader: &mut RowReader<'_>, _vrec: Option<&ValidityRecord>) -> Result<Self, RowError> {
            Ok(Self { value: reader.next_i64()? })
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Impostor;

    impl TableRow for Impostor {
        fn row_name() -> &'static str {
            "Setting"
        }

        fn fill(_reader: &mut RowReader<'_>, _vrec: Option<&ValidityRecord>) -> Result<Self, RowError> {
            Ok(Self)
        }
    }

    fn make_test_manager(dir: &TempDir, config: DbiConfig) -> DbiManager {
        let path = dir.path().join("mgr.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(&format!(
                "create table SETTINGS (SEQNO integer, ROW_COUNTER integer, VALUE integer);
                 {};
                 insert into SETTINGSVLD values (1, '2020-01-01 00:00:00', '2021-01-01 00:00:00', 0, 0, 1, 1, 0, -1, '2020-01-01 00:00:00', '2020-01-01 00:00:00');
                 insert into SETTINGS values (1, 1, 42);
                 insert into SETTINGSVLD values (2, '2020-01-01 00:00:00', '2021-01-01 00:00:00', 1, 0, 1, 1, 0, -1, '2020-02-01 00:00:00', '2020-06-01 00:00:00');
                 insert into SETTINGS values (2, 1, 43);",
                vld_table_ddl("SETTINGS", false)
            ))
            .unwrap();
        }
        let url = format!("sqlite://{}", path.display());
        let cascade_config = CascadeConfig::new(vec![BackendDescriptor::new(url, "", "")]);
        DbiManager::new(config.with_max_connection_attempts(1), &cascade_config, Arc::new(SqliteFactory)).unwrap()
    }

    fn context() -> ValidityContext {
        ValidityContext::new(Detector::MCaptain, SimFlag::Data, parse_datetime("2020-07-01 00:00:00").unwrap())
    }

    #[test]
    fn test_query_through_manager() {
        let dir = TempDir::new().unwrap();
        let mut manager = make_test_manager(&dir, DbiConfig::default());
        let result = manager.query::<Setting>("SETTINGS", &context(), 0, false).unwrap();
        assert_eq!(result.row(0).unwrap().value, 43);
        assert_eq!(manager.num_accessors(), 1);
        assert!(manager.statistics().contains("SETTINGS::Setting"));
    }

    #[test]
    fn test_rollbacks_shape_sql_condition() {
        let dir = TempDir::new().unwrap();
        let mut manager = make_test_manager(&dir, DbiConfig::default().with_sql_condition("TASK = 0"));
        assert_eq!(manager.sql_condition_for("SETTINGS"), "TASK = 0");

        let mut dates = RollbackDates::new();
        assert!(dates.set_date("SETT*", "2020-03-01 00:00:00"));
        manager.set_rollback_dates(dates);
        assert_eq!(
            manager.sql_condition_for("SETTINGS"),
            "TASK = 0 and INSERTDATE < '2020-03-01 00:00:00'"
        );
        let result = manager.query::<Setting>("SETTINGS", &context(), 0, false).unwrap();
        assert_eq!(result.row(0).unwrap().value, 42);
        drop(result);

        let mut epochs = EpochRollback::new();
        epochs.set("*", 0);
        manager.clear_rollbacks();
        manager.set_epoch_rollback(epochs);
        assert_eq!(manager.sql_condition_for("SETTINGS"), "TASK = 0 and EPOCH <= 0");
        let result = manager.query::<Setting>("SETTINGS", &context(), 0, false).unwrap();
        assert_eq!(result.row(0).unwrap().value, 42);
    }

    #[test]
    fn test_row_name_clash_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut manager = make_test_manager(&dir, DbiConfig::default());
        manager.accessor::<Setting>("SETTINGS").unwrap();
        assert!(manager.accessor::<Impostor>("SETTINGS").is_err());
    }

    #[test]
    fn test_shutdown_drops_accessors() {
        let dir = TempDir::new().unwrap();
        let mut manager = make_test_manager(&dir, DbiConfig::default());
        let result = manager.query::<Setting>("SETTINGS", &context(), 0, false).unwrap();
        manager.shutdown();
        assert_eq!(manager.num_accessors(), 0);
        assert_eq!(result.row(0).unwrap().value, 43);
    }

    #[test]
    fn test_shutdown_again_after_reuse() {
        let dir = TempDir::new().unwrap();
        let mut manager = make_test_manager(&dir, DbiConfig::default());
        manager.query::<Setting>("SETTINGS", &context(), 0, false).unwrap();
        manager.shutdown();
        assert!(manager.is_shut_down());

        manager.query::<Setting>("SETTINGS", &context(), 0, false).unwrap();
        assert!(!manager.is_shut_down());
        assert_eq!(manager.num_accessors(), 1);

        manager.shutdown();
        assert!(manager.is_shut_down());
        assert_eq!(manager.num_accessors(), 0);
    }
}
