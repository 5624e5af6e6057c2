//! Configuration types

use crate::error::{ConfigError, DbiError, DbiResult};
use crate::rollback::{EpochRollback, RollbackDates};
use crate::sim_association::SimFlagAssociation;
use crate::time_gate::{DEFAULT_TIME_GATE_SECS, MAX_TIME_GATE_SECS, MIN_TIME_GATE_SECS};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Connection attempts made before a backend is declared unreachable.
pub const DEFAULT_MAX_CONNECTION_ATTEMPTS: u32 = 20;

/// Attempts allowed once a URL has connected successfully at least once.
pub const VALIDATED_MAX_CONNECTION_ATTEMPTS: u32 = 100;

/// Unit of the linear connection backoff: attempt `n` waits `n` units.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// CASCADE CONFIGURATION
// ============================================================================

/// Where and how to reach one backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub url: String,
    pub user: String,
    pub password: String,
}

impl BackendDescriptor {
    pub fn new(url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: user.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Everything needed to build a cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Highest priority first.
    pub backends: Vec<BackendDescriptor>,
    /// File of `CREATE TEMPORARY TABLE` / `INSERT` statements run at startup.
    pub tmp_tables_file: Option<PathBuf>,
    pub max_connection_attempts: u32,
    pub retry_delay: Duration,
    /// Suppress warnings; used by reachability probes.
    pub quiet: bool,
}

impl CascadeConfig {
    pub fn new(backends: Vec<BackendDescriptor>) -> Self {
        Self {
            backends,
            tmp_tables_file: None,
            max_connection_attempts: DEFAULT_MAX_CONNECTION_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            quiet: false,
        }
    }

    pub fn with_tmp_tables_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.tmp_tables_file = Some(path.into());
        self
    }

    pub fn with_max_connection_attempts(mut self, attempts: u32) -> Self {
        self.max_connection_attempts = attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Build from `;`-separated lists.
    ///
    /// A user or password list shorter than the URL list falls back to its
    /// first entry, and the password `\0` stands for an empty one.
    pub fn from_lists(urls: &str, users: &str, passwords: &str) -> Result<Self, ConfigError> {
        let split = |s: &str| -> Vec<String> {
            s.split(';')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect()
        };
        let urls = split(urls);
        let users = split(users);
        let passwords = split(passwords);

        if urls.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "ENV_TSQL_URL".to_string(),
            });
        }
        if users.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "ENV_TSQL_USER".to_string(),
            });
        }
        if passwords.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "ENV_TSQL_PSWD".to_string(),
            });
        }

        let backends = urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let user = users.get(i).unwrap_or(&users[0]).clone();
                let mut password = passwords.get(i).unwrap_or(&passwords[0]).clone();
                if password == "\\0" {
                    password.clear();
                }
                BackendDescriptor::new(url.clone(), user, password)
            })
            .collect();
        Ok(Self::new(backends))
    }

    /// Read the `ENV_TSQL_*` variables; the `_UPDATE` variants win.
    ///
    /// Environment variables:
    /// - `ENV_TSQL_URL`: `;`-separated backend URLs, highest priority first
    /// - `ENV_TSQL_USER`: one user or a `;`-separated list
    /// - `ENV_TSQL_PSWD`: one password or a `;`-separated list
    /// - `ENV_TSQL_TMP_TBLS`: optional temporary tables file
    pub fn from_env() -> Result<Self, ConfigError> {
        let read = |name: &str| -> String {
            std::env::var(format!("ENV_TSQL_UPDATE_{}", name))
                .or_else(|_| std::env::var(format!("ENV_TSQL_{}", name)))
                .unwrap_or_default()
        };
        let config = Self::from_lists(&read("URL"), &read("USER"), &read("PSWD"))?;
        let tmp_tables = read("TMP_TBLS");
        Ok(if tmp_tables.is_empty() {
            config
        } else {
            config.with_tmp_tables_file(tmp_tables)
        })
    }
}

// ============================================================================
// ACCESS LAYER CONFIGURATION
// ============================================================================

/// Configuration of the context object and every table accessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbiConfig {
    /// Working directory of the L2 cache; `None` disables it.
    pub l2_cache_dir: Option<PathBuf>,
    pub l2_read_enabled: bool,
    pub l2_write_enabled: bool,
    pub default_time_gate_secs: i64,
    pub max_connection_attempts: u32,
    /// `Some(true)` pins every connection open, `Some(false)` forces all to
    /// be temporary.
    pub make_connections_permanent: Option<bool>,
    /// Order data rows of one SEQNO by `ROW_COUNTER`.
    pub order_context_query: bool,
    /// Condition ANDed into every validity query.
    pub sql_condition: String,
    pub sim_associations: SimFlagAssociation,
    pub rollback_dates: RollbackDates,
    pub epoch_rollback: EpochRollback,
    /// Tear down accessors and cascade when the context object is dropped.
    pub shutdown: bool,
}

impl Default for DbiConfig {
    fn default() -> Self {
        Self {
            l2_cache_dir: None,
            l2_read_enabled: true,
            l2_write_enabled: true,
            default_time_gate_secs: DEFAULT_TIME_GATE_SECS,
            max_connection_attempts: DEFAULT_MAX_CONNECTION_ATTEMPTS,
            make_connections_permanent: None,
            order_context_query: false,
            sql_condition: String::new(),
            sim_associations: SimFlagAssociation::default(),
            rollback_dates: RollbackDates::default(),
            epoch_rollback: EpochRollback::default(),
            shutdown: true,
        }
    }
}

static ENV_VAR: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").ok());

/// Expand `$NAME` and `${NAME}`. Returns `None` if a variable is unset.
fn expand_path(path: &str) -> Option<String> {
    let Some(pattern) = ENV_VAR.as_ref() else {
        return Some(path.to_string());
    };
    let mut missing = false;
    let expanded = pattern.replace_all(path, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| {
            missing = true;
            String::new()
        })
    });
    if missing {
        None
    } else {
        Some(expanded.into_owned())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => other
            .parse::<i64>()
            .map(|n| n > 0)
            .map_err(|_| ConfigError::InvalidValue {
                field: key.to_string(),
                value: value.to_string(),
                reason: "expected a boolean or integer".to_string(),
            }),
    }
}

impl DbiConfig {
    pub fn with_l2_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.l2_cache_dir = Some(dir.into());
        self
    }

    pub fn with_l2_access(mut self, read: bool, write: bool) -> Self {
        self.l2_read_enabled = read;
        self.l2_write_enabled = write;
        self
    }

    pub fn with_default_time_gate_secs(mut self, secs: i64) -> Self {
        self.default_time_gate_secs = secs;
        self
    }

    pub fn with_max_connection_attempts(mut self, attempts: u32) -> Self {
        self.max_connection_attempts = attempts;
        self
    }

    pub fn with_connections_permanent(mut self, permanent: bool) -> Self {
        self.make_connections_permanent = Some(permanent);
        self
    }

    pub fn with_order_context_query(mut self, order: bool) -> Self {
        self.order_context_query = order;
        self
    }

    pub fn with_sql_condition(mut self, sql: impl Into<String>) -> Self {
        self.sql_condition = sql.into();
        self
    }

    pub fn with_sim_associations(mut self, associations: SimFlagAssociation) -> Self {
        self.sim_associations = associations;
        self
    }

    pub fn with_rollback_dates(mut self, rollback: RollbackDates) -> Self {
        self.rollback_dates = rollback;
        self
    }

    pub fn with_epoch_rollback(mut self, rollback: EpochRollback) -> Self {
        self.epoch_rollback = rollback;
        self
    }

    pub fn can_read_l2(&self) -> bool {
        self.l2_cache_dir.is_some() && self.l2_read_enabled
    }

    pub fn can_write_l2(&self) -> bool {
        self.l2_cache_dir.is_some() && self.l2_write_enabled
    }

    /// Parse from JSON.
    pub fn from_json(text: &str) -> DbiResult<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConfigError::InvalidValue {
            field: "DbiConfig".to_string(),
            value: text.chars().take(64).collect(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden from the environment.
    ///
    /// Environment variables:
    /// - `ENV_DBI`: `;`-separated `key=value` registry requests
    /// - `CONDB_L2_CACHE_DIR`: L2 cache working directory
    /// - `CONDB_L2_READ` / `CONDB_L2_WRITE`: L2 access switches (default: true)
    /// - `CONDB_TIME_GATE_SECS`: default time gate (default: 864000)
    /// - `CONDB_MAX_CONNECTION_ATTEMPTS`: connection attempts (default: 20)
    /// - `CONDB_ORDER_CONTEXT_QUERY`: order data rows by ROW_COUNTER (default: false)
    pub fn from_env() -> DbiResult<Self> {
        let defaults = Self::default();

        let mut config = Self {
            l2_cache_dir: std::env::var("CONDB_L2_CACHE_DIR")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            l2_read_enabled: std::env::var("CONDB_L2_READ")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.l2_read_enabled),
            l2_write_enabled: std::env::var("CONDB_L2_WRITE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.l2_write_enabled),
            default_time_gate_secs: std::env::var("CONDB_TIME_GATE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_time_gate_secs),
            max_connection_attempts: std::env::var("CONDB_MAX_CONNECTION_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_connection_attempts),
            order_context_query: std::env::var("CONDB_ORDER_CONTEXT_QUERY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.order_context_query),
            ..defaults
        };

        if let Ok(requests) = std::env::var("ENV_DBI") {
            if !requests.trim().is_empty() {
                tracing::info!(requests = %requests, "Configuring from ENV_DBI");
                config.apply_requests(&requests)?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply `;`-separated `key=value` requests.
    pub fn apply_requests(&mut self, requests: &str) -> DbiResult<()> {
        let mut registry = BTreeMap::new();
        for request in requests.split(';').map(str::trim).filter(|r| !r.is_empty()) {
            let Some((key, value)) = request.split_once('=') else {
                return Err(ConfigError::InvalidValue {
                    field: "ENV_DBI".to_string(),
                    value: request.to_string(),
                    reason: "expected key=value".to_string(),
                }
                .into());
            };
            registry.insert(
                key.trim().to_string(),
                value.trim().trim_matches('\'').trim_matches('"').to_string(),
            );
        }
        self.apply_registry(registry)
    }

    /// Apply registry-style entries.
    ///
    /// Association and rollback entries are consumed first; the remaining
    /// keys must be one of `Level2Cache`, `MakeConnectionsPermanent`,
    /// `OrderContextQuery` or `Shutdown`.
    pub fn apply_registry(&mut self, mut registry: BTreeMap<String, String>) -> DbiResult<()> {
        self.sim_associations.apply_registry(&mut registry);
        self.epoch_rollback.apply_registry(&mut registry);
        self.rollback_dates.apply_registry(&mut registry);

        let mut unknown = Vec::new();
        for (key, value) in registry {
            match key.as_str() {
                "Level2Cache" => {
                    let dir = expand_path(&value).unwrap_or_else(|| {
                        tracing::warn!(dir = %value, "Directory name expansion failed, using ./ instead");
                        "./".to_string()
                    });
                    tracing::debug!(dir = %dir, "Setting L2 cache directory");
                    self.l2_cache_dir = Some(PathBuf::from(dir));
                }
                "MakeConnectionsPermanent" => {
                    self.make_connections_permanent = Some(parse_flag(&key, &value)?);
                }
                "OrderContextQuery" => {
                    self.order_context_query = parse_flag(&key, &value)?;
                }
                "Shutdown" => {
                    self.shutdown = parse_flag(&key, &value)?;
                }
                _ => {
                    tracing::error!(key = %key, "Illegal registry item");
                    unknown.push(key);
                }
            }
        }

        match unknown.into_iter().next() {
            Some(key) => Err(ConfigError::UnknownKey { key }.into()),
            None => Ok(()),
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - default_time_gate_secs in (15 s, 100 days]
    /// - max_connection_attempts >= 1
    pub fn validate(&self) -> DbiResult<()> {
        if self.default_time_gate_secs <= MIN_TIME_GATE_SECS
            || self.default_time_gate_secs > MAX_TIME_GATE_SECS
        {
            return Err(DbiError::Config(ConfigError::InvalidValue {
                field: "default_time_gate_secs".to_string(),
                value: self.default_time_gate_secs.to_string(),
                reason: "time gate must be > 15 s and <= 100 days".to_string(),
            }));
        }

        if self.max_connection_attempts == 0 {
            return Err(DbiError::Config(ConfigError::InvalidValue {
                field: "max_connection_attempts".to_string(),
                value: self.max_connection_attempts.to_string(),
                reason: "at least one connection attempt is required".to_string(),
            }));
        }

        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
