//! Rollback tables.
//!
//! A rollback hides rows written after a given date (or above a given epoch)
//! so that a job can reproduce the conditions it saw in the past. Entries are
//! keyed by table-name patterns using `*` and `?`; patterns are tried in
//! reverse lexical order so that `CALIB*` shadows `*`.

use crate::identity::{format_datetime, parse_datetime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const ROLLBACK_DATE_PREFIX: &str = "Rollback:";
pub const ROLLBACK_TYPE_PREFIX: &str = "RollbackType:";
pub const EPOCH_ROLLBACK_PREFIX: &str = "EpochRollback:";

/// True if `name` matches the wildcard `pattern` (`*` any run, `?` any one).
pub fn wildcard_match(name: &str, pattern: &str) -> bool {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map(|re| re.is_match(name)).unwrap_or(false)
}

fn lookup<'a, V>(map: &'a BTreeMap<String, V>, table: &str) -> Option<&'a V> {
    map.iter()
        .rev()
        .find(|(pattern, _)| wildcard_match(table, pattern))
        .map(|(_, v)| v)
}

// ============================================================================
// ROLLBACK TYPE
// ============================================================================

/// Which date column a date rollback applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RollbackType {
    #[default]
    InsertDate,
    CreationDate,
}

impl RollbackType {
    pub fn as_column(&self) -> &'static str {
        match self {
            RollbackType::InsertDate => "INSERTDATE",
            RollbackType::CreationDate => "CREATIONDATE",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, RollbackTypeParseError> {
        match s.trim().to_uppercase().as_str() {
            "INSERTDATE" => Ok(RollbackType::InsertDate),
            "CREATIONDATE" => Ok(RollbackType::CreationDate),
            _ => Err(RollbackTypeParseError(s.to_string())),
        }
    }
}

impl fmt::Display for RollbackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_column())
    }
}

impl FromStr for RollbackType {
    type Err = RollbackTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid rollback type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackTypeParseError(pub String);

impl fmt::Display for RollbackTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid rollback type: {}", self.0)
    }
}

impl std::error::Error for RollbackTypeParseError {}

// ============================================================================
// DATE ROLLBACK
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackDates {
    dates: BTreeMap<String, String>,
    types: BTreeMap<String, RollbackType>,
}

impl RollbackDates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Roll `pattern` back to `date`. Returns false if the date does not parse.
    pub fn set_date(&mut self, pattern: &str, date: &str) -> bool {
        match parse_datetime(date) {
            Some(ts) => {
                self.dates.insert(pattern.to_string(), format_datetime(&ts));
                true
            }
            None => false,
        }
    }

    pub fn set_type(&mut self, pattern: &str, rollback_type: RollbackType) {
        self.types.insert(pattern.to_string(), rollback_type);
    }

    /// Rollback date of `table`, normalised to `YYYY-MM-DD hh:mm:ss`.
    pub fn date(&self, table: &str) -> Option<&str> {
        lookup(&self.dates, table).map(String::as_str)
    }

    pub fn rollback_type(&self, table: &str) -> RollbackType {
        lookup(&self.types, table).copied().unwrap_or_default()
    }

    /// SQL restriction for `table`, e.g. `INSERTDATE < '2020-01-01 00:00:00'`.
    pub fn condition(&self, table: &str) -> Option<String> {
        self.date(table)
            .map(|date| format!("{} < '{}'", self.rollback_type(table).as_column(), date))
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn clear(&mut self) {
        self.dates.clear();
        self.types.clear();
    }

    /// Consume `Rollback:<pattern>` and `RollbackType:<pattern>` registry
    /// entries. Returns whether anything changed.
    pub fn apply_registry(&mut self, registry: &mut BTreeMap<String, String>) -> bool {
        let keys: Vec<String> = registry
            .keys()
            .filter(|k| k.starts_with(ROLLBACK_DATE_PREFIX) || k.starts_with(ROLLBACK_TYPE_PREFIX))
            .cloned()
            .collect();

        let mut changed = false;
        for key in keys {
            let Some(value) = registry.remove(&key) else {
                continue;
            };
            let accepted = if let Some(pattern) = key.strip_prefix(ROLLBACK_DATE_PREFIX) {
                self.set_date(pattern, &value)
            } else if let Some(pattern) = key.strip_prefix(ROLLBACK_TYPE_PREFIX) {
                match value.parse::<RollbackType>() {
                    Ok(t) => {
                        self.set_type(pattern, t);
                        true
                    }
                    Err(_) => false,
                }
            } else {
                false
            };
            if accepted {
                changed = true;
            } else {
                tracing::warn!(key = %key, value = %value, "Illegal Rollback registry item");
            }
        }
        if changed {
            tracing::info!(rollback = %self, "Rollback dates updated");
        }
        changed
    }
}

impl fmt::Display for RollbackDates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dates.is_empty() {
            return write!(f, "Not enabled");
        }
        let entries: Vec<String> = self
            .dates
            .iter()
            .rev()
            .map(|(pattern, date)| format!("{} {} < {}", pattern, self.rollback_type(pattern), date))
            .collect();
        write!(f, "{}", entries.join("; "))
    }
}

// ============================================================================
// EPOCH ROLLBACK
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRollback {
    epochs: BTreeMap<String, i32>,
}

impl EpochRollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, pattern: &str, max_epoch: i32) {
        self.epochs.insert(pattern.to_string(), max_epoch);
    }

    pub fn max_epoch(&self, table: &str) -> Option<i32> {
        lookup(&self.epochs, table).copied()
    }

    /// SQL restriction for `table`, e.g. `EPOCH <= 3`.
    pub fn condition(&self, table: &str) -> Option<String> {
        self.max_epoch(table).map(|e| format!("EPOCH <= {}", e))
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn clear(&mut self) {
        self.epochs.clear();
    }

    /// Consume `EpochRollback:<pattern>` registry entries.
    pub fn apply_registry(&mut self, registry: &mut BTreeMap<String, String>) -> bool {
        let keys: Vec<String> = registry
            .keys()
            .filter(|k| k.starts_with(EPOCH_ROLLBACK_PREFIX))
            .cloned()
            .collect();

        let mut changed = false;
        for key in keys {
            let Some(value) = registry.remove(&key) else {
                continue;
            };
            match value.trim().parse::<i32>() {
                Ok(epoch) => {
                    self.set(&key[EPOCH_ROLLBACK_PREFIX.len()..], epoch);
                    changed = true;
                }
                Err(_) => {
                    tracing::warn!(key = %key, value = %value, "Illegal EpochRollback registry item");
                }
            }
        }
        if changed {
            tracing::info!(epochs = ?self.epochs, "Epoch rollback updated");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("CALIB_GAIN", "CALIB*"));
        assert!(wildcard_match("CALIB_GAIN", "*"));
        assert!(wildcard_match("CALIB", "CALI?"));
        assert!(!wildcard_match("CALIB", "CAL?"));
        assert!(!wildcard_match("XCALIB", "CALIB*"));
        assert!(wildcard_match("A.B", "A.B"));
        assert!(!wildcard_match("AXB", "A.B"));
    }

    #[test]
    fn test_specific_pattern_shadows_catch_all() {
        let mut rollback = RollbackDates::new();
        assert!(rollback.set_date("*", "2021-01-01"));
        assert!(rollback.set_date("CALIB*", "2020-06-01 12:00:00"));
        assert_eq!(rollback.date("CALIB_GAIN"), Some("2020-06-01 12:00:00"));
        assert_eq!(rollback.date("OTHER"), Some("2021-01-01 00:00:00"));
    }

    #[test]
    fn test_condition_uses_type() {
        let mut rollback = RollbackDates::new();
        rollback.set_date("CALIB", "2020-06-01");
        assert_eq!(
            rollback.condition("CALIB").unwrap(),
            "INSERTDATE < '2020-06-01 00:00:00'"
        );
        rollback.set_type("CAL*", RollbackType::CreationDate);
        assert_eq!(
            rollback.condition("CALIB").unwrap(),
            "CREATIONDATE < '2020-06-01 00:00:00'"
        );
        assert!(rollback.condition("OTHER").is_none());
    }

    #[test]
    fn test_rollback_registry() {
        let mut registry = BTreeMap::new();
        registry.insert("Rollback:CALIB".to_string(), "2020-06-01".to_string());
        registry.insert("RollbackType:CALIB".to_string(), "creationdate".to_string());
        registry.insert("Rollback:BAD".to_string(), "yesterday".to_string());
        let mut rollback = RollbackDates::new();
        assert!(rollback.apply_registry(&mut registry));
        assert!(registry.is_empty());
        assert_eq!(rollback.rollback_type("CALIB"), RollbackType::CreationDate);
        assert!(rollback.date("BAD").is_none());
    }

    #[test]
    fn test_epoch_rollback() {
        let mut registry = BTreeMap::new();
        registry.insert("EpochRollback:CALIB*".to_string(), "3".to_string());
        registry.insert("EpochRollback:X".to_string(), "three".to_string());
        let mut epochs = EpochRollback::new();
        assert!(epochs.apply_registry(&mut registry));
        assert_eq!(epochs.condition("CALIB_GAIN").unwrap(), "EPOCH <= 3");
        assert!(epochs.condition("X").is_none());
        epochs.clear();
        assert!(epochs.is_empty());
    }

    #[test]
    fn test_rollback_type_parse() {
        assert_eq!("insertdate".parse::<RollbackType>().unwrap(), RollbackType::InsertDate);
        assert!("DATE".parse::<RollbackType>().is_err());
    }
}
