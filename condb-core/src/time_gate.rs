//! Per-table time gates.
//!
//! A standard validity query only looks at rows overlapping
//! `[ts - gate, ts + gate)`; the gate of each table adapts to the typical
//! length of its validity windows.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Gate applied to tables that have not been tuned: 10 days.
pub const DEFAULT_TIME_GATE_SECS: i64 = 10 * 24 * 60 * 60;

/// Largest accepted gate: 100 days.
pub const MAX_TIME_GATE_SECS: i64 = 100 * 24 * 60 * 60;

/// Gates must be strictly above this many seconds.
pub const MIN_TIME_GATE_SECS: i64 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeGates {
    default_gate: i64,
    gates: HashMap<String, i64>,
}

impl Default for TimeGates {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_GATE_SECS)
    }
}

impl TimeGates {
    pub fn new(default_gate: i64) -> Self {
        Self {
            default_gate,
            gates: HashMap::new(),
        }
    }

    pub fn default_gate(&self) -> i64 {
        self.default_gate
    }

    /// Gate in seconds for `table`.
    pub fn get(&self, table: &str) -> i64 {
        self.gates.get(table).copied().unwrap_or(self.default_gate)
    }

    /// Set the gate for `table`; values outside `(15 s, 100 days]` are
    /// ignored with a warning. Returns whether the value was accepted.
    pub fn set(&mut self, table: &str, gate_secs: i64) -> bool {
        if gate_secs > MIN_TIME_GATE_SECS && gate_secs <= MAX_TIME_GATE_SECS {
            self.gates.insert(table.to_string(), gate_secs);
            tracing::debug!(table, gate_secs, "Setting time gate");
            true
        } else {
            tracing::warn!(
                table,
                gate_secs,
                "Ignoring invalid time gate setting, must be > 15 s and <= 100 days"
            );
            false
        }
    }

    /// Re-tune the gate of `table` after a query.
    ///
    /// The target is `3 * aggregates * mean window`, capped at 100 days. The
    /// gate is only touched when it is off by more than a factor of ten.
    /// Returns the new gate when it changed.
    pub fn adapt(
        &mut self,
        table: &str,
        num_aggregates: usize,
        sum_windows_secs: i64,
        num_windows: usize,
    ) -> Option<i64> {
        if num_windows == 0 {
            return None;
        }
        let mean = sum_windows_secs / num_windows as i64;
        let calc = (3i64)
            .checked_mul(num_aggregates as i64)
            .and_then(|v| v.checked_mul(mean))
            .filter(|v| *v >= 0 && *v <= MAX_TIME_GATE_SECS)
            .unwrap_or(MAX_TIME_GATE_SECS);

        let current = self.get(table);
        if current >= calc / 10 && current <= calc.saturating_mul(10) {
            return None;
        }
        if self.set(table, calc) {
            Some(calc)
        } else {
            tracing::warn!(
                table,
                num_windows,
                sum_windows_secs,
                num_aggregates,
                "The ignored time gate setting was calculated from these windows"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_gate() {
        let gates = TimeGates::default();
        assert_eq!(gates.get("CALIB"), DEFAULT_TIME_GATE_SECS);
    }

    #[test]
    fn test_set_validates_range() {
        let mut gates = TimeGates::default();
        assert!(!gates.set("CALIB", 15));
        assert!(!gates.set("CALIB", MAX_TIME_GATE_SECS + 1));
        assert_eq!(gates.get("CALIB"), DEFAULT_TIME_GATE_SECS);
        assert!(gates.set("CALIB", 16));
        assert_eq!(gates.get("CALIB"), 16);
        assert!(gates.set("CALIB", MAX_TIME_GATE_SECS));
    }

    #[test]
    fn test_adapt_shrinks_gate_for_short_windows() {
        let mut gates = TimeGates::default();
        // One aggregate, windows of one hour: target is 3 hours.
        let changed = gates.adapt("CALIB", 1, 4 * 3600, 4);
        assert_eq!(changed, Some(3 * 3600));
        assert_eq!(gates.get("CALIB"), 3 * 3600);
    }

    #[test]
    fn test_adapt_keeps_reasonable_gate() {
        let mut gates = TimeGates::default();
        // Target of 6 days is within a factor of ten of 10 days.
        assert_eq!(gates.adapt("CALIB", 2, 86_400, 1), None);
        assert_eq!(gates.get("CALIB"), DEFAULT_TIME_GATE_SECS);
    }

    #[test]
    fn test_adapt_caps_at_maximum() {
        let mut gates = TimeGates::new(3600);
        let changed = gates.adapt("CALIB", 50, 365 * 86_400, 1);
        assert_eq!(changed, Some(MAX_TIME_GATE_SECS));
    }

    #[test]
    fn test_adapt_without_windows_is_noop() {
        let mut gates = TimeGates::default();
        assert_eq!(gates.adapt("CALIB", 3, 0, 0), None);
    }
}
