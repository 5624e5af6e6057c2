//! Query contexts and validity ranges.

use crate::flags::{Detector, DetectorMask, SimFlag, SimMask};
use crate::identity::{format_datetime, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The selector of a standard query: one detector, one sim flag, one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidityContext {
    pub detector: Detector,
    pub sim: SimFlag,
    pub timestamp: Timestamp,
}

impl ValidityContext {
    pub fn new(detector: Detector, sim: SimFlag, timestamp: Timestamp) -> Self {
        Self {
            detector,
            sim,
            timestamp,
        }
    }

    /// Same detector and time, different sim flag.
    pub fn with_sim(&self, sim: SimFlag) -> Self {
        Self { sim, ..*self }
    }

    pub fn with_timestamp(&self, timestamp: Timestamp) -> Self {
        Self { timestamp, ..*self }
    }
}

impl fmt::Display for ValidityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.detector,
            self.sim,
            format_datetime(&self.timestamp)
        )
    }
}

/// Applicability of a stored row: masks plus a half-open time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityRange {
    pub detector_mask: DetectorMask,
    pub sim_mask: SimMask,
    pub time_start: Timestamp,
    pub time_end: Timestamp,
    pub data_source: String,
}

impl ValidityRange {
    pub fn new(
        detector_mask: DetectorMask,
        sim_mask: SimMask,
        time_start: Timestamp,
        time_end: Timestamp,
        data_source: impl Into<String>,
    ) -> Self {
        Self {
            detector_mask,
            sim_mask,
            time_start,
            time_end,
            data_source: data_source.into(),
        }
    }

    /// True if the context falls inside this range.
    ///
    /// A mask dimension only rejects when the masks do not intersect and they
    /// are not both unknown (zero).
    pub fn is_compatible(&self, context: &ValidityContext) -> bool {
        let det = context.detector.mask();
        if !det.intersects(self.detector_mask) && !(det.is_empty() && self.detector_mask.is_empty())
        {
            return false;
        }
        let sim = context.sim.mask();
        if !sim.intersects(self.sim_mask) && !(sim.is_empty() && self.sim_mask.is_empty()) {
            return false;
        }
        context.timestamp >= self.time_start && context.timestamp < self.time_end
    }

    /// True if `ts` is inside `[start, end)`.
    pub fn contains(&self, ts: &Timestamp) -> bool {
        *ts >= self.time_start && *ts < self.time_end
    }

    /// Narrow this range to its overlap with `other`, masks included.
    pub fn trim_to(&mut self, other: &ValidityRange) {
        self.detector_mask &= other.detector_mask;
        self.sim_mask &= other.sim_mask;
        if self.time_start < other.time_start {
            self.time_start = other.time_start;
        }
        if self.time_end > other.time_end {
            self.time_end = other.time_end;
        }
        if !self.data_source.contains(&other.data_source) {
            self.data_source.push_str(", ");
            self.data_source.push_str(&other.data_source);
        }
    }

    /// Window length in whole seconds (negative when inverted).
    pub fn duration_secs(&self) -> i64 {
        self.time_end.timestamp() - self.time_start.timestamp()
    }
}

impl fmt::Display for ValidityRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#06x}|{:#06x}|{} .. {} from: {}",
            self.detector_mask.bits(),
            self.sim_mask.bits(),
            format_datetime(&self.time_start),
            format_datetime(&self.time_end),
            self.data_source
        )
    }
}
