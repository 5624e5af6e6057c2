//! Validity records: the applicability of one stored row version.
//!
//! A record is either read from a `<TABLE>VLD` row or synthesized as a gap,
//! which stands for "confirmed absence of data" over the query time gate.
//! The resolver in `condb-storage` folds the rows of one query into one
//! effective record per aggregate using [`ValidityRecord::trim`].

use crate::context::{ValidityContext, ValidityRange};
use crate::identity::{
    format_datetime, time_ceiling, time_floor, timestamp_from_secs, AggregateNo, DbNo, SeqNo,
    Task, Timestamp, UNDEFINED_AGGREGATE,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Data source label carried by synthesized gap records.
pub const GAP_SOURCE: &str = "Gap";

/// Data source label carried by records read from a backend.
pub const DATABASE_SOURCE: &str = "From Database";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityRecord {
    /// -1 for non-aggregated (or the global record of a multi-aggregate
    /// result), -2 when undefined, otherwise the aggregate index.
    pub aggregate_no: AggregateNo,
    pub range: ValidityRange,
    pub task: Task,
    /// 0 for gaps.
    pub seq_no: SeqNo,
    /// Cascade entry the record was read from. Not stored in the backend.
    pub db_no: DbNo,
    pub creation_date: Timestamp,
    pub insert_date: Timestamp,
    pub epoch: i32,
    pub reality: i32,
    pub is_gap: bool,
}

impl ValidityRecord {
    /// Build a record read from a validity row.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seq_no: SeqNo,
        aggregate_no: AggregateNo,
        range: ValidityRange,
        task: Task,
        creation_date: Timestamp,
        insert_date: Timestamp,
        epoch: i32,
        reality: i32,
    ) -> Self {
        Self {
            aggregate_no,
            range,
            task,
            seq_no,
            db_no: 0,
            creation_date,
            insert_date,
            epoch,
            reality,
            is_gap: false,
        }
    }

    /// The gap record of a standard query.
    ///
    /// Its window is the time gate `[ts - gate, ts + gate)` around the
    /// context, or the whole representable range when `full_window` is set
    /// (it is then narrowed by the time-boundary search).
    pub fn gap(context: &ValidityContext, task: Task, time_gate_secs: i64, full_window: bool) -> Self {
        let (start, end) = if full_window {
            (time_floor(), time_ceiling())
        } else {
            let secs = context.timestamp.timestamp();
            (
                timestamp_from_secs(secs - time_gate_secs),
                timestamp_from_secs(secs + time_gate_secs),
            )
        };
        let range = ValidityRange::new(
            context.detector.mask(),
            context.sim.mask(),
            start,
            end,
            GAP_SOURCE,
        );
        Self {
            aggregate_no: UNDEFINED_AGGREGATE,
            range,
            task,
            seq_no: 0,
            db_no: 0,
            creation_date: time_floor(),
            insert_date: time_floor(),
            epoch: 0,
            reality: 0,
            is_gap: true,
        }
    }

    /// Copy of this record assigned to another aggregate.
    pub fn with_aggregate(&self, aggregate_no: AggregateNo) -> Self {
        Self {
            aggregate_no,
            ..self.clone()
        }
    }

    pub fn time_start(&self) -> Timestamp {
        self.range.time_start
    }

    pub fn time_end(&self) -> Timestamp {
        self.range.time_end
    }

    pub fn set_time_window(&mut self, start: Timestamp, end: Timestamp) {
        self.range.time_start = start;
        self.range.time_end = end;
    }

    /// Intersect the time window with `[start, end)`.
    pub fn and_time_window(&mut self, start: Timestamp, end: Timestamp) {
        let new_start = self.range.time_start.max(start);
        let new_end = self.range.time_end.min(end);
        self.set_time_window(new_start, new_end);
    }

    /// True if `other` shares task and masks with this record but does not
    /// overlap it in time, i.e. this record cannot describe the same instant.
    pub fn has_expired(&self, other: &ValidityRecord) -> bool {
        other.task == self.task
            && other.range.detector_mask.intersects(self.range.detector_mask)
            && other.range.sim_mask.intersects(self.range.sim_mask)
            && (other.range.time_start >= self.range.time_end
                || other.range.time_end <= self.range.time_start)
    }

    /// Context flavour of [`has_expired`](Self::has_expired).
    pub fn has_expired_for(&self, context: &ValidityContext, task: Task) -> bool {
        let ts = context.timestamp;
        task == self.task
            && context.detector.mask().intersects(self.range.detector_mask)
            && context.sim.mask().intersects(self.range.sim_mask)
            && (ts >= self.range.time_end || ts < self.range.time_start)
    }

    pub fn is_compatible(&self, context: &ValidityContext, task: Task) -> bool {
        task == self.task && self.range.is_compatible(context)
    }

    /// Priority comparison used to resolve overlapping rows.
    ///
    /// Tables without an EPOCH column resolve by creation date; the others by
    /// epoch, then start time, then insertion date.
    pub fn is_higher_priority(&self, that: &ValidityRecord, use_creation_date: bool) -> bool {
        if use_creation_date {
            return self.creation_date > that.creation_date;
        }
        if self.epoch != that.epoch {
            return self.epoch > that.epoch;
        }
        if self.range.time_start != that.range.time_start {
            return self.range.time_start > that.range.time_start;
        }
        self.insert_date > that.insert_date
    }

    /// Fold one row (`other`, visited in priority order) into this slot.
    ///
    /// Only gap slots are affected and only by non-gap rows of the same
    /// aggregate. A row covering `query_time` replaces the gap and keeps the
    /// part of its window still inside the gap; a row entirely before or after
    /// the query time pushes the gap boundary back to that row's edge.
    pub fn trim(&mut self, query_time: &Timestamp, other: &ValidityRecord) {
        if self.aggregate_no != other.aggregate_no || other.is_gap {
            return;
        }
        if !self.is_gap {
            return;
        }

        let start = self.range.time_start;
        let end = self.range.time_end;
        let start_other = other.range.time_start;
        let end_other = other.range.time_end;

        if start_other <= *query_time && end_other > *query_time {
            let new_start = start.max(start_other);
            let new_end = end.min(end_other);
            *self = other.clone();
            self.set_time_window(new_start, new_end);
        } else if end_other <= *query_time {
            if start < end_other {
                self.set_time_window(end_other, end);
            }
        } else if start_other > *query_time && end > start_other {
            self.set_time_window(start, start_other);
        }
    }

    /// L2 cache name of a result holding only this record.
    pub fn l2_cache_name(&self) -> String {
        Self::l2_cache_name_for(self.seq_no, self.seq_no, &self.creation_date)
    }

    /// `"{lo}_[{hi}_]{timestamp}"` with white space turned into underscores.
    pub fn l2_cache_name_for(seq_lo: SeqNo, seq_hi: SeqNo, ts: &Timestamp) -> String {
        let mut name = format!("{}_", seq_lo);
        if seq_lo != seq_hi {
            name.push_str(&format!("{}_", seq_hi));
        }
        name.push_str(&format_datetime(ts));
        name.replace(' ', "_")
    }
}

impl fmt::Display for ValidityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SEQNO: {} AGGNO: {} TASK: {} DB: {} range: {} creation: {} insert: {} epoch: {}{}",
            self.seq_no,
            self.aggregate_no,
            self.task,
            self.db_no,
            self.range,
            format_datetime(&self.creation_date),
            format_datetime(&self.insert_date),
            self.epoch,
            if self.is_gap { " (gap)" } else { "" }
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================
