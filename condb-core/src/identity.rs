//! Identity and time types shared by every condb crate

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Sequence number identifying one validity record and the rows it owns.
pub type SeqNo = u32;

/// Position of a backend inside a cascade, 0 being the highest priority.
pub type DbNo = usize;

/// Task discriminator stored in every validity row.
pub type Task = i32;

/// Aggregate index partitioning the rows of one table.
pub type AggregateNo = i32;

/// SHA-256 content hash used by result fingerprints.
pub type ContentHash = [u8; 32];

/// Task value that matches every stored task.
pub const ANY_TASK: Task = -1;

/// Task assumed when the caller does not pick one.
pub const DEFAULT_TASK: Task = 0;

/// Aggregate number of non-aggregated tables, also used for the
/// "global" record of an aggregated result.
pub const NON_AGGREGATED: AggregateNo = -1;

/// Aggregate number of a record that was never filled.
pub const UNDEFINED_AGGREGATE: AggregateNo = -2;

/// Highest sequence number a local (per-backend) counter may hand out.
pub const MAX_LOCAL_SEQNO: SeqNo = 99_999_999;

/// Text layout of DATETIME columns.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// True if the sequence number lies in the local band.
pub fn is_local_seqno(seq_no: SeqNo) -> bool {
    seq_no <= MAX_LOCAL_SEQNO
}

/// Earliest representable validity time (the Unix epoch).
pub fn time_floor() -> Timestamp {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Latest representable validity time (`0x7FFFFFFF` seconds).
pub fn time_ceiling() -> Timestamp {
    Utc.timestamp_opt(i64::from(i32::MAX), 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Build a timestamp from seconds since the epoch, clamped to the
/// representable validity range.
pub fn timestamp_from_secs(secs: i64) -> Timestamp {
    let secs = secs.clamp(0, i64::from(i32::MAX));
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(time_floor)
}

/// Render a timestamp the way DATETIME columns store it.
pub fn format_datetime(ts: &Timestamp) -> String {
    ts.format(DATETIME_FORMAT).to_string()
}

/// Parse a DATETIME column value.
///
/// Accepts `YYYY-MM-DD hh:mm:ss` with optional fractional seconds, and a bare
/// date which is taken as midnight.
pub fn parse_datetime(text: &str) -> Option<Timestamp> {
    let text = text.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, DATETIME_FORMAT) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_round_trip() {
        let ts = parse_datetime("2020-03-01 12:30:05").unwrap();
        assert_eq!(format_datetime(&ts), "2020-03-01 12:30:05");
    }

    #[test]
    fn test_parse_datetime_variants() {
        assert_eq!(
            parse_datetime("2020-03-01"),
            parse_datetime("2020-03-01 00:00:00")
        );
        let fractional = parse_datetime("2020-03-01 00:00:00.250").unwrap();
        assert_eq!(fractional.timestamp_subsec_millis(), 250);
        assert!(parse_datetime("not a date").is_none());
    }

    #[test]
    fn test_time_limits() {
        assert_eq!(time_floor().timestamp(), 0);
        assert_eq!(time_ceiling().timestamp(), 0x7FFF_FFFF);
        assert_eq!(timestamp_from_secs(-5), time_floor());
        assert_eq!(timestamp_from_secs(i64::MAX), time_ceiling());
    }

    #[test]
    fn test_local_seqno_band() {
        assert!(is_local_seqno(1));
        assert!(is_local_seqno(MAX_LOCAL_SEQNO));
        assert!(!is_local_seqno(MAX_LOCAL_SEQNO + 1));
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(compute_content_hash(b"abc"), compute_content_hash(b"abc"));
        assert_ne!(compute_content_hash(b"abc"), compute_content_hash(b"abd"));
    }
}
