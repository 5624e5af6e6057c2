//! Result fingerprints.
//!
//! A [`ResultKey`] summarises a query result by table, row type and the
//! `(SEQNO, CREATIONDATE)` pairs of its validity records. Two results with
//! equal keys hold the same data, which lets callers detect that a new query
//! returned what they already have.

use crate::identity::{compute_content_hash, format_datetime, SeqNo, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrecKey {
    pub seq_no: SeqNo,
    pub creation_date: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultKey {
    table_name: String,
    row_name: String,
    vrec_keys: Vec<VrecKey>,
}

impl ResultKey {
    pub fn new(table_name: impl Into<String>, row_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            row_name: row_name.into(),
            vrec_keys: Vec::new(),
        }
    }

    pub fn add_vrec_key(&mut self, seq_no: SeqNo, creation_date: Timestamp) {
        self.vrec_keys.push(VrecKey {
            seq_no,
            creation_date,
        });
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn row_name(&self) -> &str {
        &self.row_name
    }

    pub fn num_vrecs(&self) -> usize {
        self.vrec_keys.len()
    }

    pub fn vrec_keys(&self) -> &[VrecKey] {
        &self.vrec_keys
    }

    /// `"TABLE::Row"`.
    pub fn table_row_name(&self) -> String {
        format!("{}::{}", self.table_name, self.row_name)
    }

    /// Compare two keys.
    ///
    /// Returns -2 if the tables differ, -1 if only the row types differ,
    /// otherwise the fraction of records of the larger key whose SEQNO has
    /// the same creation date in the smaller one (1 is a perfect match, and
    /// two keys without records compare as 0).
    pub fn compare(&self, that: &ResultKey) -> f32 {
        if self.table_name != that.table_name {
            return -2.0;
        }
        if self.row_name != that.row_name {
            return -1.0;
        }

        let (big, small) = if that.num_vrecs() > self.num_vrecs() {
            (that, self)
        } else {
            (self, that)
        };
        let num_vrecs = big.num_vrecs();
        if num_vrecs == 0 {
            return 0.0;
        }

        let created: HashMap<SeqNo, Timestamp> = big
            .vrec_keys
            .iter()
            .map(|k| (k.seq_no, k.creation_date))
            .collect();
        let matched = small
            .vrec_keys
            .iter()
            .filter(|k| created.get(&k.seq_no) == Some(&k.creation_date))
            .count();
        tracing::trace!(
            this = %self,
            that = %that,
            matched,
            num_vrecs,
            "Compared result keys"
        );
        matched as f32 / num_vrecs as f32
    }

    pub fn is_equal_to(&self, that: &ResultKey) -> bool {
        self.compare(that) == 1.0
    }

    /// Hex SHA-256 of the textual summary.
    pub fn digest(&self) -> String {
        let mut text = self.table_row_name();
        for key in &self.vrec_keys {
            text.push_str(&format!("|{};{}", key.seq_no, format_datetime(&key.creation_date)));
        }
        hex::encode(compute_content_hash(text.as_bytes()))
    }
}

impl fmt::Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table:{} row:{}", self.table_name, self.row_name)?;
        let Some(first) = self.vrec_keys.first() else {
            return write!(f, " No vrecs");
        };

        let n = self.vrec_keys.len();
        write!(f, ".  {} vrec", n)?;
        if n > 1 {
            write!(f, "s (seqno min..max;creationdate min..max): ")?;
        } else {
            write!(f, " (seqno;creationdate): ")?;
        }

        let (mut seq_min, mut seq_max) = (first.seq_no, first.seq_no);
        let (mut ts_min, mut ts_max) = (first.creation_date, first.creation_date);
        for key in &self.vrec_keys[1..] {
            seq_min = seq_min.min(key.seq_no);
            seq_max = seq_max.max(key.seq_no);
            ts_min = ts_min.min(key.creation_date);
            ts_max = ts_max.max(key.creation_date);
        }
        write!(f, "{}", seq_min)?;
        if seq_min < seq_max {
            write!(f, "..{}", seq_max)?;
        }
        write!(f, ";{}", format_datetime(&ts_min))?;
        if ts_min < ts_max {
            write!(f, "..{}", format_datetime(&ts_max))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::parse_datetime;

    fn ts(s: &str) -> Timestamp {
        parse_datetime(s).unwrap()
    }

    fn make_test_key(pairs: &[(SeqNo, &str)]) -> ResultKey {
        let mut key = ResultKey::new("CALIB", "GainRow");
        for (seq_no, created) in pairs {
            key.add_vrec_key(*seq_no, ts(created));
        }
        key
    }

    #[test]
    fn test_display_without_vrecs() {
        let key = ResultKey::new("CALIB", "GainRow");
        assert_eq!(key.to_string(), "Table:CALIB row:GainRow No vrecs");
        assert_eq!(key.table_row_name(), "CALIB::GainRow");
    }

    #[test]
    fn test_display_single_vrec() {
        let key = make_test_key(&[(7, "2020-03-01 00:00:00")]);
        assert_eq!(
            key.to_string(),
            "Table:CALIB row:GainRow.  1 vrec (seqno;creationdate): 7;2020-03-01 00:00:00"
        );
    }

    #[test]
    fn test_display_ranges() {
        let key = make_test_key(&[(9, "2020-03-01 00:00:00"), (4, "2020-01-01 00:00:00")]);
        assert_eq!(
            key.to_string(),
            "Table:CALIB row:GainRow.  2 vrecs (seqno min..max;creationdate min..max): \
             4..9;2020-01-01 00:00:00..2020-03-01 00:00:00"
        );
    }

    #[test]
    fn test_compare_names() {
        let a = make_test_key(&[(1, "2020-01-01")]);
        let other_table = ResultKey::new("PED", "GainRow");
        let other_row = ResultKey::new("CALIB", "PedRow");
        assert_eq!(a.compare(&other_table), -2.0);
        assert_eq!(a.compare(&other_row), -1.0);
    }

    #[test]
    fn test_compare_fraction() {
        let a = make_test_key(&[(1, "2020-01-01"), (2, "2020-02-01"), (3, "2020-03-01"), (4, "2020-04-01")]);
        let b = make_test_key(&[(1, "2020-01-01"), (2, "2020-02-01"), (3, "2021-03-01")]);
        assert_eq!(a.compare(&b), 0.5);
        assert_eq!(b.compare(&a), 0.5);
        assert!(a.is_equal_to(&a.clone()));
        assert!(!a.is_equal_to(&b));
    }

    #[test]
    fn test_compare_empty_keys() {
        let a = ResultKey::new("CALIB", "GainRow");
        assert_eq!(a.compare(&a.clone()), 0.0);
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = make_test_key(&[(1, "2020-01-01")]);
        let b = make_test_key(&[(1, "2020-01-02")]);
        assert_eq!(a.digest(), a.clone().digest());
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
