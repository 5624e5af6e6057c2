//! Row access.
//!
//! [`RowReader`] walks one row of a [`RowSet`] either in column order or by
//! column name. [`TableRow`] is the contract every row type of a conditions
//! table implements so that results can be filled, indexed and cached.

use crate::backend::{RowSet, SqlValue};
use condb_core::{
    parse_datetime, timestamp_from_secs, AggregateNo, DbNo, DetectorMask, RowError, SeqNo, SimMask,
    Timestamp, ValidityRange, ValidityRecord, DATABASE_SOURCE, NON_AGGREGATED,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

// ============================================================================
// ROW READER
// ============================================================================

/// Cursor over the values of one row.
#[derive(Debug, Clone)]
pub struct RowReader<'a> {
    columns: &'a [String],
    values: &'a [SqlValue],
    first: usize,
    pos: usize,
    fill_options: &'a str,
}

impl<'a> RowReader<'a> {
    pub fn new(columns: &'a [String], values: &'a [SqlValue]) -> Self {
        Self {
            columns,
            values,
            first: 0,
            pos: 0,
            fill_options: "",
        }
    }

    /// Reader over a data-table row.
    ///
    /// The leading `SEQNO` and `ROW_COUNTER` columns are bookkeeping, not row
    /// state, so sequential reads start after them.
    pub fn for_data_row(columns: &'a [String], values: &'a [SqlValue]) -> Self {
        let mut first = 0;
        for name in ["SEQNO", "ROW_COUNTER"] {
            if columns
                .get(first)
                .is_some_and(|c| c.eq_ignore_ascii_case(name))
            {
                first += 1;
            }
        }
        Self {
            columns,
            values,
            first,
            pos: first,
            fill_options: "",
        }
    }

    /// Attach the caller's fill options, free text a row type may interpret.
    pub fn with_fill_options(mut self, fill_options: &'a str) -> Self {
        self.fill_options = fill_options;
        self
    }

    pub fn fill_options(&self) -> &'a str {
        self.fill_options
    }

    pub fn from_row_set(set: &'a RowSet, row: usize) -> Option<Self> {
        set.rows().get(row).map(|values| Self::new(set.columns(), values))
    }

    /// Number of columns available to sequential reads.
    pub fn num_columns(&self) -> usize {
        self.columns.len().saturating_sub(self.first)
    }

    /// Zero-based position of the next sequential read.
    pub fn position(&self) -> usize {
        self.pos - self.first
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Name of the column the next sequential read returns.
    pub fn current_column(&self) -> Option<&'a str> {
        self.columns.get(self.pos).map(String::as_str)
    }

    /// The `SEQNO` of the row, if it has one.
    pub fn seq_no(&self) -> Option<SeqNo> {
        self.get("SEQNO")
            .ok()
            .and_then(SqlValue::as_i64)
            .and_then(|v| SeqNo::try_from(v).ok())
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    fn column_label(&self, idx: usize) -> String {
        self.columns
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("#{}", idx))
    }

    fn convert<T>(
        &self,
        idx: usize,
        value: &SqlValue,
        expected: &str,
        f: impl FnOnce(&SqlValue) -> Option<T>,
    ) -> Result<T, RowError> {
        f(value).ok_or_else(|| RowError::TypeMismatch {
            column: self.column_label(idx),
            expected: expected.to_string(),
            found: value.type_name().to_string(),
        })
    }

    // ------------------------------------------------------------------------
    // Sequential access
    // ------------------------------------------------------------------------

    pub fn next_value(&mut self) -> Result<&'a SqlValue, RowError> {
        let value = self.values.get(self.pos).ok_or(RowError::Exhausted {
            columns: self.num_columns(),
        })?;
        self.pos += 1;
        Ok(value)
    }

    pub fn skip(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.values.len());
    }

    pub fn next_i64(&mut self) -> Result<i64, RowError> {
        let idx = self.pos;
        let value = self.next_value()?;
        self.convert(idx, value, "integer", SqlValue::as_i64)
    }

    pub fn next_i32(&mut self) -> Result<i32, RowError> {
        let idx = self.pos;
        let value = self.next_value()?;
        self.convert(idx, value, "i32", |v| v.as_i64().and_then(|n| i32::try_from(n).ok()))
    }

    pub fn next_u32(&mut self) -> Result<u32, RowError> {
        let idx = self.pos;
        let value = self.next_value()?;
        self.convert(idx, value, "u32", |v| v.as_i64().and_then(|n| u32::try_from(n).ok()))
    }

    pub fn next_f64(&mut self) -> Result<f64, RowError> {
        let idx = self.pos;
        let value = self.next_value()?;
        self.convert(idx, value, "real", SqlValue::as_f64)
    }

    pub fn next_bool(&mut self) -> Result<bool, RowError> {
        Ok(self.next_i64()? != 0)
    }

    /// Text of the next column; NULL reads as an empty string.
    pub fn next_string(&mut self) -> Result<String, RowError> {
        Ok(self.next_value()?.as_text().unwrap_or_default())
    }

    pub fn next_timestamp(&mut self) -> Result<Timestamp, RowError> {
        let idx = self.pos;
        let value = self.next_value()?;
        self.convert(idx, value, "datetime", value_to_timestamp)
    }

    // ------------------------------------------------------------------------
    // Named access
    // ------------------------------------------------------------------------

    pub fn get(&self, name: &str) -> Result<&'a SqlValue, RowError> {
        self.column_index(name)
            .and_then(|idx| self.values.get(idx))
            .ok_or_else(|| RowError::MissingColumn {
                column: name.to_string(),
            })
    }

    fn get_converted<T>(
        &self,
        name: &str,
        expected: &str,
        f: impl FnOnce(&SqlValue) -> Option<T>,
    ) -> Result<T, RowError> {
        let value = self.get(name)?;
        f(value).ok_or_else(|| RowError::TypeMismatch {
            column: name.to_string(),
            expected: expected.to_string(),
            found: value.type_name().to_string(),
        })
    }

    pub fn get_i64(&self, name: &str) -> Result<i64, RowError> {
        self.get_converted(name, "integer", SqlValue::as_i64)
    }

    pub fn get_i32(&self, name: &str) -> Result<i32, RowError> {
        self.get_converted(name, "i32", |v| v.as_i64().and_then(|n| i32::try_from(n).ok()))
    }

    pub fn get_u32(&self, name: &str) -> Result<u32, RowError> {
        self.get_converted(name, "u32", |v| v.as_i64().and_then(|n| u32::try_from(n).ok()))
    }

    pub fn get_f64(&self, name: &str) -> Result<f64, RowError> {
        self.get_converted(name, "real", SqlValue::as_f64)
    }

    pub fn get_string(&self, name: &str) -> Result<String, RowError> {
        Ok(self.get(name)?.as_text().unwrap_or_default())
    }

    pub fn get_timestamp(&self, name: &str) -> Result<Timestamp, RowError> {
        self.get_converted(name, "datetime", value_to_timestamp)
    }
}

/// DATETIME text, or seconds since the epoch.
fn value_to_timestamp(value: &SqlValue) -> Option<Timestamp> {
    match value {
        SqlValue::Text(s) => parse_datetime(s),
        SqlValue::Integer(secs) => Some(timestamp_from_secs(*secs)),
        SqlValue::Real(secs) => Some(timestamp_from_secs(*secs as i64)),
        SqlValue::Null => None,
    }
}

// ============================================================================
// TABLE ROW CONTRACT
// ============================================================================

/// A row type of a conditions table.
///
/// Rows are immutable once filled. The serde bounds let results be written
/// to and restored from the L2 cache.
pub trait TableRow: Clone + fmt::Debug + Serialize + DeserializeOwned + 'static {
    /// Name of the row type, part of cache keys and fingerprints.
    fn row_name() -> &'static str;

    /// Build a row from the data columns of one table row. `vrec` is the
    /// validity record the row belongs to, when known.
    fn fill(reader: &mut RowReader<'_>, vrec: Option<&ValidityRecord>) -> Result<Self, RowError>;

    /// Natural index used by `row_by_index`; `position` is the row's
    /// position in its result.
    fn index(&self, position: u32) -> u32 {
        position
    }

    /// Aggregate the row belongs to.
    fn aggregate_no(&self) -> AggregateNo {
        NON_AGGREGATED
    }

    fn can_l2_cache() -> bool {
        false
    }
}

/// Build a validity record from a `<TABLE>VLD` row.
///
/// `EPOCH` and `REALITY` are optional columns; tables without them read 0.
pub fn read_validity_record(reader: &RowReader<'_>, db_no: DbNo) -> Result<ValidityRecord, RowError> {
    let (epoch, reality) = if reader.has_column("EPOCH") {
        (reader.get_i32("EPOCH")?, reader.get_i32("REALITY").unwrap_or(0))
    } else {
        (0, 0)
    };
    let range = ValidityRange::new(
        DetectorMask::from_bits_retain(reader.get_u32("DETECTORMASK")?),
        SimMask::from_bits_retain(reader.get_u32("SIMMASK")?),
        reader.get_timestamp("TIMESTART")?,
        reader.get_timestamp("TIMEEND")?,
        DATABASE_SOURCE,
    );
    let mut vrec = ValidityRecord::new(
        reader.get_u32("SEQNO")?,
        reader.get_i32("AGGREGATENO")?,
        range,
        reader.get_i32("TASK")?,
        reader.get_timestamp("CREATIONDATE")?,
        reader.get_timestamp("INSERTDATE")?,
        epoch,
        reality,
    );
    vrec.db_no = db_no;
    Ok(vrec)
}

/// Every validity record of a row set; unreadable rows are skipped with an
/// error event.
pub fn read_validity_records(set: &RowSet, db_no: DbNo, table: &str) -> Vec<ValidityRecord> {
    set.rows()
        .iter()
        .filter_map(|values| {
            let reader = RowReader::new(set.columns(), values);
            match read_validity_record(&reader, db_no) {
                Ok(vrec) => Some(vrec),
                Err(e) => {
                    tracing::error!(table, db_no, error = %e, "Unreadable validity row");
                    None
                }
            }
        })
        .collect()
}
