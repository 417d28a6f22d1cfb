//! Raw loader: delimited payloads into typed, columnar raw tables.
//!
//! Each dataset declares its required columns and their kinds. The header
//! row decides where each required column lives. Any other column is carried
//! along as text, after the required ones, so the raw table receives the
//! payload as published. Every value is parsed up front so a bad row fails
//! the partition before anything is written.

use crate::dataset::{ColumnKind, ColumnSpec, Dataset};
use crate::records::{ColumnData, RawTable};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LoadError {
    #[error("missing required column '{0}'")]
    MissingColumn(String),

    #[error("row {row}: expected {expected} fields, found {found}")]
    RaggedRow {
        row: u64,
        expected: u64,
        found: u64,
    },

    #[error("row {row}, column '{column}': invalid {kind} value '{value}'")]
    InvalidValue {
        row: u64,
        column: String,
        kind: &'static str,
        value: String,
    },

    #[error("line {line}: invalid snapshot record: {message}")]
    InvalidRecord { line: u64, message: String },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Parses one dataset's delimited payloads.
#[derive(Debug, Clone)]
pub struct RawLoader {
    columns: Vec<ColumnSpec>,
}

impl RawLoader {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    pub fn for_dataset(dataset: &Dataset) -> Self {
        Self::new(dataset.columns.clone())
    }

    /// Parse a decompressed payload. Row numbers in errors are 1-based data rows.
    pub fn load(&self, payload: &[u8]) -> Result<RawTable, LoadError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(payload);

        let headers = reader
            .headers()
            .map_err(|e| LoadError::Malformed(e.to_string()))?
            .clone();
        let positions = self
            .columns
            .iter()
            .map(|spec| {
                headers
                    .iter()
                    .position(|h| h.trim() == spec.name)
                    .ok_or_else(|| LoadError::MissingColumn(spec.name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut columns = self.columns.clone();
        let mut extras = Vec::new();
        for (pos, name) in headers.iter().enumerate() {
            let name = name.trim();
            // SQLite column names are case-insensitive.
            let known = columns.iter().any(|c| c.name.eq_ignore_ascii_case(name));
            if name.is_empty() || positions.contains(&pos) || known {
                continue;
            }
            columns.push(ColumnSpec::new(name, ColumnKind::Text));
            extras.push(pos);
        }

        let mut data: Vec<ColumnData> = columns
            .iter()
            .map(|spec| ColumnData::with_capacity(spec.kind, 1024))
            .collect();

        let mut record = csv::StringRecord::new();
        let mut row = 0u64;
        loop {
            match reader.read_record(&mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return Err(csv_error(e, row + 1)),
            }
            row += 1;
            let all_positions = positions.iter().chain(&extras);
            for ((spec, &pos), column) in columns.iter().zip(all_positions).zip(&mut data) {
                let raw = record.get(pos).unwrap_or("");
                push_value(column, spec, raw, row)?;
            }
        }

        Ok(RawTable::from_columns(columns, data))
    }
}

fn csv_error(err: csv::Error, row: u64) -> LoadError {
    match err.kind() {
        csv::ErrorKind::UnequalLengths {
            expected_len, len, ..
        } => LoadError::RaggedRow {
            row,
            expected: *expected_len,
            found: *len,
        },
        _ => LoadError::Malformed(err.to_string()),
    }
}

fn push_value(
    column: &mut ColumnData,
    spec: &ColumnSpec,
    raw: &str,
    row: u64,
) -> Result<(), LoadError> {
    let invalid = |kind: &'static str| LoadError::InvalidValue {
        row,
        column: spec.name.clone(),
        kind,
        value: raw.to_string(),
    };
    match column {
        ColumnData::Text(values) => values.push(raw.to_string()),
        ColumnData::Float(values) => {
            values.push(raw.trim().parse::<f64>().map_err(|_| invalid("float"))?)
        }
        ColumnData::Bool(values) => values.push(parse_bool(raw).ok_or_else(|| invalid("bool"))?),
        ColumnData::Timestamp(values) => {
            values.push(parse_timestamp(raw).ok_or_else(|| invalid("timestamp"))?)
        }
    }
    Ok(())
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "true" | "True" | "TRUE" | "1" => Some(true),
        "false" | "False" | "FALSE" | "0" => Some(false),
        _ => None,
    }
}

/// Accepts RFC 3339, ISO without zone, `YYYY-MM-DD HH:MM:SS`, a bare date,
/// or epoch milliseconds. Zoned inputs are converted to UTC.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .map(|dt| dt.naive_utc());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetRegistry, DEFAULT_NOTIONAL_TIERS};
    use crate::records::Cell;

    fn trades_loader() -> RawLoader {
        let registry = DatasetRegistry::builtin(&DEFAULT_NOTIONAL_TIERS);
        RawLoader::for_dataset(registry.get("non_mm_trades").unwrap())
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").unwrap()
    }

    #[test]
    fn loads_trades_with_extra_and_reordered_columns() {
        let payload = "\
coin,time,user,side,px,sz,hash,crossed,special_trade_type
BTC,2024-01-01T10:00:00.123,U1,B,100,2,0xabc,True,
BTC,2024-01-01 11:00:00,U1,B,102.5,1,0xdef,False,liquidation
";
        let table = trades_loader().load(payload.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.column("time"),
            Some(&ColumnData::Timestamp(vec![
                ts("2024-01-01T10:00:00.123"),
                ts("2024-01-01T11:00:00"),
            ]))
        );
        assert_eq!(table.column("px"), Some(&ColumnData::Float(vec![100.0, 102.5])));
        assert_eq!(table.column("crossed"), Some(&ColumnData::Bool(vec![true, false])));
        assert_eq!(table.row(1)[1], Cell::Text("U1"));

        // Unrequired columns follow the required ones as text.
        let names: Vec<&str> = table.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names.last(), Some(&"hash"));
        assert_eq!(
            table.column("hash"),
            Some(&ColumnData::Text(vec!["0xabc".into(), "0xdef".into()]))
        );
    }

    #[test]
    fn missing_required_column() {
        let payload = "time,user,coin,side,px,crossed,special_trade_type\n";
        assert_eq!(
            trades_loader().load(payload.as_bytes()).unwrap_err(),
            LoadError::MissingColumn("sz".into())
        );
    }

    #[test]
    fn ragged_row_is_rejected() {
        let payload = "\
time,user,coin,side,px,sz,crossed,special_trade_type
2024-01-01,U1,BTC,B,100,2,true,
2024-01-01,U1,BTC,B,100
";
        let err = trades_loader().load(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, LoadError::RaggedRow { row: 2, expected: 8, found: 5 }));
    }

    #[test]
    fn non_numeric_float_is_rejected() {
        let payload = "\
time,user,coin,side,px,sz,crossed,special_trade_type
2024-01-01,U1,BTC,B,abc,2,true,
";
        let err = trades_loader().load(payload.as_bytes()).unwrap_err();
        assert_eq!(
            err,
            LoadError::InvalidValue {
                row: 1,
                column: "px".into(),
                kind: "float",
                value: "abc".into(),
            }
        );
    }

    #[test]
    fn header_only_payload_is_empty_table() {
        let payload = "time,user,coin,side,px,sz,crossed,special_trade_type\n";
        assert!(trades_loader().load(payload.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn timestamp_inputs() {
        let expected = ts("2024-01-05T03:04:05");
        assert_eq!(parse_timestamp("2024-01-05T03:04:05Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-05T05:04:05+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-05T03:04:05"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-05 03:04:05"), Some(expected));
        assert_eq!(parse_timestamp("1704423845000"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-05"), Some(ts("2024-01-05T00:00:00")));
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn bool_inputs() {
        assert_eq!(parse_bool("True"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("yes"), None);
    }
}
