//! Row types flowing through the pipeline: columnar raw tables and cache rows.

use crate::dataset::{ColumnKind, ColumnSpec, TIME_COLUMN};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Canonical text form of raw timestamps in the store.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Canonical text form of cache-table dates.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Values of one raw column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Text(Vec<String>),
    Float(Vec<f64>),
    Bool(Vec<bool>),
    Timestamp(Vec<NaiveDateTime>),
}

impl ColumnData {
    pub fn with_capacity(kind: ColumnKind, capacity: usize) -> Self {
        match kind {
            ColumnKind::Text => ColumnData::Text(Vec::with_capacity(capacity)),
            ColumnKind::Float => ColumnData::Float(Vec::with_capacity(capacity)),
            ColumnKind::Bool => ColumnData::Bool(Vec::with_capacity(capacity)),
            ColumnKind::Timestamp => ColumnData::Timestamp(Vec::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Text(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
            ColumnData::Timestamp(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, row: usize) -> Option<Cell<'_>> {
        match self {
            ColumnData::Text(v) => v.get(row).map(|s| Cell::Text(s)),
            ColumnData::Float(v) => v.get(row).map(|f| Cell::Float(*f)),
            ColumnData::Bool(v) => v.get(row).map(|b| Cell::Bool(*b)),
            ColumnData::Timestamp(v) => v.get(row).map(Cell::Timestamp),
        }
    }
}

/// Borrowed view of one raw value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell<'a> {
    Text(&'a str),
    Float(f64),
    Bool(bool),
    Timestamp(&'a NaiveDateTime),
}

/// Parsed raw rows of one partition, held column by column.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    columns: Vec<ColumnSpec>,
    data: Vec<ColumnData>,
    rows: usize,
}

impl RawTable {
    /// Build a table from parallel column specs and data.
    ///
    /// All columns must hold the same number of values.
    pub fn from_columns(columns: Vec<ColumnSpec>, data: Vec<ColumnData>) -> Self {
        debug_assert_eq!(columns.len(), data.len());
        let rows = data.first().map(ColumnData::len).unwrap_or(0);
        debug_assert!(data.iter().all(|d| d.len() == rows));
        Self {
            columns,
            data,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .map(|i| &self.data[i])
    }

    /// Values of row `row` in column order.
    pub fn row(&self, row: usize) -> Vec<Cell<'_>> {
        self.data.iter().filter_map(|d| d.cell(row)).collect()
    }

    /// Distinct calendar dates of the time column.
    pub fn dates(&self) -> BTreeSet<NaiveDate> {
        match self.column(TIME_COLUMN) {
            Some(ColumnData::Timestamp(ts)) => ts.iter().map(|t| t.date()).collect(),
            _ => BTreeSet::new(),
        }
    }
}

/// Group-by key value of a cache row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Text(String),
    Bool(bool),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Text(s) => write!(f, "{s}"),
            KeyValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// One aggregated row of a cache table.
///
/// `keys` and `metrics` follow the dataset's `group_keys` and `metric_names()` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    pub date: NaiveDate,
    pub keys: Vec<KeyValue>,
    pub metrics: Vec<f64>,
}

impl CacheRow {
    /// Metric value by position in `metric_names`.
    pub fn metric(&self, names: &[String], name: &str) -> Option<f64> {
        names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.metrics.get(i).copied())
    }
}
