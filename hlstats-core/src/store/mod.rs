//! Table store: raw and cache tables in the database.
//!
//! The pipeline only appends. Watermarks and committed-date sets are read
//! back from the `time` column, so a table's content is its own progress
//! record. The one exception is each table's sync floor: the first date a
//! run ever planned for it, which the table's rows cannot show when that
//! date failed.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::dataset::Dataset;
use crate::records::{CacheRow, RawTable};
use chrono::NaiveDate;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("unsupported database URI '{0}' (expected sqlite://<path>, sqlite::memory: or a file path)")]
    UnsupportedUri(String),

    #[error("dataset '{0}' has no raw table")]
    NoRawTable(String),

    #[error("row shape does not match table '{table}': {reason}")]
    Shape { table: String, reason: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Append-only access to a dataset's raw and cache tables.
pub trait TableStore: Send + Sync {
    /// Create the dataset's tables if they do not exist yet.
    fn ensure_tables(&self, dataset: &Dataset) -> Result<(), StoreError>;

    /// Largest `time` value of a table as stored, `None` when the table is
    /// empty or missing.
    fn max_time(&self, table: &str) -> Result<Option<String>, StoreError>;

    /// Distinct dates present in `table` on or after `since`.
    fn committed_dates(
        &self,
        table: &str,
        since: NaiveDate,
    ) -> Result<BTreeSet<NaiveDate>, StoreError>;

    /// Append parsed raw rows in one transaction. Returns the row count.
    fn append_raw(&self, dataset: &Dataset, rows: &RawTable) -> Result<usize, StoreError>;

    /// Append cache rows in one transaction. Returns the row count.
    fn append_cache(&self, dataset: &Dataset, rows: &[CacheRow]) -> Result<usize, StoreError>;

    /// Total rows of a table, zero when missing.
    fn row_count(&self, table: &str) -> Result<u64, StoreError>;

    /// First date ever planned for `table`, if recorded.
    fn sync_floor(&self, table: &str) -> Result<Option<NaiveDate>, StoreError>;

    /// Record `date` as the floor of `table` unless an earlier one exists.
    fn lower_sync_floor(&self, table: &str, date: NaiveDate) -> Result<(), StoreError>;
}

/// Open the store named by a database URI.
///
/// Accepts `sqlite://<path>`, `sqlite::memory:`, `sqlite://:memory:` and bare paths.
pub fn open_database(uri: &str) -> Result<SqliteStore, StoreError> {
    match parse_uri(uri)? {
        DatabaseLocation::Memory => SqliteStore::open_in_memory(),
        DatabaseLocation::File(path) => SqliteStore::open(path),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation<'a> {
    Memory,
    File(&'a str),
}

pub fn parse_uri(uri: &str) -> Result<DatabaseLocation<'_>, StoreError> {
    let uri = uri.trim();
    if uri == "sqlite::memory:" || uri == "sqlite://:memory:" || uri == ":memory:" {
        return Ok(DatabaseLocation::Memory);
    }
    if let Some(path) = uri.strip_prefix("sqlite://") {
        if path.is_empty() {
            return Err(StoreError::UnsupportedUri(uri.to_string()));
        }
        return Ok(DatabaseLocation::File(path));
    }
    if uri.is_empty() || uri.contains("://") {
        return Err(StoreError::UnsupportedUri(uri.to_string()));
    }
    Ok(DatabaseLocation::File(uri))
}
