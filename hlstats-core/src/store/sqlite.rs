//! SQLite table store.

use super::{StoreError, TableStore};
use crate::dataset::{ColumnKind, Dataset, TIME_COLUMN};
use crate::records::{format_date, format_timestamp, CacheRow, Cell, KeyValue, RawTable, DATE_FORMAT};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

const FILE_PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
";

const SYNC_FLOOR_TABLE: &str = "hlstats_sync_floor";

const SYNC_FLOOR_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS hlstats_sync_floor (
    table_name TEXT PRIMARY KEY,
    floor TEXT NOT NULL
);
";

/// Table store backed by one SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(FILE_PRAGMAS)?;
        conn.execute_batch(SYNC_FLOOR_SCHEMA)?;
        debug!(path = %path.as_ref().display(), "opened sqlite store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SYNC_FLOOR_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_table(
        conn: &Connection,
        table: &str,
        columns: &[(String, &'static str)],
    ) -> Result<(), StoreError> {
        let defs = columns
            .iter()
            .map(|(name, ty)| format!("{} {ty}", quote(name)))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} ({defs});
             CREATE INDEX IF NOT EXISTS {idx} ON {t} ({time});",
            t = quote(table),
            idx = quote(&format!("idx_{table}_time")),
            time = quote(TIME_COLUMN),
        ))?;
        Ok(())
    }

    fn insert_all(
        &self,
        table: &str,
        columns: &[String],
        rows: impl Iterator<Item = Vec<Value>>,
    ) -> Result<usize, StoreError> {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(table),
            columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            (1..=columns.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", "),
        );

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(&sql)?;
            for values in rows {
                stmt.execute(params_from_iter(values))?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }
}

/// Add TEXT columns for any of `columns` the table does not have yet.
fn add_missing_columns(conn: &Connection, table: &str, columns: &[String]) -> Result<(), StoreError> {
    let existing = {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .map(|name| name.map(|n| n.to_ascii_lowercase()))
            .collect::<Result<BTreeSet<_>, _>>()?;
        names
    };
    for name in columns
        .iter()
        .filter(|c| !existing.contains(&c.to_ascii_lowercase()))
    {
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} TEXT",
            quote(table),
            quote(name)
        ))?;
        debug!(table, column = %name, "added raw column");
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
    Ok(stmt.exists([table])?)
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Text | ColumnKind::Timestamp => "TEXT",
        ColumnKind::Float => "REAL",
        ColumnKind::Bool => "INTEGER",
    }
}

/// Cache table layout: `time` (date), group keys, metrics.
fn cache_columns(dataset: &Dataset) -> Vec<(String, &'static str)> {
    let mut columns = vec![(TIME_COLUMN.to_string(), "TEXT")];
    columns.extend(
        dataset
            .group_keys
            .iter()
            .map(|k| (k.name.clone(), sql_type(k.kind))),
    );
    columns.extend(dataset.metric_names().into_iter().map(|m| (m, "REAL")));
    columns
}

fn cell_value(cell: Cell<'_>) -> Value {
    match cell {
        Cell::Text(s) => Value::Text(s.to_string()),
        Cell::Float(f) => Value::Real(f),
        Cell::Bool(b) => Value::Integer(b as i64),
        Cell::Timestamp(ts) => Value::Text(format_timestamp(ts)),
    }
}

fn key_value(key: &KeyValue) -> Value {
    match key {
        KeyValue::Text(s) => Value::Text(s.clone()),
        KeyValue::Bool(b) => Value::Integer(*b as i64),
    }
}

impl TableStore for SqliteStore {
    fn ensure_tables(&self, dataset: &Dataset) -> Result<(), StoreError> {
        let conn = self.lock();
        if let Some(raw) = &dataset.raw_table {
            let columns: Vec<_> = dataset
                .columns
                .iter()
                .map(|c| (c.name.clone(), sql_type(c.kind)))
                .collect();
            Self::create_table(&conn, raw, &columns)?;
        }
        Self::create_table(&conn, &dataset.cache_table, &cache_columns(dataset))
    }

    fn max_time(&self, table: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        if !table_exists(&conn, table)? {
            return Ok(None);
        }
        let max: Option<Option<String>> = conn
            .query_row(
                &format!("SELECT max({}) FROM {}", quote(TIME_COLUMN), quote(table)),
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(max.flatten())
    }

    fn committed_dates(
        &self,
        table: &str,
        since: NaiveDate,
    ) -> Result<BTreeSet<NaiveDate>, StoreError> {
        let conn = self.lock();
        if !table_exists(&conn, table)? {
            return Ok(BTreeSet::new());
        }
        let time = quote(TIME_COLUMN);
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT substr({time}, 1, 10) FROM {} WHERE {time} >= ?1",
            quote(table)
        ))?;
        let rows = stmt.query_map([format_date(since)], |row| row.get::<_, String>(0))?;

        let mut dates = BTreeSet::new();
        for prefix in rows {
            let prefix = prefix?;
            match NaiveDate::parse_from_str(&prefix, DATE_FORMAT) {
                Ok(date) => {
                    dates.insert(date);
                }
                Err(_) => warn!(table, value = %prefix, "ignoring unparseable time value"),
            }
        }
        Ok(dates)
    }

    fn append_raw(&self, dataset: &Dataset, rows: &RawTable) -> Result<usize, StoreError> {
        let table = dataset
            .raw_table
            .as_deref()
            .ok_or_else(|| StoreError::NoRawTable(dataset.name.clone()))?;
        let names: Vec<String> = rows.columns().iter().map(|c| c.name.clone()).collect();
        let expected: Vec<&str> = dataset.columns.iter().map(|c| c.name.as_str()).collect();
        let required = names.len() >= expected.len()
            && names.iter().zip(&expected).all(|(n, e)| n == e);
        if !required {
            return Err(StoreError::Shape {
                table: table.to_string(),
                reason: format!("columns {names:?}, expected {expected:?} first"),
            });
        }
        if names.len() > expected.len() {
            add_missing_columns(&self.lock(), table, &names[expected.len()..])?;
        }

        let written = self.insert_all(
            table,
            &names,
            (0..rows.len()).map(|i| rows.row(i).into_iter().map(cell_value).collect()),
        )?;
        debug!(table, rows = written, "appended raw rows");
        Ok(written)
    }

    fn append_cache(&self, dataset: &Dataset, rows: &[CacheRow]) -> Result<usize, StoreError> {
        let columns: Vec<String> = cache_columns(dataset).into_iter().map(|(n, _)| n).collect();
        let keys = dataset.group_keys.len();
        let metrics = columns.len() - 1 - keys;
        if let Some(bad) = rows
            .iter()
            .find(|r| r.keys.len() != keys || r.metrics.len() != metrics)
        {
            return Err(StoreError::Shape {
                table: dataset.cache_table.clone(),
                reason: format!(
                    "row has {} keys and {} metrics, expected {keys} and {metrics}",
                    bad.keys.len(),
                    bad.metrics.len()
                ),
            });
        }

        let written = self.insert_all(
            &dataset.cache_table,
            &columns,
            rows.iter().map(|r| {
                let mut values = Vec::with_capacity(columns.len());
                values.push(Value::Text(format_date(r.date)));
                values.extend(r.keys.iter().map(key_value));
                values.extend(r.metrics.iter().map(|m| Value::Real(*m)));
                values
            }),
        )?;
        debug!(table = %dataset.cache_table, rows = written, "appended cache rows");
        Ok(written)
    }

    fn row_count(&self, table: &str) -> Result<u64, StoreError> {
        let conn = self.lock();
        if !table_exists(&conn, table)? {
            return Ok(0);
        }
        let count: i64 = conn.query_row(
            &format!("SELECT count(*) FROM {}", quote(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn sync_floor(&self, table: &str) -> Result<Option<NaiveDate>, StoreError> {
        let floor: Option<String> = self
            .lock()
            .query_row(
                &format!("SELECT floor FROM {SYNC_FLOOR_TABLE} WHERE table_name = ?1"),
                [table],
                |row| row.get(0),
            )
            .optional()?;
        floor
            .map(|f| {
                NaiveDate::parse_from_str(&f, DATE_FORMAT).map_err(|_| {
                    StoreError::Database(format!("unparseable sync floor '{f}' for {table}"))
                })
            })
            .transpose()
    }

    fn lower_sync_floor(&self, table: &str, date: NaiveDate) -> Result<(), StoreError> {
        self.lock().execute(
            &format!(
                "INSERT INTO {SYNC_FLOOR_TABLE} (table_name, floor) VALUES (?1, ?2)
                 ON CONFLICT(table_name) DO UPDATE SET floor = min(floor, excluded.floor)"
            ),
            [table, format_date(date).as_str()],
        )?;
        Ok(())
    }
}
