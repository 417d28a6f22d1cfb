//! Watermarks: how far each table has been filled.
//!
//! A table's watermark is the date of its largest `time` value. It is read
//! from the table at the start of every run and never cached, so the only
//! way it moves is a successful append.

use crate::partition::missing_dates;
use crate::store::{StoreError, TableStore};
use chrono::{Days, NaiveDate};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

/// Default window seeded for an empty table.
pub const DEFAULT_LOOKBACK_DAYS: u32 = 30;

/// Default window searched for missing cache dates.
pub const DEFAULT_RETRY_WINDOW_DAYS: u32 = 30;

/// Longest lookback or retry window a configuration may ask for.
pub const MAX_WINDOW_DAYS: u32 = 3_650;

/// Reads watermarks and committed dates from the table store.
#[derive(Clone)]
pub struct WatermarkTracker {
    store: Arc<dyn TableStore>,
}

impl WatermarkTracker {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    /// Date part of the table's maximum `time`, `None` when empty.
    pub fn latest_date(&self, table: &str) -> Result<Option<NaiveDate>, StoreError> {
        let Some(max) = self.store.max_time(table)? else {
            return Ok(None);
        };
        match parse_date_prefix(&max) {
            Some(date) => Ok(Some(date)),
            None => {
                warn!(table, value = %max, "watermark value has no date prefix");
                Err(StoreError::Database(format!(
                    "unparseable time value '{max}' in {table}"
                )))
            }
        }
    }

    pub fn committed_dates(
        &self,
        table: &str,
        since: NaiveDate,
    ) -> Result<BTreeSet<NaiveDate>, StoreError> {
        self.store.committed_dates(table, since)
    }

    /// Start of the next plan: the watermark, or `today - lookback_days` for
    /// an empty table. `None` when the lookback reaches past the calendar.
    pub fn start_date(
        watermark: Option<NaiveDate>,
        today: NaiveDate,
        lookback_days: u32,
    ) -> Option<NaiveDate> {
        match watermark {
            Some(watermark) => Some(watermark),
            None => today.checked_sub_days(Days::new(lookback_days.into())),
        }
    }

    /// Record the first date planned for an empty table. An earlier recorded
    /// date is kept.
    pub fn record_floor(&self, table: &str, first_planned: NaiveDate) -> Result<(), StoreError> {
        self.store.lower_sync_floor(table, first_planned)
    }

    /// Dates with no rows inside the retry window, up to the watermark.
    ///
    /// The search starts at the table's recorded floor (the first date ever
    /// planned for it) or, for tables filled before floors were recorded, at
    /// the earliest date committed inside the window.
    pub fn gap_dates(
        &self,
        table: &str,
        watermark: Option<NaiveDate>,
        today: NaiveDate,
        retry_window_days: u32,
    ) -> Result<BTreeSet<NaiveDate>, StoreError> {
        let Some(watermark) = watermark else {
            return Ok(BTreeSet::new());
        };
        if retry_window_days == 0 {
            return Ok(BTreeSet::new());
        }
        let window_start = today
            .checked_sub_days(Days::new(retry_window_days.into()))
            .unwrap_or(NaiveDate::MIN);
        let committed = self.store.committed_dates(table, window_start)?;
        let from = match (self.store.sync_floor(table)?, committed.first()) {
            (Some(floor), _) => floor.max(window_start),
            (None, Some(earliest)) => *earliest,
            (None, None) => return Ok(BTreeSet::new()),
        };
        Ok(missing_dates(&committed, from, watermark))
    }
}

fn parse_date_prefix(value: &str) -> Option<NaiveDate> {
    let prefix = value.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetRegistry, DEFAULT_NOTIONAL_TIERS};
    use crate::records::{CacheRow, KeyValue};
    use crate::store::SqliteStore;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn store_with_cache_days(days: &[u32]) -> Arc<SqliteStore> {
        let reg = DatasetRegistry::builtin(&DEFAULT_NOTIONAL_TIERS);
        let ds = reg.get("funding").unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.ensure_tables(ds).unwrap();
        let rows: Vec<CacheRow> = days
            .iter()
            .map(|d| CacheRow {
                date: date(*d),
                keys: vec![KeyValue::Text("BTC".into())],
                metrics: vec![0.0001, 0.0],
            })
            .collect();
        store.append_cache(ds, &rows).unwrap();
        store
    }

    #[test]
    fn date_prefix_parsing() {
        assert_eq!(parse_date_prefix("2024-01-05T10:00:00.000"), Some(date(5)));
        assert_eq!(parse_date_prefix("2024-01-05"), Some(date(5)));
        assert_eq!(parse_date_prefix("2024-01"), None);
    }

    #[test]
    fn latest_date_of_empty_and_filled_tables() {
        let tracker = WatermarkTracker::new(store_with_cache_days(&[]));
        assert_eq!(tracker.latest_date("funding_cache").unwrap(), None);

        let tracker = WatermarkTracker::new(store_with_cache_days(&[1, 4, 2]));
        assert_eq!(tracker.latest_date("funding_cache").unwrap(), Some(date(4)));
    }

    #[test]
    fn empty_table_seeds_lookback() {
        assert_eq!(
            WatermarkTracker::start_date(None, date(31), DEFAULT_LOOKBACK_DAYS),
            Some(date(1))
        );
        assert_eq!(
            WatermarkTracker::start_date(Some(date(20)), date(31), DEFAULT_LOOKBACK_DAYS),
            Some(date(20))
        );
    }

    #[test]
    fn lookback_past_the_calendar_has_no_start() {
        assert_eq!(WatermarkTracker::start_date(None, date(31), u32::MAX), None);
        assert_eq!(
            WatermarkTracker::start_date(Some(date(20)), date(31), u32::MAX),
            Some(date(20))
        );
    }

    #[test]
    fn huge_retry_window_searches_everything() {
        let tracker = WatermarkTracker::new(store_with_cache_days(&[1, 2, 4, 5]));
        let gaps = tracker
            .gap_dates("funding_cache", Some(date(5)), date(6), u32::MAX)
            .unwrap();
        assert_eq!(gaps, BTreeSet::from([date(3)]));
    }

    #[test]
    fn recorded_floor_covers_a_failed_first_date() {
        let tracker = WatermarkTracker::new(store_with_cache_days(&[2, 3, 5]));
        assert_eq!(
            tracker.gap_dates("funding_cache", Some(date(5)), date(6), 30).unwrap(),
            BTreeSet::from([date(4)])
        );

        tracker.record_floor("funding_cache", date(1)).unwrap();
        tracker.record_floor("funding_cache", date(2)).unwrap();
        assert_eq!(
            tracker.gap_dates("funding_cache", Some(date(5)), date(6), 30).unwrap(),
            BTreeSet::from([date(1), date(4)])
        );

        // The window still bounds the search.
        assert_eq!(
            tracker.gap_dates("funding_cache", Some(date(5)), date(6), 3).unwrap(),
            BTreeSet::from([date(4)])
        );
    }

    #[test]
    fn gaps_inside_the_retry_window() {
        let tracker = WatermarkTracker::new(store_with_cache_days(&[1, 2, 4, 5]));
        let watermark = tracker.latest_date("funding_cache").unwrap();
        let gaps = tracker
            .gap_dates("funding_cache", watermark, date(6), 30)
            .unwrap();
        assert_eq!(gaps, BTreeSet::from([date(3)]));

        // Window starting after the gap.
        let gaps = tracker
            .gap_dates("funding_cache", watermark, date(6), 2)
            .unwrap();
        assert!(gaps.is_empty());

        assert!(tracker
            .gap_dates("funding_cache", watermark, date(6), 0)
            .unwrap()
            .is_empty());
    }
}
