//! Cache aggregator: commits a partition's (or a day's) cache rows.

use crate::dataset::Dataset;
use crate::records::CacheRow;
use crate::store::{StoreError, TableStore};
use std::sync::Arc;
use tracing::debug;

/// Appends cache rows to a dataset's cache table, one transaction per commit.
///
/// A successful commit is what advances the cache watermark.
#[derive(Clone)]
pub struct CacheAggregator {
    store: Arc<dyn TableStore>,
}

impl CacheAggregator {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    pub fn commit(&self, dataset: &Dataset, rows: &[CacheRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let written = self.store.append_cache(dataset, rows)?;
        debug!(dataset = %dataset.name, rows = written, "committed cache rows");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetRegistry, DEFAULT_NOTIONAL_TIERS};
    use crate::records::KeyValue;
    use crate::store::SqliteStore;
    use crate::watermark::WatermarkTracker;
    use chrono::NaiveDate;

    #[test]
    fn commit_advances_the_cache_watermark() {
        let reg = DatasetRegistry::builtin(&DEFAULT_NOTIONAL_TIERS);
        let ds = reg.get("liquidations").unwrap();
        let store: Arc<dyn TableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.ensure_tables(ds).unwrap();

        let aggregator = CacheAggregator::new(store.clone());
        let tracker = WatermarkTracker::new(store);
        assert_eq!(tracker.latest_date(&ds.cache_table).unwrap(), None);

        assert_eq!(aggregator.commit(ds, &[]).unwrap(), 0);

        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let row = CacheRow {
            date,
            keys: vec![KeyValue::Text("0xa".into()), KeyValue::Text("cross".into())],
            metrics: vec![1_000.0, 250.0],
        };
        assert_eq!(aggregator.commit(ds, &[row]).unwrap(), 1);
        assert_eq!(tracker.latest_date(&ds.cache_table).unwrap(), Some(date));
    }
}
