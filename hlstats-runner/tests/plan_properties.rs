//! Property tests for partition planning against arbitrary cache contents.

use chrono::{Duration, NaiveDate};
use hlstats_core::data::{LocalObjectFetcher, StaticAssetCatalog};
use hlstats_core::dataset::{DatasetRegistry, DEFAULT_NOTIONAL_TIERS};
use hlstats_core::store::{SqliteStore, TableStore};
use hlstats_core::{CacheRow, KeyValue};
use hlstats_runner::{LogAlertSink, Pipeline, PipelineSettings};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn base() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

fn funding_pipeline(committed: &BTreeSet<i64>, lookback_days: u32) -> Pipeline {
    let registry = DatasetRegistry::builtin(&DEFAULT_NOTIONAL_TIERS);
    let ds = registry.get("funding").unwrap().clone();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.ensure_tables(&ds).unwrap();
    let rows: Vec<CacheRow> = committed
        .iter()
        .map(|offset| CacheRow {
            date: base() + Duration::days(*offset),
            keys: vec![KeyValue::Text("BTC".into())],
            metrics: vec![0.0001, 0.0002],
        })
        .collect();
    store.append_cache(&ds, &rows).unwrap();

    Pipeline::new(
        PipelineSettings {
            lookback_days,
            retry_window_days: 30,
            parallel_assets: false,
        },
        vec![ds],
        Arc::new(LocalObjectFetcher::new("/nonexistent")),
        store,
        Arc::new(StaticAssetCatalog::new(vec!["BTC".into()])),
        Arc::new(LogAlertSink),
    )
}

proptest! {
    /// Plans are strictly ascending, cover everything after the watermark,
    /// and only reach back for dates the cache table lacks.
    #[test]
    fn plan_covers_new_dates_and_gaps_only(
        committed in prop::collection::btree_set(0i64..20, 0..12),
        today_offset in 20i64..30,
        lookback_days in 1u32..10,
    ) {
        let today = base() + Duration::days(today_offset);
        let pipeline = funding_pipeline(&committed, lookback_days);
        let plans = pipeline.plan(today);
        let plan = plans[0].1.as_ref().unwrap();
        let dates = plan.partitions.dates();

        prop_assert!(dates.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(dates.iter().all(|d| *d <= today));

        let committed_dates: BTreeSet<NaiveDate> =
            committed.iter().map(|o| base() + Duration::days(*o)).collect();
        let watermark = committed_dates.last().copied();
        prop_assert_eq!(plan.cache_watermark, watermark);

        let start = watermark.unwrap_or(today - Duration::days(lookback_days as i64));
        let mut day = start + Duration::days(1);
        while day <= today {
            prop_assert!(dates.contains(&day), "missing {}", day);
            day += Duration::days(1);
        }
        for d in dates {
            prop_assert!(*d > start || !committed_dates.contains(d));
        }
        // Gaps sit between the earliest and latest committed dates.
        for d in &plan.retried {
            prop_assert!(!committed_dates.contains(d));
            prop_assert!(Some(*d) < watermark);
            prop_assert!(committed_dates.first().map_or(false, |first| d > first));
        }
    }
}
