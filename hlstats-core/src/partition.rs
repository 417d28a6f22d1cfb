//! Partition enumeration.
//!
//! A partition is one source object. Flat datasets have one partition per
//! day; the order-book dataset has one per day × hour × asset. Plans are
//! enumerated lazily: only the date list and the asset list are held, and
//! `PartitionPlan::iter` can be restarted any number of times.

use crate::dataset::{Dataset, PartitionScheme};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub const HOURS_PER_DAY: u8 = 24;

/// One unit of ingestion. Identity is the full tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub dataset: String,
    pub date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
}

impl Partition {
    pub fn flat(dataset: &str, date: NaiveDate) -> Self {
        Self {
            dataset: dataset.to_string(),
            date,
            hour: None,
            asset: None,
        }
    }

    pub fn nested(dataset: &str, date: NaiveDate, hour: u8, asset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            date,
            hour: Some(hour),
            asset: Some(asset.to_string()),
        }
    }

    /// Object key of this partition under `prefix`.
    pub fn object_key(&self, prefix: &str) -> String {
        let day = self.date.format("%Y%m%d");
        match (self.hour, self.asset.as_deref()) {
            (Some(hour), Some(asset)) => format!("{prefix}/{day}/{hour}/l2Book/{asset}.lz4"),
            _ => format!("{prefix}/{day}.csv.lz4"),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.dataset, self.date)?;
        if let Some(hour) = self.hour {
            write!(f, " h{hour:02}")?;
        }
        if let Some(asset) = &self.asset {
            write!(f, " {asset}")?;
        }
        Ok(())
    }
}

/// Dates strictly after `after`, through `through` inclusive.
pub fn dates_after(after: NaiveDate, through: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut day = after + Duration::days(1);
    while day <= through {
        dates.push(day);
        day += Duration::days(1);
    }
    dates
}

/// Dates in `[from, through]` missing from `present`.
pub fn missing_dates(
    present: &BTreeSet<NaiveDate>,
    from: NaiveDate,
    through: NaiveDate,
) -> BTreeSet<NaiveDate> {
    let mut missing = BTreeSet::new();
    let mut day = from;
    while day <= through {
        if !present.contains(&day) {
            missing.insert(day);
        }
        day += Duration::days(1);
    }
    missing
}

/// Ordered partitions for one dataset and one run.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    dataset: String,
    scheme: PartitionScheme,
    dates: Vec<NaiveDate>,
    assets: Arc<[String]>,
}

impl PartitionPlan {
    /// Plan every date after `start` through `today`, plus retry dates at or
    /// before `start`. Dates come out strictly ascending.
    ///
    /// `assets` is ignored for flat datasets.
    pub fn new(
        dataset: &Dataset,
        start: NaiveDate,
        today: NaiveDate,
        retry: &BTreeSet<NaiveDate>,
        assets: Arc<[String]>,
    ) -> Self {
        let mut dates: BTreeSet<NaiveDate> =
            retry.iter().copied().filter(|d| *d <= start).collect();
        dates.extend(dates_after(start, today));
        Self {
            dataset: dataset.name.clone(),
            scheme: dataset.scheme,
            dates: dates.into_iter().collect(),
            assets,
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    /// Partitions per date.
    pub fn per_day(&self) -> usize {
        match self.scheme {
            PartitionScheme::FlatDaily => 1,
            PartitionScheme::NestedHourlyPerAsset => HOURS_PER_DAY as usize * self.assets.len(),
        }
    }

    /// Total number of partitions.
    pub fn len(&self) -> usize {
        self.dates.len() * self.per_day()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily walk every partition: date, then hour, then asset.
    pub fn iter(&self) -> Partitions<'_> {
        Partitions::new(self, &self.dates)
    }

    /// One lazy iterator per date, in date order.
    pub fn days(&self) -> impl Iterator<Item = (NaiveDate, Partitions<'_>)> + '_ {
        self.dates
            .iter()
            .enumerate()
            .map(move |(i, date)| (*date, Partitions::new(self, &self.dates[i..=i])))
    }
}

impl<'a> IntoIterator for &'a PartitionPlan {
    type Item = Partition;
    type IntoIter = Partitions<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy partition iterator over a slice of a plan's dates.
#[derive(Debug, Clone)]
pub struct Partitions<'a> {
    plan: &'a PartitionPlan,
    dates: &'a [NaiveDate],
    date_idx: usize,
    hour: u8,
    asset_idx: usize,
}

impl<'a> Partitions<'a> {
    fn new(plan: &'a PartitionPlan, dates: &'a [NaiveDate]) -> Self {
        Self {
            plan,
            dates,
            date_idx: 0,
            hour: 0,
            asset_idx: 0,
        }
    }

    fn remaining(&self) -> usize {
        let dates_left = self.dates.len().saturating_sub(self.date_idx);
        match self.plan.scheme {
            PartitionScheme::FlatDaily => dates_left,
            PartitionScheme::NestedHourlyPerAsset => {
                if dates_left == 0 {
                    return 0;
                }
                let consumed = self.hour as usize * self.plan.assets.len() + self.asset_idx;
                dates_left * self.plan.per_day() - consumed
            }
        }
    }
}

impl Iterator for Partitions<'_> {
    type Item = Partition;

    fn next(&mut self) -> Option<Partition> {
        let date = *self.dates.get(self.date_idx)?;
        match self.plan.scheme {
            PartitionScheme::FlatDaily => {
                self.date_idx += 1;
                Some(Partition::flat(&self.plan.dataset, date))
            }
            PartitionScheme::NestedHourlyPerAsset => {
                let assets = &self.plan.assets;
                if assets.is_empty() {
                    self.date_idx = self.dates.len();
                    return None;
                }
                let partition =
                    Partition::nested(&self.plan.dataset, date, self.hour, &assets[self.asset_idx]);
                self.asset_idx += 1;
                if self.asset_idx == assets.len() {
                    self.asset_idx = 0;
                    self.hour += 1;
                    if self.hour == HOURS_PER_DAY {
                        self.hour = 0;
                        self.date_idx += 1;
                    }
                }
                Some(partition)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

impl ExactSizeIterator for Partitions<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetRegistry, DEFAULT_NOTIONAL_TIERS};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn dataset(name: &str) -> Dataset {
        DatasetRegistry::builtin(&DEFAULT_NOTIONAL_TIERS)
            .get(name)
            .unwrap()
            .clone()
    }

    fn no_assets() -> Arc<[String]> {
        Arc::from(Vec::<String>::new())
    }

    #[test]
    fn flat_plan_starts_the_day_after_watermark() {
        let ds = dataset("funding");
        let plan = PartitionPlan::new(&ds, d(2024, 1, 1), d(2024, 1, 4), &BTreeSet::new(), no_assets());
        let dates: Vec<_> = plan.iter().map(|p| p.date).collect();
        assert_eq!(dates, vec![d(2024, 1, 2), d(2024, 1, 3), d(2024, 1, 4)]);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn caught_up_plan_is_empty() {
        let ds = dataset("funding");
        let plan = PartitionPlan::new(&ds, d(2024, 1, 4), d(2024, 1, 4), &BTreeSet::new(), no_assets());
        assert!(plan.is_empty());
        assert_eq!(plan.iter().count(), 0);
    }

    #[test]
    fn retry_dates_merge_in_ascending_order() {
        let ds = dataset("funding");
        let retry: BTreeSet<_> = [d(2024, 1, 2), d(2024, 1, 9)].into_iter().collect();
        let plan = PartitionPlan::new(&ds, d(2024, 1, 3), d(2024, 1, 5), &retry, no_assets());
        // 2024-01-09 lies after the watermark, so it is not a retry date.
        assert_eq!(plan.dates(), &[d(2024, 1, 2), d(2024, 1, 4), d(2024, 1, 5)]);
        for pair in plan.dates().windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn nested_plan_walks_date_hour_asset_lazily() {
        let ds = dataset("market_data");
        let assets: Arc<[String]> = Arc::from(vec!["BTC".to_string(), "ETH".to_string()]);
        let plan = PartitionPlan::new(&ds, d(2024, 1, 1), d(2024, 1, 3), &BTreeSet::new(), assets);

        assert_eq!(plan.len(), 2 * 24 * 2);
        let mut it = plan.iter();
        assert_eq!(it.len(), 96);
        assert_eq!(it.next(), Some(Partition::nested("market_data", d(2024, 1, 2), 0, "BTC")));
        assert_eq!(it.next(), Some(Partition::nested("market_data", d(2024, 1, 2), 0, "ETH")));
        assert_eq!(it.next(), Some(Partition::nested("market_data", d(2024, 1, 2), 1, "BTC")));
        assert_eq!(it.len(), 93);

        let last = plan.iter().last().unwrap();
        assert_eq!(last, Partition::nested("market_data", d(2024, 1, 3), 23, "ETH"));

        // restartable
        assert_eq!(plan.iter().count(), 96);
        assert_eq!(plan.iter().count(), 96);
    }

    #[test]
    fn days_split_nested_plan_per_date() {
        let ds = dataset("market_data");
        let assets: Arc<[String]> = Arc::from(vec!["SOL".to_string()]);
        let plan = PartitionPlan::new(&ds, d(2024, 2, 1), d(2024, 2, 3), &BTreeSet::new(), assets);
        let days: Vec<_> = plan.days().map(|(date, parts)| (date, parts.count())).collect();
        assert_eq!(days, vec![(d(2024, 2, 2), 24), (d(2024, 2, 3), 24)]);
    }

    #[test]
    fn nested_plan_without_assets_yields_nothing() {
        let ds = dataset("market_data");
        let plan = PartitionPlan::new(&ds, d(2024, 2, 1), d(2024, 2, 3), &BTreeSet::new(), no_assets());
        assert!(plan.is_empty());
        assert_eq!(plan.iter().next(), None);
    }

    #[test]
    fn object_keys_follow_bucket_layout() {
        let flat = Partition::flat("non_mm_trades", d(2024, 1, 5));
        assert_eq!(flat.object_key("non_mm_trades"), "non_mm_trades/20240105.csv.lz4");

        let nested = Partition::nested("market_data", d(2024, 1, 5), 7, "BTC");
        assert_eq!(nested.object_key("market_data"), "market_data/20240105/7/l2Book/BTC.lz4");
        assert_eq!(nested.to_string(), "market_data 2024-01-05 h07 BTC");
    }

    #[test]
    fn missing_dates_lists_gaps() {
        let present: BTreeSet<_> = [d(2024, 1, 1), d(2024, 1, 2), d(2024, 1, 4)].into_iter().collect();
        let gaps = missing_dates(&present, d(2024, 1, 1), d(2024, 1, 5));
        assert_eq!(gaps.into_iter().collect::<Vec<_>>(), vec![d(2024, 1, 3), d(2024, 1, 5)]);
    }
}
