//! The run loop.
//!
//! For each configured dataset, in order:
//! 1. read the cache watermark and the gap dates inside the retry window
//! 2. enumerate the partition plan (the asset catalog is consulted once per run)
//! 3. fetch, decompress, parse, transform and commit every partition
//! 4. compare raw and cache watermarks
//!
//! Every partition yields a tagged outcome that lands in the run report.
//! Failures are alerted and the loop moves on; nothing short of a bad
//! configuration stops a run.

use crate::alert::{Alert, AlertSink, Alerter};
use crate::config::{ConfigError, PipelineConfig};
use crate::consistency::{ConsistencyChecker, ConsistencyStatus};
use crate::report::{
    CommittedPartition, DatasetReport, Failure, FailureKind, PartitionOutcome, RunReport,
};
use chrono::{NaiveDate, Utc};
use hlstats_core::data::{
    decompress_lz4, parse_snapshots, payload_digest, AssetCatalog, ObjectFetcher, RawLoader,
};
use hlstats_core::store::{StoreError, TableStore};
use hlstats_core::transform::{aggregate, aggregate_day, snapshot_metrics, SnapshotMetrics};
use hlstats_core::watermark::{DEFAULT_LOOKBACK_DAYS, DEFAULT_RETRY_WINDOW_DAYS};
use hlstats_core::{
    CacheAggregator, Dataset, Partition, PartitionPlan, TransformSpec, WatermarkTracker,
};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Run-loop knobs taken from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub lookback_days: u32,
    pub retry_window_days: u32,
    pub parallel_assets: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            retry_window_days: DEFAULT_RETRY_WINDOW_DAYS,
            parallel_assets: true,
        }
    }
}

/// What a run would do for one dataset.
#[derive(Debug, Clone)]
pub struct DatasetPlan {
    pub dataset: String,
    pub cache_watermark: Option<NaiveDate>,
    /// Plan covers every date after this one, plus `retried`.
    pub start: NaiveDate,
    pub retried: BTreeSet<NaiveDate>,
    pub partitions: PartitionPlan,
}

/// Watermarks and row counts of one dataset's tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStatus {
    pub dataset: String,
    pub raw_table: Option<String>,
    pub raw_watermark: Option<NaiveDate>,
    pub raw_rows: Option<u64>,
    pub cache_table: String,
    pub cache_watermark: Option<NaiveDate>,
    pub cache_rows: u64,
}

/// Fetches the asset list on first use and remembers the answer, failure
/// included, for the rest of the run.
struct AssetCache<'a> {
    catalog: &'a dyn AssetCatalog,
    assets: Option<Result<Arc<[String]>, Failure>>,
}

impl<'a> AssetCache<'a> {
    fn new(catalog: &'a dyn AssetCatalog) -> Self {
        Self {
            catalog,
            assets: None,
        }
    }

    fn get(&mut self) -> Result<Arc<[String]>, Failure> {
        let catalog = self.catalog;
        self.assets
            .get_or_insert_with(|| {
                let assets: Result<Arc<[String]>, Failure> = catalog
                    .assets()
                    .map(Arc::from)
                    .map_err(|e| Failure::new(FailureKind::Catalog, e.to_string()));
                if let Ok(list) = &assets {
                    info!(assets = list.len(), "asset catalog loaded");
                }
                assets
            })
            .clone()
    }
}

/// One order-book partition fetched and reduced to per-snapshot metrics,
/// waiting for its day to be committed.
struct Staged {
    records: usize,
    digest: String,
    metrics: Vec<SnapshotMetrics>,
}

pub struct Pipeline {
    settings: PipelineSettings,
    datasets: Vec<Dataset>,
    fetcher: Arc<dyn ObjectFetcher>,
    store: Arc<dyn TableStore>,
    catalog: Arc<dyn AssetCatalog>,
    alerter: Alerter,
    tracker: WatermarkTracker,
    aggregator: CacheAggregator,
    checker: ConsistencyChecker,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        datasets: Vec<Dataset>,
        fetcher: Arc<dyn ObjectFetcher>,
        store: Arc<dyn TableStore>,
        catalog: Arc<dyn AssetCatalog>,
        alert_sink: Arc<dyn AlertSink>,
    ) -> Self {
        let tracker = WatermarkTracker::new(store.clone());
        Self {
            settings,
            datasets,
            fetcher,
            aggregator: CacheAggregator::new(store.clone()),
            checker: ConsistencyChecker::new(tracker.clone()),
            tracker,
            store,
            catalog,
            alerter: Alerter::new(alert_sink),
        }
    }

    /// Build every component from a validated configuration. `only`
    /// narrows the run to a subset of `dataset_list`.
    pub fn from_config(config: &PipelineConfig, only: &[String]) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.settings(),
            config.datasets(only)?,
            config.build_fetcher()?,
            config.build_store()?,
            config.build_catalog()?,
            config.build_alert_sink()?,
        ))
    }

    /// Confirm the object store answers and accepts the configured
    /// credentials. A sync must not start when this fails.
    pub fn verify_object_store(&self) -> Result<(), ConfigError> {
        self.fetcher.verify().map_err(|e| ConfigError::Init {
            component: "object store",
            message: e.to_string(),
        })?;
        info!(fetcher = self.fetcher.name(), "object store verified");
        Ok(())
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    pub fn alerter(&self) -> &Alerter {
        &self.alerter
    }

    /// Plans for every dataset without touching the object store.
    pub fn plan(&self, today: NaiveDate) -> Vec<(String, Result<DatasetPlan, Failure>)> {
        let mut assets = AssetCache::new(self.catalog.as_ref());
        self.datasets
            .iter()
            .map(|ds| (ds.name.clone(), self.plan_dataset(ds, today, &mut assets)))
            .collect()
    }

    /// Synchronize every dataset through `today`.
    pub fn run(&self, today: NaiveDate) -> RunReport {
        let mut report = RunReport::new(today, Utc::now());
        info!(run_id = %report.run_id, %today, datasets = self.datasets.len(), "sync started");

        let mut assets = AssetCache::new(self.catalog.as_ref());
        for ds in &self.datasets {
            report.datasets.push(self.sync_dataset(ds, today, &mut assets));
        }

        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            committed = report.partitions_committed(),
            failed = report.partition_failures(),
            cache_rows = report.cache_rows_appended(),
            "sync finished"
        );
        report
    }

    /// Consistency status of every dataset, as of now.
    pub fn check(&self) -> Vec<(String, Result<ConsistencyStatus, StoreError>)> {
        self.datasets
            .iter()
            .map(|ds| (ds.name.clone(), self.checker.check(ds)))
            .collect()
    }

    pub fn table_status(&self) -> Result<Vec<TableStatus>, StoreError> {
        self.datasets
            .iter()
            .map(|ds| {
                let (raw_watermark, raw_rows) = match &ds.raw_table {
                    Some(table) => (
                        self.tracker.latest_date(table)?,
                        Some(self.store.row_count(table)?),
                    ),
                    None => (None, None),
                };
                Ok(TableStatus {
                    dataset: ds.name.clone(),
                    raw_table: ds.raw_table.clone(),
                    raw_watermark,
                    raw_rows,
                    cache_table: ds.cache_table.clone(),
                    cache_watermark: self.tracker.latest_date(&ds.cache_table)?,
                    cache_rows: self.store.row_count(&ds.cache_table)?,
                })
            })
            .collect()
    }

    fn plan_dataset(
        &self,
        ds: &Dataset,
        today: NaiveDate,
        assets: &mut AssetCache<'_>,
    ) -> Result<DatasetPlan, Failure> {
        let watermark_failure = |e: StoreError| Failure::new(FailureKind::Watermark, e.to_string());

        let cache_watermark = self
            .tracker
            .latest_date(&ds.cache_table)
            .map_err(watermark_failure)?;
        let start = WatermarkTracker::start_date(cache_watermark, today, self.settings.lookback_days)
            .ok_or_else(|| {
                Failure::new(
                    FailureKind::Watermark,
                    format!(
                        "lookback of {} days before {today} is out of range",
                        self.settings.lookback_days
                    ),
                )
            })?;
        let retried = self
            .tracker
            .gap_dates(
                &ds.cache_table,
                cache_watermark,
                today,
                self.settings.retry_window_days,
            )
            .map_err(watermark_failure)?;

        let asset_list: Arc<[String]> = if ds.is_nested() {
            assets.get()?
        } else {
            Arc::from(Vec::new())
        };

        Ok(DatasetPlan {
            dataset: ds.name.clone(),
            cache_watermark,
            start,
            partitions: PartitionPlan::new(ds, start, today, &retried, asset_list),
            retried,
        })
    }

    fn sync_dataset(
        &self,
        ds: &Dataset,
        today: NaiveDate,
        assets: &mut AssetCache<'_>,
    ) -> DatasetReport {
        let mut report = DatasetReport::new(&ds.name);

        let prepared = self
            .store
            .ensure_tables(ds)
            .map_err(|e| Failure::new(FailureKind::Commit, e.to_string()))
            .and_then(|()| self.plan_dataset(ds, today, assets));
        let plan = match prepared {
            Ok(plan) => plan,
            Err(failure) => {
                self.skip_dataset(ds, &mut report, failure);
                return report;
            }
        };

        // Seeding an empty table: remember where, so a failed first date is
        // still found as a gap later.
        if let (None, Some(first)) = (plan.cache_watermark, plan.partitions.dates().first()) {
            if let Err(e) = self.tracker.record_floor(&ds.cache_table, *first) {
                self.skip_dataset(ds, &mut report, Failure::new(FailureKind::Commit, e.to_string()));
                return report;
            }
        }

        report.cache_watermark_before = plan.cache_watermark;
        report.planned_dates = plan.partitions.dates().to_vec();
        report.retried_dates = plan.retried.iter().copied().collect();
        info!(
            dataset = %ds.name,
            watermark = ?plan.cache_watermark,
            dates = plan.partitions.dates().len(),
            retried = plan.retried.len(),
            partitions = plan.partitions.len(),
            "dataset planned"
        );

        let synced = if ds.is_nested() {
            self.sync_nested(ds, &plan, &mut report)
        } else {
            self.sync_flat(ds, &plan, &mut report)
        };
        if let Err(failure) = synced {
            self.skip_dataset(ds, &mut report, failure);
            return report;
        }

        match self.tracker.latest_date(&ds.cache_table) {
            Ok(after) => report.cache_watermark_after = after,
            Err(e) => warn!(dataset = %ds.name, error = %e, "failed to read cache watermark after sync"),
        }

        match self.checker.check(ds) {
            Ok(status) => {
                if matches!(status, ConsistencyStatus::Divergence { .. }) {
                    warn!(dataset = %ds.name, %status, "raw and cache watermarks diverge");
                    self.alerter.notify(&Alert::Divergence {
                        dataset: ds.name.clone(),
                        status: status.clone(),
                    });
                }
                report.consistency = Some(status);
            }
            Err(e) => warn!(dataset = %ds.name, error = %e, "consistency check failed"),
        }

        info!(
            dataset = %ds.name,
            committed = report.partitions_committed,
            attempted = report.partitions_attempted,
            cache_rows = report.cache_rows_appended,
            raw_rows = report.raw_rows_appended,
            "dataset synced"
        );
        report
    }

    fn skip_dataset(&self, ds: &Dataset, report: &mut DatasetReport, failure: Failure) {
        warn!(dataset = %ds.name, kind = %failure.kind, error = %failure.message, "dataset skipped");
        self.alerter.notify(&Alert::DatasetSkipped {
            dataset: ds.name.clone(),
            failure: failure.clone(),
        });
        report.error = Some(failure);
    }

    fn sync_flat(
        &self,
        ds: &Dataset,
        plan: &DatasetPlan,
        report: &mut DatasetReport,
    ) -> Result<(), Failure> {
        let mut raw_dates = match (&ds.raw_table, plan.partitions.dates().first()) {
            (Some(table), Some(first)) => self
                .tracker
                .committed_dates(table, *first)
                .map_err(|e| Failure::new(FailureKind::Watermark, e.to_string()))?,
            _ => BTreeSet::new(),
        };

        for partition in plan.partitions.iter() {
            let date = partition.date;
            let raw_present = raw_dates.contains(&date);
            debug!(%partition, raw_present, "processing partition");

            let outcome = match self.process_flat(ds, &partition, raw_present) {
                Ok(committed) => {
                    if raw_present {
                        report.raw_append_skipped.push(date);
                    }
                    raw_dates.insert(date);
                    debug!(
                        %partition,
                        records = committed.records,
                        cache_rows = committed.cache_rows,
                        "partition committed"
                    );
                    PartitionOutcome::Committed(committed)
                }
                Err(failure) => {
                    self.partition_failed(&partition, &failure);
                    PartitionOutcome::Failed(failure)
                }
            };
            report.record(partition, outcome);
        }
        Ok(())
    }

    fn process_flat(
        &self,
        ds: &Dataset,
        partition: &Partition,
        raw_present: bool,
    ) -> Result<CommittedPartition, Failure> {
        let key = partition.object_key(&ds.source_prefix);
        let compressed = self.fetcher.fetch(&key)?;
        let payload_digest = payload_digest(&compressed);
        let payload = decompress_lz4(&key, &compressed)?;
        let table = RawLoader::for_dataset(ds).load(&payload)?;
        let rows = aggregate(ds, &table, partition.date)?;

        // Raw first, so the cache watermark never passes the raw one.
        let raw_rows = if raw_present {
            0
        } else {
            self.store.append_raw(ds, &table)?
        };
        let cache_rows = self.aggregator.commit(ds, &rows)?;

        Ok(CommittedPartition {
            partition: partition.clone(),
            records: table.len(),
            raw_rows,
            cache_rows,
            payload_digest,
        })
    }

    fn sync_nested(
        &self,
        ds: &Dataset,
        plan: &DatasetPlan,
        report: &mut DatasetReport,
    ) -> Result<(), Failure> {
        let TransformSpec::OrderBook { tiers } = &ds.transform else {
            return Err(Failure::new(
                FailureKind::Transform,
                format!("dataset '{}' has no order-book transform", ds.name),
            ));
        };

        for (date, day) in plan.partitions.days() {
            let partitions: Vec<Partition> = day.collect();
            let attempted = partitions.len();

            let staged: Vec<(Partition, Result<Staged, Failure>)> = if self.settings.parallel_assets
            {
                partitions
                    .into_par_iter()
                    .map(|p| {
                        let staged = self.stage_orderbook(ds, &p, tiers);
                        (p, staged)
                    })
                    .collect()
            } else {
                partitions
                    .into_iter()
                    .map(|p| {
                        let staged = self.stage_orderbook(ds, &p, tiers);
                        (p, staged)
                    })
                    .collect()
            };

            let mut metrics = Vec::new();
            let mut ready = Vec::new();
            let mut failed = Vec::new();
            for (partition, result) in staged {
                match result {
                    Ok(s) => {
                        metrics.extend(s.metrics);
                        ready.push((partition, s.records, s.digest));
                    }
                    Err(failure) => failed.push((partition, failure)),
                }
            }

            // A transient failure holds the whole day back so it stays a gap
            // and is planned again; anything else commits what succeeded.
            let transient = failed.iter().filter(|(_, f)| f.retryable).count();
            let mut deferred = Vec::new();
            if transient > 0 && !ready.is_empty() {
                let failure = Failure::new(
                    FailureKind::Deferred,
                    format!("{transient} of {attempted} partitions failed transiently; day left for the next run"),
                )
                .retryable();
                deferred.extend(ready.drain(..).map(|(p, _, _)| (p, failure.clone())));
            }

            if !ready.is_empty() {
                let rows = aggregate_day(date, &metrics, tiers.len());
                match self.aggregator.commit(ds, &rows) {
                    Ok(cache_rows) => {
                        report.cache_rows_appended += cache_rows;
                        for (partition, records, payload_digest) in ready {
                            report.record(
                                partition.clone(),
                                PartitionOutcome::Committed(CommittedPartition {
                                    partition,
                                    records,
                                    raw_rows: 0,
                                    cache_rows: 0,
                                    payload_digest,
                                }),
                            );
                        }
                    }
                    Err(e) => {
                        let failure = Failure::from(e);
                        failed.extend(ready.into_iter().map(|(p, _, _)| (p, failure.clone())));
                    }
                }
            }

            for (partition, failure) in &failed {
                warn!(%partition, kind = %failure.kind, error = %failure.message, "partition failed");
            }
            match failed.as_slice() {
                [] => {}
                [(partition, failure)] => self.alerter.notify(&Alert::PartitionFailed {
                    partition: partition.clone(),
                    failure: failure.clone(),
                }),
                [(_, first), ..] => self.alerter.notify(&Alert::DayPartiallyFailed {
                    dataset: ds.name.clone(),
                    date,
                    failed: failed.len(),
                    attempted,
                    first: first.clone(),
                }),
            }
            if !deferred.is_empty() {
                warn!(
                    dataset = %ds.name,
                    %date,
                    transient,
                    deferred = deferred.len(),
                    "order-book day deferred"
                );
            }
            info!(
                dataset = %ds.name,
                %date,
                attempted,
                failed = failed.len(),
                "order-book day processed"
            );
            for (partition, failure) in failed.into_iter().chain(deferred) {
                report.record(partition, PartitionOutcome::Failed(failure));
            }
        }
        Ok(())
    }

    fn stage_orderbook(
        &self,
        ds: &Dataset,
        partition: &Partition,
        tiers: &[f64],
    ) -> Result<Staged, Failure> {
        debug!(%partition, "processing partition");
        let key = partition.object_key(&ds.source_prefix);
        let compressed = self.fetcher.fetch(&key)?;
        let digest = payload_digest(&compressed);
        let payload = decompress_lz4(&key, &compressed)?;
        let snapshots = parse_snapshots(&payload)?;
        let metrics = snapshots
            .iter()
            .map(|s| snapshot_metrics(s, tiers))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Staged {
            records: snapshots.len(),
            digest,
            metrics,
        })
    }

    fn partition_failed(&self, partition: &Partition, failure: &Failure) {
        warn!(%partition, kind = %failure.kind, error = %failure.message, "partition failed");
        self.alerter.notify(&Alert::PartitionFailed {
            partition: partition.clone(),
            failure: failure.clone(),
        });
    }
}
