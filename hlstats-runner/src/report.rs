//! Run reports: what every run attempted, committed and failed.

use crate::consistency::ConsistencyStatus;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use hlstats_core::data::{FetchError, LoadError};
use hlstats_core::store::StoreError;
use hlstats_core::transform::TransformError;
use hlstats_core::Partition;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Current schema version of persisted reports.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Which pipeline stage a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Load,
    Transform,
    Commit,
    Catalog,
    Watermark,
    /// Fetched and parsed, but held back because its day was not committed.
    Deferred,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Fetch => "fetch",
            FailureKind::Load => "load",
            FailureKind::Transform => "transform",
            FailureKind::Commit => "commit",
            FailureKind::Catalog => "catalog",
            FailureKind::Watermark => "watermark",
            FailureKind::Deferred => "deferred",
        };
        f.write_str(s)
    }
}

/// A tagged failure: stage plus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// The same input may succeed on the next run (store unreachable,
    /// breaker open, commit error).
    #[serde(default)]
    pub retryable: bool,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl From<FetchError> for Failure {
    fn from(e: FetchError) -> Self {
        let failure = Failure::new(FailureKind::Fetch, e.to_string());
        if e.is_transient() {
            failure.retryable()
        } else {
            failure
        }
    }
}

impl From<LoadError> for Failure {
    fn from(e: LoadError) -> Self {
        Failure::new(FailureKind::Load, e.to_string())
    }
}

impl From<TransformError> for Failure {
    fn from(e: TransformError) -> Self {
        Failure::new(FailureKind::Transform, e.to_string())
    }
}

/// Store errors surface while committing a partition.
impl From<StoreError> for Failure {
    fn from(e: StoreError) -> Self {
        Failure::new(FailureKind::Commit, e.to_string()).retryable()
    }
}

/// Result of one partition, inspected by the run loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionOutcome {
    Committed(CommittedPartition),
    Failed(Failure),
}

impl From<Failure> for PartitionOutcome {
    fn from(f: Failure) -> Self {
        PartitionOutcome::Failed(f)
    }
}

/// A partition whose rows reached the cache table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedPartition {
    pub partition: Partition,
    /// Raw rows or snapshots parsed from the payload.
    pub records: usize,
    /// Raw rows appended (zero when the raw table already held the date).
    pub raw_rows: usize,
    /// Cache rows appended for this partition. Order-book partitions commit
    /// per day, so theirs are counted on the dataset.
    pub cache_rows: usize,
    /// BLAKE3 digest of the compressed payload.
    pub payload_digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionFailure {
    pub partition: Partition,
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// Everything one run did to one dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetReport {
    pub dataset: String,
    pub cache_watermark_before: Option<NaiveDate>,
    pub cache_watermark_after: Option<NaiveDate>,
    pub planned_dates: Vec<NaiveDate>,
    /// Dates re-planned because the cache table had no rows for them.
    pub retried_dates: Vec<NaiveDate>,
    pub partitions_attempted: usize,
    pub partitions_committed: usize,
    pub raw_rows_appended: usize,
    pub cache_rows_appended: usize,
    /// Dates whose raw rows were already present, so only the cache was written.
    pub raw_append_skipped: Vec<NaiveDate>,
    pub committed: Vec<CommittedPartition>,
    pub failures: Vec<PartitionFailure>,
    pub consistency: Option<ConsistencyStatus>,
    /// Dataset-level failure (watermark read, catalog fetch); the dataset was skipped.
    pub error: Option<Failure>,
}

impl DatasetReport {
    pub fn new(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, partition: Partition, outcome: PartitionOutcome) {
        self.partitions_attempted += 1;
        match outcome {
            PartitionOutcome::Committed(c) => {
                self.partitions_committed += 1;
                self.raw_rows_appended += c.raw_rows;
                self.cache_rows_appended += c.cache_rows;
                self.committed.push(c);
            }
            PartitionOutcome::Failed(f) => self.failures.push(PartitionFailure {
                partition,
                kind: f.kind,
                message: f.message,
                retryable: f.retryable,
            }),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.error.is_none()
            && self.failures.is_empty()
            && !matches!(self.consistency, Some(ConsistencyStatus::Divergence { .. }))
    }
}

/// Report of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub run_id: String,
    pub today: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datasets: Vec<DatasetReport>,
}

impl RunReport {
    pub fn new(today: NaiveDate, started_at: DateTime<Utc>) -> Self {
        let run_id = blake3::hash(format!("{today}|{}", started_at.to_rfc3339()).as_bytes())
            .to_hex()[..16]
            .to_string();
        Self {
            schema_version: SCHEMA_VERSION,
            run_id,
            today,
            started_at,
            finished_at: started_at,
            datasets: Vec::new(),
        }
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetReport> {
        self.datasets.iter().find(|d| d.dataset == name)
    }

    pub fn partitions_committed(&self) -> usize {
        self.datasets.iter().map(|d| d.partitions_committed).sum()
    }

    pub fn partition_failures(&self) -> usize {
        self.datasets.iter().map(|d| d.failures.len()).sum()
    }

    pub fn cache_rows_appended(&self) -> usize {
        self.datasets.iter().map(|d| d.cache_rows_appended).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.datasets.iter().all(DatasetReport::is_clean)
    }

    /// One line per dataset, for terminal output.
    pub fn summary_lines(&self) -> Vec<String> {
        self.datasets
            .iter()
            .map(|d| {
                let watermark = |w: Option<NaiveDate>| {
                    w.map(|d| d.to_string()).unwrap_or_else(|| "-".into())
                };
                let status = match (&d.error, &d.consistency) {
                    (Some(e), _) => format!("skipped ({}: {})", e.kind, e.message),
                    (None, Some(c)) => c.to_string(),
                    (None, None) => "-".into(),
                };
                format!(
                    "{:<24} {} -> {}  committed {}/{}  cache rows +{}  raw rows +{}  {}",
                    d.dataset,
                    watermark(d.cache_watermark_before),
                    watermark(d.cache_watermark_after),
                    d.partitions_committed,
                    d.partitions_attempted,
                    d.cache_rows_appended,
                    d.raw_rows_appended,
                    status,
                )
            })
            .collect()
    }
}

/// Write a report as pretty JSON under `dir`. Returns the file path.
pub fn save_report(report: &RunReport, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create report dir: {}", dir.display()))?;
    let path = dir.join(format!(
        "run_{}_{}.json",
        report.today.format("%Y%m%d"),
        report.run_id
    ));
    let json = serde_json::to_string_pretty(report).context("failed to serialize run report")?;
    std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Load a report written by `save_report`. Rejects unknown schema versions.
pub fn load_report(path: &Path) -> Result<RunReport> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let report: RunReport = serde_json::from_str(&json).context("failed to parse run report")?;
    if report.schema_version > SCHEMA_VERSION {
        bail!(
            "report schema version {} is newer than supported {}",
            report.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(report)
}
