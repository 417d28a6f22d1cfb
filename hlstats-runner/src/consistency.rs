//! Post-run consistency between a dataset's raw and cache tables.
//!
//! Raw rows are appended before the cache commit, so after a clean run both
//! watermarks agree. A cache watermark behind the raw watermark means a
//! date was loaded but never aggregated; it is reported, never fatal.

use chrono::NaiveDate;
use hlstats_core::store::StoreError;
use hlstats_core::{Dataset, WatermarkTracker};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsistencyStatus {
    Match,
    Divergence {
        cache: Option<NaiveDate>,
        raw: Option<NaiveDate>,
    },
    /// The dataset is aggregated straight from its payloads.
    NoRawTable,
}

impl fmt::Display for ConsistencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let date = |d: &Option<NaiveDate>| d.map(|d| d.to_string()).unwrap_or_else(|| "none".into());
        match self {
            ConsistencyStatus::Match => write!(f, "consistent"),
            ConsistencyStatus::Divergence { cache, raw } => {
                write!(f, "divergence (cache {}, raw {})", date(cache), date(raw))
            }
            ConsistencyStatus::NoRawTable => write!(f, "no raw table"),
        }
    }
}

/// Compares raw and cache watermarks of a dataset.
#[derive(Clone)]
pub struct ConsistencyChecker {
    tracker: WatermarkTracker,
}

impl ConsistencyChecker {
    pub fn new(tracker: WatermarkTracker) -> Self {
        Self { tracker }
    }

    pub fn check(&self, dataset: &Dataset) -> Result<ConsistencyStatus, StoreError> {
        let Some(raw_table) = &dataset.raw_table else {
            return Ok(ConsistencyStatus::NoRawTable);
        };
        let raw = self.tracker.latest_date(raw_table)?;
        let cache = self.tracker.latest_date(&dataset.cache_table)?;
        if raw == cache {
            Ok(ConsistencyStatus::Match)
        } else {
            Ok(ConsistencyStatus::Divergence { cache, raw })
        }
    }
}
