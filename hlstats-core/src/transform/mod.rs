//! Feature transforms: partition data into cache rows.
//!
//! - `tabular`: polars group-by aggregation of delimited raw tables
//! - `orderbook`: liquidity, mid and tiered slippage of book snapshots

pub mod orderbook;
pub mod tabular;

pub use orderbook::{aggregate_day, snapshot_metrics, SnapshotMetrics};
pub use tabular::aggregate;

use polars::prelude::PolarsError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    #[error("aggregation failed: {0}")]
    Aggregation(String),

    #[error("raw table has no column '{0}'")]
    MissingColumn(String),

    #[error("dataset '{dataset}' is not a {expected} dataset")]
    WrongTransform {
        dataset: String,
        expected: &'static str,
    },

    #[error("malformed {coin} snapshot at {time}: {reason}")]
    MalformedSnapshot {
        coin: String,
        time: String,
        reason: String,
    },
}

impl From<PolarsError> for TransformError {
    fn from(e: PolarsError) -> Self {
        TransformError::Aggregation(e.to_string())
    }
}
