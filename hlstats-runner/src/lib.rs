//! hlstats runner: cache synchronization runs.
//!
//! This crate builds on `hlstats-core` to provide:
//! - TOML configuration and component construction
//! - The run loop (watermarks, gap retries, per-partition outcomes)
//! - Post-run consistency checks between raw and cache tables
//! - Alerts (Slack or log) and JSON run reports

pub mod alert;
pub mod config;
pub mod consistency;
pub mod pipeline;
pub mod report;

pub use alert::{Alert, AlertError, AlertSink, Alerter, LogAlertSink, SlackAlertSink};
pub use config::{ConfigError, PipelineConfig};
pub use consistency::{ConsistencyChecker, ConsistencyStatus};
pub use pipeline::{DatasetPlan, Pipeline, PipelineSettings, TableStatus};
pub use report::{
    load_report, save_report, CommittedPartition, DatasetReport, Failure, FailureKind,
    PartitionFailure, PartitionOutcome, RunReport,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn pipeline_is_send_sync() {
        assert_send::<Pipeline>();
        assert_sync::<Pipeline>();
    }

    #[test]
    fn alerter_is_send_sync() {
        assert_send::<Alerter>();
        assert_sync::<Alerter>();
    }

    #[test]
    fn report_types_are_send_sync() {
        assert_send::<RunReport>();
        assert_sync::<RunReport>();
        assert_send::<Failure>();
        assert_sync::<Failure>();
    }

    #[test]
    fn config_is_send_sync() {
        assert_send::<PipelineConfig>();
        assert_sync::<PipelineConfig>();
    }
}
