//! Alerts: partition failures, skipped datasets and watermark divergence.
//!
//! Delivery is best effort. A failed alert is logged and dropped; it never
//! changes the outcome of a run.

use crate::consistency::ConsistencyStatus;
use crate::report::{Failure, FailureKind};
use chrono::NaiveDate;
use hlstats_core::Partition;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Slack Web API endpoint for posting messages.
pub const SLACK_POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

/// Default alert channel.
pub const DEFAULT_CHANNEL: &str = "#hyperliquid-alerts";

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert request failed: {0}")]
    Request(String),

    #[error("alert rejected: {0}")]
    Rejected(String),
}

/// Notification channel.
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    fn send(&self, message: &str) -> Result<(), AlertError>;
}

/// Something worth telling a human about.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    PartitionFailed {
        partition: Partition,
        failure: Failure,
    },
    /// Several partitions of one order-book day failed.
    DayPartiallyFailed {
        dataset: String,
        date: NaiveDate,
        failed: usize,
        attempted: usize,
        first: Failure,
    },
    DatasetSkipped {
        dataset: String,
        failure: Failure,
    },
    Divergence {
        dataset: String,
        status: ConsistencyStatus,
    },
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::PartitionFailed { partition, failure } => write!(
                f,
                "Data processing for {partition} failed at {} stage: {}",
                failure.kind, failure.message
            ),
            Alert::DayPartiallyFailed {
                dataset,
                date,
                failed,
                attempted,
                first,
            } => write!(
                f,
                "Data processing for {dataset} {date}: {failed} of {attempted} partitions failed (first, {}: {})",
                first.kind, first.message
            ),
            Alert::DatasetSkipped { dataset, failure } => write!(
                f,
                "Dataset {dataset} skipped this run ({}: {})",
                failure.kind, failure.message
            ),
            Alert::Divergence { dataset, status } => {
                write!(f, "Watermark check for {dataset}: {status}")
            }
        }
    }
}

impl Alert {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Alert::PartitionFailed { failure, .. } | Alert::DatasetSkipped { failure, .. } => {
                Some(failure.kind)
            }
            Alert::DayPartiallyFailed { first, .. } => Some(first.kind),
            Alert::Divergence { .. } => None,
        }
    }
}

/// Posts to a Slack channel through `chat.postMessage`.
pub struct SlackAlertSink {
    client: reqwest::blocking::Client,
    url: String,
    token: String,
    channel: String,
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackAlertSink {
    pub fn new(token: impl Into<String>, channel: impl Into<String>) -> Result<Self, AlertError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AlertError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: SLACK_POST_MESSAGE_URL.to_string(),
            token: token.into(),
            channel: channel.into(),
        })
    }

    /// Point at a different API base (tests, proxies).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

impl AlertSink for SlackAlertSink {
    fn name(&self) -> &str {
        "slack"
    }

    fn send(&self, message: &str) -> Result<(), AlertError> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "channel": self.channel, "text": message }))
            .send()
            .map_err(|e| AlertError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AlertError::Rejected(format!("HTTP {}", resp.status())));
        }
        let body: SlackResponse = resp
            .json()
            .map_err(|e| AlertError::Request(e.to_string()))?;
        if !body.ok {
            return Err(AlertError::Rejected(
                body.error.unwrap_or_else(|| "unknown error".into()),
            ));
        }
        Ok(())
    }
}

/// Writes alerts to the log. Used when no Slack token is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&self, message: &str) -> Result<(), AlertError> {
        warn!(target: "hlstats::alert", "{message}");
        Ok(())
    }
}

/// Front of the alert sink used by the pipeline: formats, sends, swallows failures.
#[derive(Clone)]
pub struct Alerter {
    sink: Arc<dyn AlertSink>,
    sent: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl Alerter {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self {
            sink,
            sent: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn notify(&self, alert: &Alert) {
        let message = alert.to_string();
        match self.sink.send(&message) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(sink = self.sink.name(), error = %e, "failed to deliver alert");
            }
        }
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<String>>);

    impl AlertSink for Recording {
        fn name(&self) -> &str {
            "recording"
        }
        fn send(&self, message: &str) -> Result<(), AlertError> {
            self.0.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    struct Broken;

    impl AlertSink for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn send(&self, _: &str) -> Result<(), AlertError> {
            Err(AlertError::Request("connection refused".into()))
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn messages_name_the_partition_and_stage() {
        let sink = Arc::new(Recording(Mutex::new(Vec::new())));
        let alerter = Alerter::new(sink.clone());
        alerter.notify(&Alert::PartitionFailed {
            partition: Partition::flat("funding", date(3)),
            failure: Failure::new(FailureKind::Fetch, "object not found: funding/20240103.csv.lz4"),
        });
        alerter.notify(&Alert::Divergence {
            dataset: "funding".into(),
            status: ConsistencyStatus::Divergence {
                cache: Some(date(9)),
                raw: Some(date(10)),
            },
        });

        let messages = sink.0.lock().unwrap();
        assert_eq!(
            messages[0],
            "Data processing for funding 2024-01-03 failed at fetch stage: object not found: funding/20240103.csv.lz4"
        );
        assert_eq!(
            messages[1],
            "Watermark check for funding: divergence (cache 2024-01-09, raw 2024-01-10)"
        );
        assert_eq!(alerter.sent(), 2);
    }

    #[test]
    fn delivery_failures_are_swallowed() {
        let alerter = Alerter::new(Arc::new(Broken));
        alerter.notify(&Alert::DatasetSkipped {
            dataset: "market_data".into(),
            failure: Failure::new(FailureKind::Catalog, "asset catalog is empty"),
        });
        assert_eq!(alerter.sent(), 0);
        assert_eq!(alerter.dropped(), 1);
    }

    #[test]
    fn slack_response_parsing() {
        let ok: SlackResponse = serde_json::from_str(r#"{"ok":true,"ts":"1.2"}"#).unwrap();
        assert!(ok.ok);
        let err: SlackResponse =
            serde_json::from_str(r#"{"ok":false,"error":"channel_not_found"}"#).unwrap();
        assert_eq!(err.error.as_deref(), Some("channel_not_found"));
    }
}
