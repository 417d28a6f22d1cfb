//! Pipeline configuration (TOML).
//!
//! ```toml
//! database_uri = "sqlite://data/hlstats.db"
//! dataset_list = ["non_mm_trades", "funding", "market_data"]
//! notional_tiers = [1000, 3000, 10000]
//!
//! [object_store]
//! bucket = "hyperliquid-archive"
//! region = "ap-northeast-1"
//! requester_pays = true
//! credentials = { access_key_id = "...", secret_access_key = "..." }
//!
//! [alert]
//! channel = "#hyperliquid-alerts"
//! slack_token = "xoxb-..."
//! ```
//!
//! The configuration is validated once at startup and is immutable
//! afterwards; every component receives the pieces it needs by value.

use crate::alert::{AlertSink, LogAlertSink, SlackAlertSink, DEFAULT_CHANNEL};
use crate::pipeline::PipelineSettings;
use hlstats_core::data::{
    AssetCatalog, CircuitBreaker, HttpAssetCatalog, LocalObjectFetcher, ObjectFetcher,
    S3Credentials, S3ObjectFetcher, S3Settings, StaticAssetCatalog,
};
use hlstats_core::dataset::{RegistryError, DEFAULT_NOTIONAL_TIERS};
use hlstats_core::store::{open_database, parse_uri, TableStore};
use hlstats_core::watermark::{DEFAULT_LOOKBACK_DAYS, DEFAULT_RETRY_WINDOW_DAYS, MAX_WINDOW_DAYS};
use hlstats_core::{Dataset, DatasetRegistry};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Exchange info endpoint used for the asset catalog.
pub const DEFAULT_CATALOG_URL: &str = "https://api.hyperliquid.xyz/info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    UnknownDataset(#[from] RegistryError),

    #[error("failed to initialize {component}: {message}")]
    Init {
        component: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// `sqlite://<path>`, `sqlite::memory:` or a file path.
    pub database_uri: String,
    /// Datasets to synchronize, in run order.
    pub dataset_list: Vec<String>,
    #[serde(default = "default_tiers")]
    pub notional_tiers: Vec<f64>,
    /// Window seeded for a dataset whose cache table is empty.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// How far back missing cache dates are retried. Zero disables retries.
    #[serde(default = "default_retry_window_days")]
    pub retry_window_days: u32,
    /// Fetch one day's order-book partitions in parallel.
    #[serde(default = "default_true")]
    pub parallel_assets: bool,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub asset_catalog: AssetCatalogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectStoreConfig {
    #[serde(default)]
    pub bucket: String,
    /// Custom S3-compatible endpoint (path-style).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub requester_pays: bool,
    #[serde(default)]
    pub credentials: Option<S3Credentials>,
    /// Read objects from a directory mirror of the bucket instead.
    #[serde(default)]
    pub local_root: Option<PathBuf>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertConfig {
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Without a token alerts go to the log.
    #[serde(default)]
    pub slack_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetCatalogConfig {
    #[serde(default = "default_catalog_url")]
    pub url: String,
    /// Static symbol list; when set the endpoint is not queried.
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
}

fn default_tiers() -> Vec<f64> {
    DEFAULT_NOTIONAL_TIERS.to_vec()
}

fn default_lookback_days() -> u32 {
    DEFAULT_LOOKBACK_DAYS
}

fn default_retry_window_days() -> u32 {
    DEFAULT_RETRY_WINDOW_DAYS
}

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".into()
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.into()
}

fn default_catalog_url() -> String {
    DEFAULT_CATALOG_URL.into()
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: None,
            region: default_region(),
            requester_pays: false,
            credentials: None,
            local_root: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            slack_token: None,
        }
    }
}

impl Default for AssetCatalogConfig {
    fn default() -> Self {
        Self {
            url: default_catalog_url(),
            symbols: None,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.dataset_list.is_empty() {
            return invalid("dataset_list is empty".into());
        }
        let mut seen = std::collections::BTreeSet::new();
        for name in &self.dataset_list {
            if !seen.insert(name.as_str()) {
                return invalid(format!("dataset '{name}' is listed twice"));
            }
        }
        self.registry().select(&self.dataset_list)?;

        if self.notional_tiers.is_empty() {
            return invalid("notional_tiers is empty".into());
        }
        for (i, tier) in self.notional_tiers.iter().enumerate() {
            if !(tier.is_finite() && *tier > 0.0) {
                return invalid(format!("notional tier {tier} must be a positive number"));
            }
            if self.notional_tiers[..i].contains(tier) {
                return invalid(format!("notional tier {tier} is listed twice"));
            }
        }

        if !(1..=MAX_WINDOW_DAYS).contains(&self.lookback_days) {
            return invalid(format!(
                "lookback_days must be between 1 and {MAX_WINDOW_DAYS}, got {}",
                self.lookback_days
            ));
        }
        if self.retry_window_days > MAX_WINDOW_DAYS {
            return invalid(format!(
                "retry_window_days must be at most {MAX_WINDOW_DAYS}, got {}",
                self.retry_window_days
            ));
        }

        parse_uri(&self.database_uri).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let store = &self.object_store;
        if store.local_root.is_none() {
            if store.bucket.trim().is_empty() {
                return invalid("object_store.bucket is empty and no local_root is set".into());
            }
            if store.requester_pays && store.credentials.is_none() {
                return invalid("object_store.requester_pays requires credentials".into());
            }
        }
        if let Some(creds) = &store.credentials {
            if creds.access_key_id.is_empty() || creds.secret_access_key.is_empty() {
                return invalid("object_store.credentials has an empty key".into());
            }
        }

        if let Some(symbols) = &self.asset_catalog.symbols {
            if symbols.is_empty() {
                return invalid("asset_catalog.symbols is empty".into());
            }
        }
        Ok(())
    }

    /// Registry shaped by the configured notional tiers.
    pub fn registry(&self) -> DatasetRegistry {
        DatasetRegistry::builtin(&self.notional_tiers)
    }

    /// Configured datasets in run order, optionally narrowed to `only`.
    pub fn datasets(&self, only: &[String]) -> Result<Vec<Dataset>, ConfigError> {
        let selected = self.registry().select(&self.dataset_list)?;
        if only.is_empty() {
            return Ok(selected);
        }
        for name in only {
            if !self.dataset_list.contains(name) {
                return Err(ConfigError::Invalid(format!(
                    "dataset '{name}' is not in dataset_list"
                )));
            }
        }
        Ok(selected
            .into_iter()
            .filter(|d| only.contains(&d.name))
            .collect())
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            lookback_days: self.lookback_days,
            retry_window_days: self.retry_window_days,
            parallel_assets: self.parallel_assets,
        }
    }

    pub fn build_store(&self) -> Result<Arc<dyn TableStore>, ConfigError> {
        let store = open_database(&self.database_uri).map_err(|e| ConfigError::Init {
            component: "table store",
            message: e.to_string(),
        })?;
        Ok(Arc::new(store))
    }

    pub fn build_fetcher(&self) -> Result<Arc<dyn ObjectFetcher>, ConfigError> {
        let store = &self.object_store;
        if let Some(root) = &store.local_root {
            return Ok(Arc::new(LocalObjectFetcher::new(root.clone())));
        }
        let mut settings = S3Settings::new(store.bucket.clone(), store.region.clone());
        settings.endpoint = store.endpoint.clone();
        settings.requester_pays = store.requester_pays;
        settings.credentials = store.credentials.clone();
        settings.max_retries = store.max_retries;
        settings.timeout = Duration::from_secs(store.timeout_secs);

        let fetcher = S3ObjectFetcher::new(settings, Arc::new(CircuitBreaker::for_object_store()))
            .map_err(|e| ConfigError::Init {
                component: "object store",
                message: e.to_string(),
            })?;
        Ok(Arc::new(fetcher))
    }

    pub fn build_catalog(&self) -> Result<Arc<dyn AssetCatalog>, ConfigError> {
        if let Some(symbols) = &self.asset_catalog.symbols {
            return Ok(Arc::new(StaticAssetCatalog::new(symbols.clone())));
        }
        let catalog = HttpAssetCatalog::new(self.asset_catalog.url.clone()).map_err(|e| {
            ConfigError::Init {
                component: "asset catalog",
                message: e.to_string(),
            }
        })?;
        Ok(Arc::new(catalog))
    }

    pub fn build_alert_sink(&self) -> Result<Arc<dyn AlertSink>, ConfigError> {
        match &self.alert.slack_token {
            Some(token) if !token.is_empty() => {
                let sink = SlackAlertSink::new(token.clone(), self.alert.channel.clone())
                    .map_err(|e| ConfigError::Init {
                        component: "slack alerts",
                        message: e.to_string(),
                    })?;
                Ok(Arc::new(sink))
            }
            _ => Ok(Arc::new(LogAlertSink)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
database_uri = "sqlite::memory:"
dataset_list = ["non_mm_trades", "market_data"]

[object_store]
bucket = "hyperliquid-archive"
"#;

    fn with(extra: &str) -> String {
        format!("{MINIMAL}\n{extra}")
    }

    #[test]
    fn defaults_fill_in() {
        let config = PipelineConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.notional_tiers, vec![1000.0, 3000.0, 10000.0]);
        assert_eq!(config.lookback_days, 30);
        assert_eq!(config.retry_window_days, 30);
        assert!(config.parallel_assets);
        assert_eq!(config.alert.channel, "#hyperliquid-alerts");
        assert_eq!(config.asset_catalog.url, DEFAULT_CATALOG_URL);
        assert!(!config.object_store.requester_pays);

        let names: Vec<_> = config
            .datasets(&[])
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["non_mm_trades", "market_data"]);
    }

    #[test]
    fn full_config_parses() {
        let toml = r##"
database_uri = "sqlite://data/hlstats.db"
dataset_list = ["funding"]
notional_tiers = [500, 2500.5]
lookback_days = 7
retry_window_days = 0
parallel_assets = false

[object_store]
bucket = "hyperliquid-archive"
region = "ap-northeast-1"
requester_pays = true
credentials = { access_key_id = "AKID", secret_access_key = "secret" }

[alert]
channel = "#ops"
slack_token = "xoxb-1"

[asset_catalog]
symbols = ["BTC", "ETH"]
"##;
        let config = PipelineConfig::from_toml(toml).unwrap();
        assert_eq!(config.notional_tiers, vec![500.0, 2500.5]);
        assert_eq!(config.object_store.region, "ap-northeast-1");
        assert_eq!(
            config.object_store.credentials.as_ref().unwrap().access_key_id,
            "AKID"
        );
        assert_eq!(config.asset_catalog.symbols.as_ref().unwrap().len(), 2);
        assert!(!config.settings().parallel_assets);
        assert_eq!(config.build_catalog().unwrap().assets().unwrap(), vec!["BTC", "ETH"]);
    }

    #[test]
    fn rejects_empty_and_unknown_datasets() {
        let empty = MINIMAL.replace(r#"["non_mm_trades", "market_data"]"#, "[]");
        assert!(matches!(
            PipelineConfig::from_toml(&empty),
            Err(ConfigError::Invalid(_))
        ));

        let unknown = MINIMAL.replace("market_data", "orderbook");
        assert!(matches!(
            PipelineConfig::from_toml(&unknown),
            Err(ConfigError::UnknownDataset(_))
        ));

        let twice = MINIMAL.replace("market_data", "non_mm_trades");
        assert!(PipelineConfig::from_toml(&twice).is_err());
    }

    #[test]
    fn rejects_bad_tiers() {
        for tiers in ["[]", "[0]", "[-5, 10]", "[1000, 1000]"] {
            // Top-level keys must precede the first table header.
            let toml = format!("notional_tiers = {tiers}\n{MINIMAL}");
            assert!(
                matches!(PipelineConfig::from_toml(&toml), Err(ConfigError::Invalid(_))),
                "tiers {tiers} accepted"
            );
        }
    }

    #[test]
    fn rejects_out_of_range_windows() {
        for window in ["lookback_days = 0", "lookback_days = 4294967295", "retry_window_days = 3651"] {
            let toml = format!("{window}\n{MINIMAL}");
            assert!(
                matches!(PipelineConfig::from_toml(&toml), Err(ConfigError::Invalid(msg)) if msg.contains("_days")),
                "{window} accepted"
            );
        }
        let widest = format!("lookback_days = 3650\nretry_window_days = 3650\n{MINIMAL}");
        assert!(PipelineConfig::from_toml(&widest).is_ok());
    }

    #[test]
    fn rejects_bucket_and_credential_problems() {
        let no_bucket = MINIMAL.replace(r#"bucket = "hyperliquid-archive""#, "");
        assert!(PipelineConfig::from_toml(&no_bucket).is_err());

        let local = MINIMAL.replace(
            r#"bucket = "hyperliquid-archive""#,
            r#"local_root = "/srv/mirror""#,
        );
        assert!(PipelineConfig::from_toml(&local).is_ok());

        let payer = with("requester_pays = true");
        assert!(matches!(
            PipelineConfig::from_toml(&payer),
            Err(ConfigError::Invalid(msg)) if msg.contains("requester_pays")
        ));
    }

    #[test]
    fn rejects_unsupported_database() {
        let pg = MINIMAL.replace("sqlite::memory:", "postgresql://localhost/hl");
        assert!(matches!(
            PipelineConfig::from_toml(&pg),
            Err(ConfigError::Invalid(msg)) if msg.contains("postgresql")
        ));
    }

    #[test]
    fn narrowing_to_a_subset() {
        let config = PipelineConfig::from_toml(MINIMAL).unwrap();
        let only = config.datasets(&["market_data".to_string()]).unwrap();
        assert_eq!(only.len(), 1);
        assert!(config.datasets(&["funding".to_string()]).is_err());
    }

    #[test]
    fn builds_local_components() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
database_uri = "{}"
dataset_list = ["funding"]

[object_store]
local_root = "{}"
"#,
            dir.path().join("hl.db").display(),
            dir.path().display()
        );
        let config = PipelineConfig::from_toml(&toml).unwrap();
        assert_eq!(config.build_fetcher().unwrap().name(), "local_mirror");
        assert_eq!(config.build_alert_sink().unwrap().name(), "log");
        assert_eq!(config.build_store().unwrap().row_count("funding").unwrap(), 0);
    }

    #[test]
    fn unreachable_store_fails_startup_verification() {
        let toml = r#"
database_uri = "sqlite::memory:"
dataset_list = ["funding"]

[object_store]
bucket = "hyperliquid-archive"
endpoint = "http://127.0.0.1:1"
max_retries = 0
timeout_secs = 2
credentials = { access_key_id = "AKID", secret_access_key = "secret" }
"#;
        let config = PipelineConfig::from_toml(toml).unwrap();
        let pipeline = crate::Pipeline::from_config(&config, &[]).unwrap();
        assert!(matches!(
            pipeline.verify_object_store(),
            Err(ConfigError::Init { component: "object store", ref message }) if message.contains("unreachable")
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            PipelineConfig::from_toml(&format!("tables = []\n{MINIMAL}")),
            Err(ConfigError::Parse(_))
        ));
    }
}
