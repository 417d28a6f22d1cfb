//! Asset catalog: the universe of tradable symbols for nested datasets.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("asset catalog request failed: {0}")]
    Request(String),

    #[error("asset catalog returned HTTP {0}")]
    Status(u16),

    #[error("asset catalog response is malformed: {0}")]
    Malformed(String),

    #[error("asset catalog is empty")]
    Empty,
}

/// Resolves the tradable-symbol universe. Called at most once per run.
pub trait AssetCatalog: Send + Sync {
    fn assets(&self) -> Result<Vec<String>, CatalogError>;
}

/// Exchange info endpoint (`POST {"type":"meta"}`).
pub struct HttpAssetCatalog {
    client: reqwest::blocking::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct MetaResponse {
    universe: Vec<UniverseEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UniverseEntry {
    name: String,
    #[serde(default)]
    is_delisted: bool,
}

impl HttpAssetCatalog {
    pub fn new(url: impl Into<String>) -> Result<Self, CatalogError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CatalogError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl AssetCatalog for HttpAssetCatalog {
    fn assets(&self) -> Result<Vec<String>, CatalogError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "type": "meta" }))
            .send()
            .map_err(|e| CatalogError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CatalogError::Status(resp.status().as_u16()));
        }

        let body = resp
            .text()
            .map_err(|e| CatalogError::Request(e.to_string()))?;
        let assets = parse_meta(&body)?;
        debug!(url = %self.url, assets = assets.len(), "fetched asset catalog");
        Ok(assets)
    }
}

/// Listed universe names, in catalog order.
fn parse_meta(body: &str) -> Result<Vec<String>, CatalogError> {
    let meta: MetaResponse =
        serde_json::from_str(body).map_err(|e| CatalogError::Malformed(e.to_string()))?;
    let assets: Vec<String> = meta
        .universe
        .into_iter()
        .filter(|entry| !entry.is_delisted)
        .map(|entry| entry.name)
        .collect();
    if assets.is_empty() {
        return Err(CatalogError::Empty);
    }
    Ok(assets)
}

/// Fixed symbol list from configuration.
#[derive(Debug, Clone)]
pub struct StaticAssetCatalog {
    symbols: Vec<String>,
}

impl StaticAssetCatalog {
    pub fn new(symbols: Vec<String>) -> Self {
        Self { symbols }
    }
}

impl AssetCatalog for StaticAssetCatalog {
    fn assets(&self) -> Result<Vec<String>, CatalogError> {
        if self.symbols.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(self.symbols.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_drops_delisted_and_keeps_order() {
        let body = r#"{"universe":[
            {"name":"BTC","szDecimals":5,"maxLeverage":50},
            {"name":"LUNA","szDecimals":1,"maxLeverage":3,"isDelisted":true},
            {"name":"ETH","szDecimals":4,"maxLeverage":50}
        ]}"#;
        assert_eq!(parse_meta(body).unwrap(), vec!["BTC", "ETH"]);
    }

    #[test]
    fn malformed_meta() {
        assert!(matches!(
            parse_meta(r#"{"assets":[]}"#),
            Err(CatalogError::Malformed(_))
        ));
        assert!(matches!(
            parse_meta(r#"{"universe":[]}"#),
            Err(CatalogError::Empty)
        ));
    }

    #[test]
    fn static_catalog() {
        let catalog = StaticAssetCatalog::new(vec!["BTC".into(), "SOL".into()]);
        assert_eq!(catalog.assets().unwrap(), vec!["BTC", "SOL"]);
        assert!(StaticAssetCatalog::new(vec![]).assets().is_err());
    }
}
