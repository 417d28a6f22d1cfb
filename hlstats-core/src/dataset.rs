//! Dataset registry: table-driven descriptors for every supported dataset.
//!
//! Each dataset names its source prefix in the bucket, its raw and cache
//! tables, how its partitions are laid out, which raw columns it requires and
//! how those columns are grouped and aggregated. The pipeline never branches
//! on dataset names; it reads these descriptors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Name of the time column present in every raw and cache table.
pub const TIME_COLUMN: &str = "time";

/// Default notional tiers (USD) for order-book slippage.
pub const DEFAULT_NOTIONAL_TIERS: [f64; 3] = [1000.0, 3000.0, 10000.0];

/// Suffix appended to a raw table name to form its cache table.
pub const CACHE_SUFFIX: &str = "_cache";

/// Value type of a raw or cache column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Float,
    Bool,
    Timestamp,
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// How a dataset's source objects are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    /// `{prefix}/{YYYYMMDD}.csv.lz4`
    FlatDaily,
    /// `{prefix}/{YYYYMMDD}/{hour}/l2Book/{asset}.lz4`
    NestedHourlyPerAsset,
}

/// Aggregation function applied per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Mean,
    Sum,
    Count,
}

/// One aggregated cache metric: `func(source) AS alias`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub source: String,
    pub func: AggFunc,
    pub alias: String,
}

impl Aggregation {
    pub fn mean(source: &str, alias: &str) -> Self {
        Self::new(source, AggFunc::Mean, alias)
    }

    pub fn sum(source: &str, alias: &str) -> Self {
        Self::new(source, AggFunc::Sum, alias)
    }

    /// Row count per group. The source column is only used for naming.
    pub fn count(alias: &str) -> Self {
        Self::new(TIME_COLUMN, AggFunc::Count, alias)
    }

    fn new(source: &str, func: AggFunc, alias: &str) -> Self {
        Self {
            source: source.to_string(),
            func,
            alias: alias.to_string(),
        }
    }
}

/// A metric computed from two aggregated metrics: `left × right AS alias`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedProduct {
    pub left: String,
    pub right: String,
    pub alias: String,
}

/// Which feature transform turns partition data into cache rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransformSpec {
    /// Group-by aggregation over a delimited raw table.
    Tabular {
        aggregations: Vec<Aggregation>,
        derived: Vec<DerivedProduct>,
    },
    /// Liquidity and slippage over order-book snapshots, one tier per notional.
    OrderBook { tiers: Vec<f64> },
}

/// Immutable description of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Registry name, also used in configuration (`dataset_list`).
    pub name: String,
    /// Key prefix of the dataset's objects in the bucket.
    pub source_prefix: String,
    /// Raw table, absent for datasets aggregated straight from the fetched stream.
    pub raw_table: Option<String>,
    pub cache_table: String,
    pub scheme: PartitionScheme,
    /// Required raw columns (flat datasets only).
    pub columns: Vec<ColumnSpec>,
    /// Group-by keys of the cache table, in output order.
    pub group_keys: Vec<ColumnSpec>,
    pub transform: TransformSpec,
}

impl Dataset {
    /// Names of the numeric cache columns, in table order.
    pub fn metric_names(&self) -> Vec<String> {
        match &self.transform {
            TransformSpec::Tabular {
                aggregations,
                derived,
            } => aggregations
                .iter()
                .map(|a| a.alias.clone())
                .chain(derived.iter().map(|d| d.alias.clone()))
                .collect(),
            TransformSpec::OrderBook { tiers } => {
                let mut names = vec!["median_liquidity".to_string()];
                names.extend(tiers.iter().map(|t| slippage_column(*t)));
                names.push("mid_price".to_string());
                names.push("snapshot_count".to_string());
                names
            }
        }
    }

    /// Look up a required raw column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_nested(&self) -> bool {
        self.scheme == PartitionScheme::NestedHourlyPerAsset
    }
}

/// Cache column name for a slippage tier: `median_slippage_1000`, `median_slippage_2_5`.
pub fn slippage_column(tier: f64) -> String {
    if tier.fract() == 0.0 {
        format!("median_slippage_{tier:.0}")
    } else {
        format!("median_slippage_{}", tier.to_string().replace('.', "_"))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown dataset '{name}' (known: {known})")]
    UnknownDataset { name: String, known: String },
}

/// All datasets the pipeline knows how to synchronize.
#[derive(Debug, Clone)]
pub struct DatasetRegistry {
    datasets: BTreeMap<String, Dataset>,
}

impl DatasetRegistry {
    /// The built-in datasets. `tiers` shapes the order-book cache schema.
    pub fn builtin(tiers: &[f64]) -> Self {
        use ColumnKind::{Bool, Float, Text, Timestamp};

        let mut datasets = BTreeMap::new();
        let mut add = |ds: Dataset| {
            datasets.insert(ds.name.clone(), ds);
        };

        add(flat(
            "non_mm_trades",
            "non_mm_trades",
            &[
                ("user", Text),
                ("coin", Text),
                ("side", Text),
                ("px", Float),
                ("sz", Float),
                ("crossed", Bool),
                ("special_trade_type", Text),
            ],
            &["user", "coin", "side", "crossed", "special_trade_type"],
            vec![
                Aggregation::mean("px", "mean_px"),
                Aggregation::sum("sz", "sum_sz"),
                Aggregation::count("group_count"),
            ],
            vec![DerivedProduct {
                left: "mean_px".into(),
                right: "sum_sz".into(),
                alias: "usd_volume".into(),
            }],
        ));

        add(flat(
            "non_mm_ledger_updates",
            "ledger_updates",
            &[("user", Text), ("delta_usd", Float)],
            &["user"],
            vec![Aggregation::sum("delta_usd", "sum_delta_usd")],
            vec![],
        ));

        add(flat(
            "liquidations",
            "liquidations",
            &[
                ("user", Text),
                ("liquidated_ntl_pos", Float),
                ("liquidated_account_value", Float),
                ("leverage_type", Text),
            ],
            &["user", "leverage_type"],
            vec![
                Aggregation::sum("liquidated_ntl_pos", "sum_liquidated_ntl_pos"),
                Aggregation::sum("liquidated_account_value", "sum_liquidated_account_value"),
            ],
            vec![],
        ));

        add(flat(
            "funding",
            "funding",
            &[("coin", Text), ("funding", Float), ("premium", Float)],
            &["coin"],
            vec![
                Aggregation::sum("funding", "sum_funding"),
                Aggregation::sum("premium", "sum_premium"),
            ],
            vec![],
        ));

        add(flat(
            "account_values",
            "account_values",
            &[
                ("user", Text),
                ("is_vault", Bool),
                ("account_value", Float),
                ("cum_vlm", Float),
                ("cum_ledger", Float),
            ],
            &["user", "is_vault"],
            vec![
                Aggregation::sum("account_value", "sum_account_value"),
                Aggregation::sum("cum_vlm", "sum_cum_vlm"),
                Aggregation::sum("cum_ledger", "sum_cum_ledger"),
            ],
            vec![],
        ));

        add(flat(
            "asset_ctxs",
            "asset_ctxs",
            &[
                ("coin", Text),
                ("funding", Float),
                ("open_interest", Float),
                ("oracle_px", Float),
                ("mark_px", Float),
                ("day_ntl_vlm", Float),
            ],
            &["coin"],
            vec![
                Aggregation::sum("funding", "sum_funding"),
                Aggregation::sum("open_interest", "sum_open_interest"),
                Aggregation::mean("open_interest", "avg_open_interest"),
                Aggregation::mean("oracle_px", "avg_oracle_px"),
                Aggregation::mean("mark_px", "avg_mark_px"),
                Aggregation::sum("day_ntl_vlm", "sum_day_ntl_vlm"),
            ],
            vec![],
        ));

        add(Dataset {
            name: "market_data".into(),
            source_prefix: "market_data".into(),
            raw_table: None,
            cache_table: format!("market_data{CACHE_SUFFIX}"),
            scheme: PartitionScheme::NestedHourlyPerAsset,
            columns: vec![],
            group_keys: vec![ColumnSpec::new("coin", Text)],
            transform: TransformSpec::OrderBook {
                tiers: tiers.to_vec(),
            },
        });

        // Every flat dataset carries the time column first.
        for ds in datasets.values_mut() {
            if ds.scheme == PartitionScheme::FlatDaily {
                ds.columns.insert(0, ColumnSpec::new(TIME_COLUMN, Timestamp));
            }
        }

        Self { datasets }
    }

    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.datasets.get(name)
    }

    /// Registry names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.datasets.keys().map(|k| k.as_str()).collect()
    }

    /// Resolve configured dataset names, preserving the configured order.
    pub fn select(&self, names: &[String]) -> Result<Vec<Dataset>, RegistryError> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .cloned()
                    .ok_or_else(|| RegistryError::UnknownDataset {
                        name: name.clone(),
                        known: self.names().join(", "),
                    })
            })
            .collect()
    }
}

fn flat(
    name: &str,
    source_prefix: &str,
    columns: &[(&str, ColumnKind)],
    keys: &[&str],
    aggregations: Vec<Aggregation>,
    derived: Vec<DerivedProduct>,
) -> Dataset {
    let columns: Vec<ColumnSpec> = columns
        .iter()
        .map(|(n, k)| ColumnSpec::new(*n, *k))
        .collect();
    let group_keys = keys
        .iter()
        .filter_map(|k| columns.iter().find(|c| c.name == *k).cloned())
        .collect();
    Dataset {
        name: name.to_string(),
        source_prefix: source_prefix.to_string(),
        raw_table: Some(name.to_string()),
        cache_table: format!("{name}{CACHE_SUFFIX}"),
        scheme: PartitionScheme::FlatDaily,
        columns,
        group_keys,
        transform: TransformSpec::Tabular {
            aggregations,
            derived,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DatasetRegistry {
        DatasetRegistry::builtin(&DEFAULT_NOTIONAL_TIERS)
    }

    #[test]
    fn builtin_covers_every_table() {
        let reg = registry();
        assert_eq!(
            reg.names(),
            vec![
                "account_values",
                "asset_ctxs",
                "funding",
                "liquidations",
                "market_data",
                "non_mm_ledger_updates",
                "non_mm_trades",
            ]
        );
        let ledger = reg.get("non_mm_ledger_updates").unwrap();
        assert_eq!(ledger.source_prefix, "ledger_updates");
        assert_eq!(ledger.cache_table, "non_mm_ledger_updates_cache");
    }

    #[test]
    fn group_keys_resolve_to_raw_columns() {
        let reg = registry();
        for name in reg.names() {
            let ds = reg.get(name).unwrap();
            if ds.scheme == PartitionScheme::FlatDaily {
                assert_eq!(ds.columns[0].name, TIME_COLUMN, "{name}");
                for key in &ds.group_keys {
                    assert_eq!(ds.column(&key.name), Some(key), "{name}.{}", key.name);
                }
            }
        }
    }

    #[test]
    fn trades_metrics_in_cache_order() {
        let reg = registry();
        let trades = reg.get("non_mm_trades").unwrap();
        assert_eq!(
            trades.metric_names(),
            vec!["mean_px", "sum_sz", "group_count", "usd_volume"]
        );
        let keys: Vec<_> = trades.group_keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(
            keys,
            vec!["user", "coin", "side", "crossed", "special_trade_type"]
        );
    }

    #[test]
    fn order_book_has_no_raw_table_and_tiered_metrics() {
        let reg = DatasetRegistry::builtin(&[1000.0, 2.5]);
        let md = reg.get("market_data").unwrap();
        assert!(md.raw_table.is_none());
        assert!(md.is_nested());
        assert_eq!(
            md.metric_names(),
            vec![
                "median_liquidity",
                "median_slippage_1000",
                "median_slippage_2_5",
                "mid_price",
                "snapshot_count",
            ]
        );
    }

    #[test]
    fn select_preserves_order_and_rejects_unknown() {
        let reg = registry();
        let picked = reg
            .select(&["funding".to_string(), "liquidations".to_string()])
            .unwrap();
        assert_eq!(picked[0].name, "funding");
        assert_eq!(picked[1].name, "liquidations");

        let err = reg.select(&["candles".to_string()]).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDataset { ref name, .. } if name == "candles"));
    }
}
