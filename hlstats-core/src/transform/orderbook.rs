//! Order-book liquidity and slippage.
//!
//! Per snapshot:
//! - liquidity: total notional resting on both sides
//! - mid: average of best bid and best ask
//! - slippage per notional tier: relative distance between the average
//!   price of a market buy of that notional and the mid
//!
//! Per (date, coin) the snapshot metrics are reduced to medians, except the
//! mid price which is averaged.

use super::TransformError;
use crate::data::orderbook::{Level, OrderBookSnapshot};
use crate::records::{CacheRow, KeyValue};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Slippage reported when the ask side cannot absorb the tier.
pub const INSUFFICIENT_LIQUIDITY_SLIPPAGE: f64 = 1.0;

/// Metrics of one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotMetrics {
    pub coin: String,
    pub liquidity: f64,
    pub mid: f64,
    /// One value per notional tier, in tier order.
    pub slippage: Vec<f64>,
}

/// Σ price × size over every bid and ask level.
pub fn liquidity(snapshot: &OrderBookSnapshot) -> f64 {
    snapshot
        .bids
        .iter()
        .chain(&snapshot.asks)
        .map(Level::notional)
        .sum()
}

/// Midpoint of the best bid and best ask.
pub fn mid_price(snapshot: &OrderBookSnapshot) -> Result<f64, TransformError> {
    let malformed = |reason: &str| TransformError::MalformedSnapshot {
        coin: snapshot.coin.clone(),
        time: snapshot.time.to_rfc3339(),
        reason: reason.to_string(),
    };
    let best_bid = snapshot.bids.first().ok_or_else(|| malformed("empty bid side"))?;
    let best_ask = snapshot.asks.first().ok_or_else(|| malformed("empty ask side"))?;
    let mid = (best_bid.price + best_ask.price) / 2.0;
    if !(mid > 0.0) {
        return Err(malformed("non-positive mid price"));
    }
    Ok(mid)
}

/// Slippage of buying `notional` worth by walking `asks` best-first.
///
/// Each level contributes `min(level notional, remaining)`; the average
/// price is `Σ price × taken / notional`. Returns exactly `1.0` when the
/// whole ask side holds less than `notional`; no book scores worse than that.
pub fn slippage(asks: &[Level], mid: f64, notional: f64) -> f64 {
    let mut remaining = notional;
    let mut weighted = 0.0;
    for level in asks {
        if remaining <= 0.0 {
            break;
        }
        let taken = level.notional().min(remaining);
        weighted += level.price * taken;
        remaining -= taken;
    }
    if remaining > 0.0 {
        return INSUFFICIENT_LIQUIDITY_SLIPPAGE;
    }
    let avg = weighted / notional;
    (avg / mid - 1.0).abs().min(INSUFFICIENT_LIQUIDITY_SLIPPAGE)
}

pub fn snapshot_metrics(
    snapshot: &OrderBookSnapshot,
    tiers: &[f64],
) -> Result<SnapshotMetrics, TransformError> {
    let mid = mid_price(snapshot)?;
    Ok(SnapshotMetrics {
        coin: snapshot.coin.clone(),
        liquidity: liquidity(snapshot),
        mid,
        slippage: tiers
            .iter()
            .map(|&tier| slippage(&snapshot.asks, mid, tier))
            .collect(),
    })
}

/// Median; an even count averages the two middle values. `NaN` when empty.
pub fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Reduce one day's snapshot metrics to one cache row per coin, sorted by coin.
///
/// Metric order: `median_liquidity`, one `median_slippage_<tier>` per tier,
/// `mid_price`, `snapshot_count`.
pub fn aggregate_day(date: NaiveDate, metrics: &[SnapshotMetrics], tiers: usize) -> Vec<CacheRow> {
    let mut by_coin: BTreeMap<&str, Vec<&SnapshotMetrics>> = BTreeMap::new();
    for m in metrics {
        by_coin.entry(m.coin.as_str()).or_default().push(m);
    }

    by_coin
        .into_iter()
        .map(|(coin, group)| {
            let count = group.len();
            let mut values = Vec::with_capacity(tiers + 3);

            let mut liquidity: Vec<f64> = group.iter().map(|m| m.liquidity).collect();
            values.push(median(&mut liquidity));
            for tier in 0..tiers {
                let mut slip: Vec<f64> = group
                    .iter()
                    .filter_map(|m| m.slippage.get(tier).copied())
                    .collect();
                values.push(median(&mut slip));
            }
            values.push(group.iter().map(|m| m.mid).sum::<f64>() / count as f64);
            values.push(count as f64);

            CacheRow {
                date,
                keys: vec![KeyValue::Text(coin.to_string())],
                metrics: values,
            }
        })
        .collect()
}
