//! Order-book snapshot streams (newline-delimited JSON `l2Book` records).

use super::loader::LoadError;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One price level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    pub price: f64,
    pub size: f64,
    pub orders: u32,
}

impl Level {
    pub fn notional(&self) -> f64 {
        self.price * self.size
    }
}

/// A point-in-time book. Bids best-first (descending), asks best-first (ascending).
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookSnapshot {
    pub time: DateTime<Utc>,
    pub coin: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

#[derive(Debug, Deserialize)]
struct SnapshotRecord {
    raw: RawEnvelope,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    data: BookData,
}

#[derive(Debug, Deserialize)]
struct BookData {
    coin: String,
    time: i64,
    levels: Vec<Vec<WireLevel>>,
}

#[derive(Debug, Deserialize)]
struct WireLevel {
    px: String,
    sz: String,
    n: u32,
}

/// Parse a decompressed snapshot stream. Blank lines are skipped.
pub fn parse_snapshots(payload: &[u8]) -> Result<Vec<OrderBookSnapshot>, LoadError> {
    let text = std::str::from_utf8(payload).map_err(|e| LoadError::Malformed(e.to_string()))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| parse_line(i as u64 + 1, line))
        .collect()
}

fn parse_line(line_no: u64, line: &str) -> Result<OrderBookSnapshot, LoadError> {
    let invalid = |message: String| LoadError::InvalidRecord {
        line: line_no,
        message,
    };
    let record: SnapshotRecord =
        serde_json::from_str(line).map_err(|e| invalid(e.to_string()))?;
    let data = record.raw.data;

    let time = DateTime::from_timestamp_millis(data.time)
        .ok_or_else(|| invalid(format!("time {} out of range", data.time)))?;

    let mut sides = data.levels.into_iter();
    let (bids, asks) = match (sides.next(), sides.next(), sides.next()) {
        (Some(bids), Some(asks), None) => (bids, asks),
        _ => return Err(invalid("expected exactly two sides in levels".into())),
    };

    let convert = |side: Vec<WireLevel>| -> Result<Vec<Level>, LoadError> {
        side.into_iter()
            .map(|level| {
                let price = parse_number(&level.px)
                    .ok_or_else(|| invalid(format!("px '{}' is not numeric", level.px)))?;
                let size = parse_number(&level.sz)
                    .ok_or_else(|| invalid(format!("sz '{}' is not numeric", level.sz)))?;
                Ok(Level {
                    price,
                    size,
                    orders: level.n,
                })
            })
            .collect()
    };

    Ok(OrderBookSnapshot {
        time,
        coin: data.coin,
        bids: convert(bids)?,
        asks: convert(asks)?,
    })
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
