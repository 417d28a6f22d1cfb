//! Group-by aggregation of tabular datasets.
//!
//! The dataset descriptor names the group keys, the per-group aggregations
//! and any derived products; this module turns that into one polars lazy
//! query and reads the result back as cache rows stamped with the partition
//! date.

use super::TransformError;
use crate::dataset::{AggFunc, ColumnKind, Dataset, TransformSpec};
use crate::records::{CacheRow, ColumnData, KeyValue, RawTable};
use chrono::NaiveDate;
use polars::prelude::*;

/// Aggregate one partition's raw rows into cache rows, sorted by group key.
pub fn aggregate(
    dataset: &Dataset,
    table: &RawTable,
    date: NaiveDate,
) -> Result<Vec<CacheRow>, TransformError> {
    let TransformSpec::Tabular {
        aggregations,
        derived,
    } = &dataset.transform
    else {
        return Err(TransformError::WrongTransform {
            dataset: dataset.name.clone(),
            expected: "tabular",
        });
    };

    if table.is_empty() {
        return Ok(Vec::new());
    }

    let df = to_dataframe(dataset, table)?;

    let keys: Vec<Expr> = dataset
        .group_keys
        .iter()
        .map(|k| col(k.name.as_str()))
        .collect();
    let aggs: Vec<Expr> = aggregations
        .iter()
        .map(|a| match a.func {
            AggFunc::Mean => col(a.source.as_str()).mean().alias(a.alias.as_str()),
            AggFunc::Sum => col(a.source.as_str()).sum().alias(a.alias.as_str()),
            AggFunc::Count => len().cast(DataType::Float64).alias(a.alias.as_str()),
        })
        .collect();

    let mut query = df.lazy().group_by_stable(keys).agg(aggs);
    for d in derived {
        query = query.with_column((col(d.left.as_str()) * col(d.right.as_str())).alias(d.alias.as_str()));
    }
    let out = query.collect()?;

    let mut rows = read_rows(dataset, &out, date)?;
    rows.sort_by(|a, b| a.keys.cmp(&b.keys));
    Ok(rows)
}

/// Columns the query touches: group keys plus aggregation sources.
fn to_dataframe(dataset: &Dataset, table: &RawTable) -> Result<DataFrame, TransformError> {
    let mut names: Vec<&str> = dataset.group_keys.iter().map(|k| k.name.as_str()).collect();
    if let TransformSpec::Tabular { aggregations, .. } = &dataset.transform {
        for a in aggregations {
            if a.func != AggFunc::Count && !names.contains(&a.source.as_str()) {
                names.push(a.source.as_str());
            }
        }
    }

    let columns = names
        .into_iter()
        .map(|name| {
            let data = table
                .column(name)
                .ok_or_else(|| TransformError::MissingColumn(name.to_string()))?;
            Ok(match data {
                ColumnData::Text(v) => Column::new(name.into(), v.as_slice()),
                ColumnData::Float(v) => Column::new(name.into(), v.as_slice()),
                ColumnData::Bool(v) => Column::new(name.into(), v.as_slice()),
                ColumnData::Timestamp(v) => Column::new(
                    name.into(),
                    v.iter()
                        .map(|t| t.and_utc().timestamp_millis())
                        .collect::<Vec<i64>>(),
                ),
            })
        })
        .collect::<Result<Vec<_>, TransformError>>()?;

    Ok(DataFrame::new(columns)?)
}

fn read_rows(
    dataset: &Dataset,
    out: &DataFrame,
    date: NaiveDate,
) -> Result<Vec<CacheRow>, TransformError> {
    let n = out.height();
    let mut keys: Vec<Vec<KeyValue>> = vec![Vec::with_capacity(dataset.group_keys.len()); n];

    for key in &dataset.group_keys {
        let column = out.column(key.name.as_str())?;
        match key.kind {
            ColumnKind::Bool => {
                let ca = column.bool()?;
                for (i, row) in keys.iter_mut().enumerate() {
                    let v = ca.get(i).ok_or_else(|| null_key(&key.name, i))?;
                    row.push(KeyValue::Bool(v));
                }
            }
            _ => {
                let ca = column.str()?;
                for (i, row) in keys.iter_mut().enumerate() {
                    let v = ca.get(i).ok_or_else(|| null_key(&key.name, i))?;
                    row.push(KeyValue::Text(v.to_string()));
                }
            }
        }
    }

    let metric_names = dataset.metric_names();
    let mut metrics: Vec<Vec<f64>> = vec![Vec::with_capacity(metric_names.len()); n];
    for name in &metric_names {
        let ca = out.column(name.as_str())?.f64()?;
        for (i, row) in metrics.iter_mut().enumerate() {
            row.push(ca.get(i).unwrap_or(f64::NAN));
        }
    }

    Ok(keys
        .into_iter()
        .zip(metrics)
        .map(|(keys, metrics)| CacheRow {
            date,
            keys,
            metrics,
        })
        .collect())
}

fn null_key(name: &str, row: usize) -> TransformError {
    TransformError::Aggregation(format!("null group key '{name}' in output row {row}"))
}
