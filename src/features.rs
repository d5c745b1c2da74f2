use std::collections::HashMap;
use std::hash::Hash;

use polars::lazy::dsl::{col, lit, when};
use polars::prelude::*;

use crate::dataset::{DatasetResult, f64_values, str_values};
use crate::logging::log_event;

/// Dense integer codes in order of first appearance. Missing inputs stay missing.
pub fn factorize<T: Hash + Eq + Clone>(values: &[Option<T>]) -> Vec<Option<i64>> {
    let mut levels: HashMap<T, i64> = HashMap::new();
    values
        .iter()
        .map(|value| {
            value.as_ref().map(|value| {
                let next = levels.len() as i64;
                *levels.entry(value.clone()).or_insert(next)
            })
        })
        .collect()
}

/// Rank-based winsorization of the `lower` and `upper` tails, in place.
///
/// With `n` values the `floor(lower * n)` smallest are raised to the next order statistic
/// and the `floor(upper * n)` largest are lowered to the preceding one.
pub fn winsorize(values: &mut [f64], lower: f64, upper: f64) {
    let n = values.len();
    if n == 0 {
        return;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let low_count = (lower * n as f64) as usize;
    let high_start = n - (upper * n as f64) as usize;

    if low_count > 0 && low_count < n {
        let floor = values[order[low_count]];
        for &idx in &order[..low_count] {
            values[idx] = floor;
        }
    }

    if high_start < n && high_start > 0 {
        let ceiling = values[order[high_start - 1]];
        for &idx in &order[high_start..] {
            values[idx] = ceiling;
        }
    }
}

/// Append integer codes for the distinct values of `column`.
pub fn with_factorized(frame: &DataFrame, column: &str, output_column: &str) -> DatasetResult<DataFrame> {
    let values = str_values(frame, column)?;
    let codes = factorize(&values);
    let levels = codes.iter().flatten().max().map_or(0, |max| max + 1);

    let mut enriched = frame.clone();
    enriched.with_column(Column::new(output_column.into(), codes))?;

    log_event(
        file!(),
        "FeatureEngineering",
        "with_factorized",
        "features.factorize",
        line!(),
        &format!("Encoded {levels} levels of {column} -> {output_column}"),
        Some(enriched.height()),
        None,
    );

    Ok(enriched)
}

/// Append the one-period lag of `value_column` within `group_column`. Rows must already be
/// in time order within each group. Rows without a group key never receive a lag and never
/// serve as one.
pub fn with_group_lag(
    frame: &DataFrame,
    group_column: &str,
    value_column: &str,
    output_column: &str,
) -> DatasetResult<DataFrame> {
    let enriched = frame
        .clone()
        .lazy()
        .with_column(group_lag(group_column, value_column).alias(output_column))
        .collect()?;

    log_event(
        file!(),
        "FeatureEngineering",
        "with_group_lag",
        "features.lag",
        line!(),
        &format!("Lagged {value_column} within {group_column} -> {output_column}"),
        Some(enriched.height()),
        None,
    );

    Ok(enriched)
}

/// Lag expression behind [`with_group_lag`], for use inside a larger lazy query.
pub fn group_lag(group_column: &str, value_column: &str) -> Expr {
    when(col(group_column).is_not_null())
        .then(col(value_column).shift(lit(1)).over([col(group_column)]))
        .otherwise(lit(NULL))
}

/// Sample standard deviation (ddof = 1) of `value_column` per combination of `keys`,
/// sorted by the keys. Rows with a missing key are ignored. Groups with a single
/// observation, or whose values are not all finite, yield no row.
pub fn grouped_sample_std(
    frame: &DataFrame,
    keys: &[&str],
    value_column: &str,
    output_column: &str,
) -> DatasetResult<DataFrame> {
    let key_columns: Vec<Expr> = keys.iter().map(|key| col(*key)).collect();
    let complete_keys = key_columns
        .iter()
        .map(|key| key.clone().is_not_null())
        .reduce(|acc, expr| acc.and(expr))
        .unwrap_or(lit(true));

    let grouped = frame
        .clone()
        .lazy()
        .filter(complete_keys)
        .group_by(key_columns)
        .agg([col(value_column).std(1).alias(output_column)])
        // An infinite member turns the deviation into NaN.
        .filter(
            col(output_column)
                .is_not_null()
                .and(col(output_column).is_not_nan()),
        )
        .sort(keys.to_vec(), SortMultipleOptions::default())
        .collect()?;

    log_event(
        file!(),
        "FeatureEngineering",
        "grouped_sample_std",
        "features.std",
        line!(),
        &format!(
            "Sample std of {value_column} by {} -> {output_column}",
            keys.join(", ")
        ),
        Some(grouped.height()),
        None,
    );

    Ok(grouped)
}

/// Replace `column` with its winsorized values. Missing entries are left untouched and do
/// not count towards the tails.
pub fn with_winsorized(frame: &DataFrame, column: &str, lower: f64, upper: f64) -> DatasetResult<DataFrame> {
    let values = f64_values(frame, column)?;
    let present: Vec<usize> = values
        .iter()
        .enumerate()
        .filter_map(|(idx, value)| value.map(|_| idx))
        .collect();
    let mut observed: Vec<f64> = present.iter().filter_map(|&idx| values[idx]).collect();
    winsorize(&mut observed, lower, upper);

    let mut clipped = values;
    for (&idx, value) in present.iter().zip(observed) {
        clipped[idx] = Some(value);
    }

    let mut enriched = frame.clone();
    enriched.with_column(Column::new(column.into(), clipped))?;

    log_event(
        file!(),
        "FeatureEngineering",
        "with_winsorized",
        "features.winsorize",
        line!(),
        &format!("Winsorized {column} at ({lower}, {upper})"),
        Some(enriched.height()),
        None,
    );

    Ok(enriched)
}
