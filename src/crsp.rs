//! Annual stock return volatility from the CRSP daily stock file.

use std::path::Path;

use chrono::{Datelike, NaiveDate};
use polars::lazy::dsl::col;
use polars::prelude::*;

use crate::compustat::{CleaningResult, dates};
use crate::config::PipelineConfig;
use crate::dataset::{PanelData, f64_values, i64_values};
use crate::logging::log_event;

/// Fiscal year a trading day belongs to: January through June roll back into the prior
/// year so that returns line up with Compustat `fyear`.
pub fn fiscal_year(date: NaiveDate) -> i64 {
    let year = i64::from(date.year());
    if date.month() <= 6 { year - 1 } else { year }
}

/// `(trading_days_per_year / trading_days) * sqrt(sum of squared returns)`, or `None` when
/// no return was observed.
pub fn annualized_volatility(sum_squared: f64, trading_days: usize, trading_days_per_year: f64) -> Option<f64> {
    if trading_days == 0 {
        return None;
    }
    Some((trading_days_per_year / trading_days as f64) * sum_squared.sqrt())
}

/// Returns `permco`, `fyear`, `stock_vol` for each company fiscal year. Non-numeric return
/// codes count as missing and do not add trading days.
pub fn annual_stock_volatility<P: AsRef<Path>>(path: P, config: &PipelineConfig) -> CleaningResult<DataFrame> {
    let frame = PanelData::from_csv(path)?
        .select_as(&[
            ("date", DataType::String),
            ("permco", DataType::Int64),
            ("ret", DataType::Float64),
        ])?
        .collect()?;

    log_event(
        file!(),
        "Crsp",
        "annual_stock_volatility",
        "crsp.daily.load",
        line!(),
        "Loaded daily returns",
        Some(frame.height()),
        None,
    );

    let fyear: Vec<Option<i64>> = dates(&frame, "date")?
        .into_iter()
        .map(|date| date.map(fiscal_year))
        .collect();
    let mut frame = frame;
    frame.with_column(Column::new("fyear".into(), fyear))?;

    let mut moments = frame
        .lazy()
        .filter(col("permco").is_not_null().and(col("fyear").is_not_null()))
        .group_by([col("permco"), col("fyear")])
        .agg([
            (col("ret") * col("ret")).sum().alias("sum_squared"),
            col("ret").count().alias("trading_days"),
        ])
        .sort(["permco", "fyear"], SortMultipleOptions::default())
        .collect()?;

    let sum_squared = f64_values(&moments, "sum_squared")?;
    let trading_days = i64_values(&moments, "trading_days")?;
    let stock_vol: Vec<Option<f64>> = sum_squared
        .iter()
        .zip(&trading_days)
        .map(|(sum_squared, days)| {
            let days = usize::try_from((*days)?).ok()?;
            annualized_volatility((*sum_squared)?, days, config.trading_days_per_year)
        })
        .collect();

    moments.with_column(Column::new("stock_vol".into(), stock_vol))?;

    let result = moments
        .lazy()
        .filter(col("stock_vol").is_not_null())
        .select([col("permco"), col("fyear"), col("stock_vol")])
        .collect()?;

    log_event(
        file!(),
        "Crsp",
        "annual_stock_volatility",
        "crsp.annual.volatility",
        line!(),
        "Aggregated squared daily returns into company fiscal-year volatility",
        Some(result.height()),
        None,
    );

    Ok(result)
}
