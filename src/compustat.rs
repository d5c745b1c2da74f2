//! Cleaning of the Compustat annual and quarterly fundamentals extracts.

use std::path::Path;

use chrono::{Datelike, NaiveDate};
use polars::lazy::dsl::{col, lit};
use polars::prelude::*;
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::dataset::{DatasetError, PanelData, f64_values, i64_values, str_values};
use crate::features::{group_lag, grouped_sample_std, with_factorized, with_winsorized};
use crate::laws::{bc_law_in_force, is_regulated_utility, is_us_state};
use crate::logging::log_event;

#[derive(Debug, Error)]
pub enum CleaningError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("polars error: {0}")]
    Polars(#[from] PolarsError),
    #[error("column `{column}` holds an unrecognised date `{value}`")]
    InvalidDate { column: String, value: String },
}

pub type CleaningResult<T> = Result<T, CleaningError>;

/// Parse the date layouts WRDS exports: ISO, compact `YYYYMMDD`, and US `MM/DD/YYYY`.
pub fn parse_wrds_date(column: &str, raw: &str) -> CleaningResult<NaiveDate> {
    let trimmed = raw.trim();
    ["%Y-%m-%d", "%Y%m%d", "%m/%d/%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .ok_or_else(|| CleaningError::InvalidDate {
            column: column.to_string(),
            value: raw.to_string(),
        })
}

/// Parse a date column. Cells in no recognised layout are logged and treated as missing.
pub(crate) fn dates(frame: &DataFrame, column: &str) -> CleaningResult<Vec<Option<NaiveDate>>> {
    let mut unparsed = 0_usize;
    let mut first_unparsed = None;
    let parsed: Vec<Option<NaiveDate>> = str_values(frame, column)?
        .into_iter()
        .map(|raw| {
            let raw = raw?;
            match parse_wrds_date(column, &raw) {
                Ok(date) => Some(date),
                Err(_) => {
                    unparsed += 1;
                    if first_unparsed.is_none() {
                        first_unparsed = Some(raw);
                    }
                    None
                }
            }
        })
        .collect();

    if let Some(example) = first_unparsed {
        log_event(
            file!(),
            "Compustat",
            "dates",
            "dates.parse",
            line!(),
            &format!("{unparsed} value(s) of `{column}` are not dates, e.g. `{example}`; treated as missing"),
            Some(unparsed),
            Some("invalid date"),
        );
    }

    Ok(parsed)
}

/// Non-utility firm-years located and incorporated in a US state.
fn us_non_utility_mask(frame: &DataFrame) -> CleaningResult<BooleanChunked> {
    let sic = f64_values(frame, "sic")?;
    let state = str_values(frame, "state")?;
    let incorp = str_values(frame, "incorp")?;

    Ok((0..frame.height())
        .map(|idx| {
            sic[idx].is_some_and(|code| !is_regulated_utility(code))
                && state[idx].as_deref().is_some_and(is_us_state)
                && incorp[idx].as_deref().is_some_and(is_us_state)
        })
        .collect())
}

/// Clean the annual fundamentals into the firm-year panel used by every regression.
///
/// The result carries the raw accounting fields plus `log_ch`, the fixed-effect ids
/// `gvkeyn`, `staten`, `incorpn`, `styear`, `sicyear`, and the `bc` law dummy.
pub fn clean_annual<P: AsRef<Path>>(path: P, config: &PipelineConfig) -> CleaningResult<DataFrame> {
    let mut panel = PanelData::from_csv(path)?.select_as(&[
        ("gvkey", DataType::String),
        ("datadate", DataType::String),
        ("fyear", DataType::Int64),
        ("at", DataType::Float64),
        ("ch", DataType::Float64),
        ("csho", DataType::Float64),
        ("lt", DataType::Float64),
        ("sale", DataType::Float64),
        ("prcc_f", DataType::Float64),
        ("incorp", DataType::String),
        ("sic", DataType::Float64),
        ("state", DataType::String),
    ])?;

    if let Some(first) = config.first_fiscal_year {
        panel = panel.filter(col("fyear").gt_eq(lit(first)));
    }
    if let Some(last) = config.last_fiscal_year {
        panel = panel.filter(col("fyear").lt_eq(lit(last)));
    }

    let panel = panel
        .filter(
            col("at")
                .is_not_null()
                .and(col("sale").is_not_null())
                .and(col("at").gt_eq(lit(0.0)))
                .and(col("sale").gt_eq(lit(0.0))),
        )
        .drop_missing()
        // Cash must be strictly positive for its log to exist.
        .filter(col("ch").gt(lit(0.0)));

    let frame = panel.collect()?;
    let frame = frame.filter(&us_non_utility_mask(&frame)?)?;

    log_event(
        file!(),
        "Compustat",
        "clean_annual",
        "compustat.annual.filter",
        line!(),
        "Kept US non-utility firm-years with positive assets, sales and cash",
        Some(frame.height()),
        None,
    );

    let frame = with_factorized(&frame, "gvkey", "gvkeyn")?;
    let frame = with_factorized(&frame, "state", "staten")?;
    let mut frame = with_factorized(&frame, "incorp", "incorpn")?;

    let fyear = i64_values(&frame, "fyear")?;
    let staten = i64_values(&frame, "staten")?;
    let sic = f64_values(&frame, "sic")?;
    let incorp = str_values(&frame, "incorp")?;
    let ch = f64_values(&frame, "ch")?;

    let styear: Vec<Option<i64>> = staten
        .iter()
        .zip(&fyear)
        .map(|(state, year)| Some(10_000 * (*state)? + (*year)?))
        .collect();
    let sicyear: Vec<Option<i64>> = sic
        .iter()
        .zip(&fyear)
        .map(|(sic, year)| Some(10_000 * sic.map(|code| code.round() as i64)? + (*year)?))
        .collect();
    let bc: Vec<Option<i64>> = incorp
        .iter()
        .zip(&fyear)
        .map(|(state, year)| Some(bc_law_in_force(state.as_deref()?, (*year)?)))
        .collect();
    let log_ch: Vec<Option<f64>> = ch.iter().map(|cash| cash.map(f64::ln)).collect();

    frame.with_column(Column::new("styear".into(), styear))?;
    frame.with_column(Column::new("sicyear".into(), sicyear))?;
    frame.with_column(Column::new("bc".into(), bc))?;
    frame.with_column(Column::new("log_ch".into(), log_ch))?;

    log_event(
        file!(),
        "Compustat",
        "clean_annual",
        "compustat.annual.derive",
        line!(),
        "Derived fixed-effect ids, business combination dummy and log cash",
        Some(frame.height()),
        None,
    );

    Ok(frame)
}

/// Change of `column` from the firm's previous quarter.
fn quarterly_change(column: &str) -> Expr {
    col(column) - group_lag("gvkey", column)
}

/// Annual volatility of the quarterly cash-flow-to-assets ratio per firm.
///
/// Quarterly operating accruals follow the balance-sheet approach,
/// `Δact − Δche − Δlct + Δdlc − dp`, with changes taken within firm. The ratio is
/// `(oiadpq − accruals) / atq_lag`, where the asset lag is taken over the quarters that
/// have accruals. Ratios of `0 / 0` are dropped; infinite ratios stay in the sample and
/// are winsorized like any other tail value.
///
/// Returns `gvkey`, `fyear`, `cash_flow_vol`. Firm-years with a single usable quarter are
/// dropped since their sample standard deviation is undefined.
pub fn cash_flow_volatility<P: AsRef<Path>>(path: P, config: &PipelineConfig) -> CleaningResult<DataFrame> {
    let mut frame = PanelData::from_csv(path)?
        .select_as(&[
            ("gvkey", DataType::String),
            ("datadate", DataType::String),
            ("fyearq", DataType::Int64),
            ("oiadpq", DataType::Float64),
            ("atq", DataType::Float64),
            ("actq", DataType::Float64),
            ("cheq", DataType::Float64),
            ("dlcq", DataType::Float64),
            ("dpq", DataType::Float64),
            ("lctq", DataType::Float64),
        ])?
        .collect()?;

    let days: Vec<Option<i32>> = dates(&frame, "datadate")?
        .into_iter()
        .map(|date| date.map(|date| date.num_days_from_ce()))
        .collect();
    frame.with_column(Column::new("datadate_days".into(), days))?;

    let quarters = frame
        .lazy()
        .sort(
            ["gvkey", "datadate_days"],
            SortMultipleOptions::default()
                .with_nulls_last(true)
                .with_maintain_order(true),
        )
        .with_column(
            (quarterly_change("actq") - quarterly_change("cheq") - quarterly_change("lctq")
                + quarterly_change("dlcq")
                - col("dpq"))
            .alias("accruals"),
        )
        .filter(col("accruals").is_not_null())
        .collect()?;

    log_event(
        file!(),
        "Compustat",
        "cash_flow_volatility",
        "compustat.quarterly.accruals",
        line!(),
        "Computed quarterly accruals",
        Some(quarters.height()),
        None,
    );

    let ratios = quarters
        .lazy()
        .with_column(
            ((col("oiadpq") - col("accruals")) / group_lag("gvkey", "atq")).alias("cash_flow_ratio"),
        )
        .filter(
            col("cash_flow_ratio")
                .is_not_null()
                .and(col("cash_flow_ratio").is_not_nan()),
        )
        .select([col("gvkey"), col("fyearq").alias("fyear"), col("cash_flow_ratio")])
        .collect()?;

    let (lower, upper) = config.winsorize_limits;
    let ratios = with_winsorized(&ratios, "cash_flow_ratio", lower, upper)?;

    log_event(
        file!(),
        "Compustat",
        "cash_flow_volatility",
        "compustat.quarterly.ratio",
        line!(),
        &format!("Winsorized cash flow to lagged assets at ({lower}, {upper})"),
        Some(ratios.height()),
        None,
    );

    let result = grouped_sample_std(&ratios, &["gvkey", "fyear"], "cash_flow_ratio", "cash_flow_vol")?;

    log_event(
        file!(),
        "Compustat",
        "cash_flow_volatility",
        "compustat.quarterly.volatility",
        line!(),
        "Computed firm-year cash flow volatility",
        Some(result.height()),
        None,
    );

    Ok(result)
}
