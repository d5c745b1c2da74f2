//! Linking of the cleaned panels into the regression-ready samples.

use polars::lazy::dsl::col;
use polars::prelude::*;

use crate::compustat::CleaningResult;
use crate::dataset::{drop_missing_in, f64_values};
use crate::logging::log_event;

/// The three estimation samples.
#[derive(Debug, Clone)]
pub struct RegressionDatasets {
    /// Firm-years with CRSP stock volatility and the derived operating asset volatility.
    pub stock_and_op_asset_vol: DataFrame,
    /// Firm-years with quarterly cash flow volatility.
    pub cash_flow_vol: DataFrame,
    /// The cleaned annual panel as is.
    pub log_cash: DataFrame,
}

/// Equity over enterprise value net of cash: `E / (V - C)` with `E = csho * prcc_f` and
/// `V = lt + E`. Returns `None` when the ratio is undefined.
pub fn equity_to_net_value(csho: f64, prcc_f: f64, lt: f64, ch: f64) -> Option<f64> {
    let equity = csho * prcc_f;
    let ratio = equity / (lt + equity - ch);
    ratio.is_finite().then_some(ratio)
}

fn left_join(left: LazyFrame, right: LazyFrame, left_on: &[&str], right_on: &[&str]) -> LazyFrame {
    let left_keys: Vec<Expr> = left_on.iter().map(|name| col(*name)).collect();
    let right_keys: Vec<Expr> = right_on.iter().map(|name| col(*name)).collect();
    left.join(right, left_keys, right_keys, JoinArgs::new(JoinType::Left))
}

fn with_operating_asset_volatility(frame: &DataFrame) -> CleaningResult<DataFrame> {
    let csho = f64_values(frame, "csho")?;
    let prcc_f = f64_values(frame, "prcc_f")?;
    let lt = f64_values(frame, "lt")?;
    let ch = f64_values(frame, "ch")?;
    let stock_vol = f64_values(frame, "stock_vol")?;

    let mut e_by_v_minus_c = Vec::with_capacity(frame.height());
    let mut op_asset_vol = Vec::with_capacity(frame.height());
    for idx in 0..frame.height() {
        let ratio = match (csho[idx], prcc_f[idx], lt[idx], ch[idx]) {
            (Some(csho), Some(prcc_f), Some(lt), Some(ch)) => equity_to_net_value(csho, prcc_f, lt, ch),
            _ => None,
        };
        e_by_v_minus_c.push(ratio);
        op_asset_vol.push(
            ratio
                .zip(stock_vol[idx])
                .map(|(ratio, vol)| ratio * vol)
                .filter(|vol| vol.is_finite()),
        );
    }

    let mut enriched = frame.clone();
    enriched.with_column(Column::new("e_by_v_minus_c".into(), e_by_v_minus_c))?;
    enriched.with_column(Column::new("op_asset_vol".into(), op_asset_vol))?;
    Ok(enriched)
}

/// Join the annual panel to its CCM link, then to each volatility source.
///
/// `annual` comes from [`crate::compustat::clean_annual`], `cash_flow_vols` from
/// [`crate::compustat::cash_flow_volatility`], `stock_vols` from
/// [`crate::crsp::annual_stock_volatility`] and `link` from [`crate::link::load_ccm_link`].
pub fn build_datasets(
    annual: &DataFrame,
    cash_flow_vols: &DataFrame,
    stock_vols: &DataFrame,
    link: &DataFrame,
) -> CleaningResult<RegressionDatasets> {
    let base = left_join(
        annual.clone().lazy(),
        link.clone().lazy(),
        &["gvkey", "fyear"],
        &["gvkey", "fyear"],
    );

    let cash_flow_vol = left_join(
        base.clone(),
        cash_flow_vols.clone().lazy(),
        &["gvkey", "fyear"],
        &["gvkey", "fyear"],
    )
    .filter(col("cash_flow_vol").is_not_null())
    .collect()?;

    log_event(
        file!(),
        "Merge",
        "build_datasets",
        "merge.cash_flow_vol",
        line!(),
        "Matched firm-years to quarterly cash flow volatility",
        Some(cash_flow_vol.height()),
        None,
    );

    let with_stock_vol = left_join(
        base,
        stock_vols.clone().lazy(),
        &["lpermco", "fyear"],
        &["permco", "fyear"],
    )
    .filter(col("stock_vol").is_not_null())
    .collect()?;

    log_event(
        file!(),
        "Merge",
        "build_datasets",
        "merge.stock_vol",
        line!(),
        "Matched firm-years to CRSP stock volatility",
        Some(with_stock_vol.height()),
        None,
    );

    let stock_and_op_asset_vol =
        drop_missing_in(with_operating_asset_volatility(&with_stock_vol)?, "op_asset_vol")?;

    log_event(
        file!(),
        "Merge",
        "build_datasets",
        "merge.op_asset_vol",
        line!(),
        "Derived operating asset volatility",
        Some(stock_and_op_asset_vol.height()),
        None,
    );

    Ok(RegressionDatasets {
        stock_and_op_asset_vol,
        cash_flow_vol,
        log_cash: annual.clone(),
    })
}
