use anyhow::{Context, anyhow};
use polars::prelude::DataFrame;
use serde::Serialize;

use crate::Result;
use crate::compustat::{cash_flow_volatility, clean_annual};
use crate::config::PipelineConfig;
use crate::crsp::annual_stock_volatility;
use crate::link::load_ccm_link;
use crate::logging::log_event;
use crate::merge::{RegressionDatasets, build_datasets};
use crate::regression::{AbsorbingLeastSquares, PanelEstimator, PanelFit, RegressionSpec};

/// Which of the merged samples a regression runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Sample {
    StockAndOpAssetVol,
    CashFlowVol,
    LogCash,
}

impl Sample {
    pub fn for_target(target: &str) -> Option<Self> {
        match target {
            "stock_vol" | "op_asset_vol" => Some(Self::StockAndOpAssetVol),
            "cash_flow_vol" => Some(Self::CashFlowVol),
            "log_ch" => Some(Self::LogCash),
            _ => None,
        }
    }

    pub fn frame<'a>(&self, datasets: &'a RegressionDatasets) -> &'a DataFrame {
        match self {
            Self::StockAndOpAssetVol => &datasets.stock_and_op_asset_vol,
            Self::CashFlowVol => &datasets.cash_flow_vol,
            Self::LogCash => &datasets.log_cash,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationResult {
    pub spec: RegressionSpec,
    pub sample: Sample,
    pub sample_rows: usize,
    pub fit: PanelFit,
}

/// Load and clean the four extracts and merge them into the estimation samples.
pub fn prepare(config: &PipelineConfig) -> Result<RegressionDatasets> {
    config.validate()?;

    let annual = clean_annual(config.compustat_annual_path(), config)
        .with_context(|| format!("cleaning {}", config.compustat_annual_path().display()))?;
    let cash_flow_vols = cash_flow_volatility(config.compustat_quarterly_path(), config)
        .with_context(|| format!("cleaning {}", config.compustat_quarterly_path().display()))?;
    let stock_vols = annual_stock_volatility(config.crsp_daily_path(), config)
        .with_context(|| format!("cleaning {}", config.crsp_daily_path().display()))?;
    let link = load_ccm_link(config.ccm_annual_path())
        .with_context(|| format!("loading {}", config.ccm_annual_path().display()))?;

    Ok(build_datasets(&annual, &cash_flow_vols, &stock_vols, &link)?)
}

/// Fit each spec on the sample its target lives in, in order.
pub fn estimate<E: PanelEstimator>(
    datasets: &RegressionDatasets,
    estimator: &E,
    specs: &[RegressionSpec],
) -> Result<Vec<ReplicationResult>> {
    specs
        .iter()
        .map(|spec| {
            let sample = Sample::for_target(&spec.target)
                .ok_or_else(|| anyhow!("no sample carries target `{}`", spec.target))?;
            let frame = sample.frame(datasets);
            let fit = estimator
                .fit(frame, spec)
                .with_context(|| format!("fitting {}", spec.name))?;

            log_event(
                file!(),
                "Pipeline",
                "estimate",
                "pipeline.estimate",
                line!(),
                &format!("Estimated {} on the {:?} sample", spec.name, sample),
                Some(fit.observations),
                None,
            );

            Ok(ReplicationResult {
                spec: spec.clone(),
                sample,
                sample_rows: frame.height(),
                fit,
            })
        })
        .collect()
}

/// Run the full replication: prepare the samples and fit the four regressions.
pub fn run(config: &PipelineConfig) -> Result<Vec<ReplicationResult>> {
    let datasets = prepare(config)?;
    let estimator = AbsorbingLeastSquares::new(config.estimator);
    estimate(&datasets, &estimator, &RegressionSpec::replication_suite())
}
