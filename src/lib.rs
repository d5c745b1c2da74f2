//! bcrisk rebuilds the firm-year panels behind the business combination law and firm risk
//! regressions. It cleans Compustat annual and quarterly fundamentals and CRSP daily
//! returns, links them through the CRSP/Compustat merged table, and estimates
//! fixed-effects regressions with cluster-robust standard errors.

pub mod compustat;
pub mod config;
pub mod crsp;
pub mod dataset;
pub mod features;
pub mod laws;
pub mod link;
pub mod logging;
pub mod merge;
pub mod pipeline;
pub mod regression;

pub use compustat::{CleaningError, cash_flow_volatility, clean_annual};
pub use config::{ConfigError, EstimatorConfig, PipelineConfig};
pub use crsp::annual_stock_volatility;
pub use dataset::{DatasetError, PanelData};
pub use features::{with_factorized, with_group_lag, with_winsorized};
pub use link::load_ccm_link;
pub use merge::{RegressionDatasets, build_datasets};
pub use pipeline::{ReplicationResult, Sample, estimate, prepare, run};
pub use regression::{
    AbsorbingLeastSquares, Coefficient, PanelEstimator, PanelFit, RegressionError, RegressionSpec,
};

pub type Result<T> = anyhow::Result<T>;
