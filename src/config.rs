use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::log_event;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Names of the four flat-file extracts, relative to the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputFiles {
    pub compustat_annual: String,
    pub compustat_quarterly: String,
    pub crsp_daily: String,
    pub ccm_annual: String,
}

impl Default for InputFiles {
    fn default() -> Self {
        Self {
            compustat_annual: "compustat_annual.csv".to_string(),
            compustat_quarterly: "compustat_quarterly.csv".to_string(),
            crsp_daily: "crsp_daily.csv".to_string(),
            ccm_annual: "ccm_annual.csv".to_string(),
        }
    }
}

/// Settings for the fixed-effects estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Largest absolute update tolerated once alternating projections have converged.
    pub tolerance: f64,
    pub max_iterations: usize,
    pub drop_singletons: bool,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 10_000,
            drop_singletons: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub files: InputFiles,
    /// Optional inclusive fiscal-year window applied to the annual Compustat panel. The
    /// extract's own download range bounds the sample when both are unset.
    pub first_fiscal_year: Option<i64>,
    pub last_fiscal_year: Option<i64>,
    /// Lower and upper tail fractions for the cash-flow ratio winsorization.
    pub winsorize_limits: (f64, f64),
    pub trading_days_per_year: f64,
    pub estimator: EstimatorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            files: InputFiles::default(),
            first_fiscal_year: None,
            last_fiscal_year: None,
            winsorize_limits: (0.01, 0.01),
            trading_days_per_year: 252.0,
            estimator: EstimatorConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        log_event(
            file!(),
            "PipelineConfig",
            "from_json_file",
            "config.load",
            line!(),
            &format!("Loaded configuration from {}", path.display()),
            None,
            None,
        );

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let (lower, upper) = self.winsorize_limits;
        for limit in [lower, upper] {
            if !(0.0..0.5).contains(&limit) {
                return Err(ConfigError::Invalid(format!(
                    "winsorize limit {limit} must lie in [0, 0.5)"
                )));
            }
        }

        if let (Some(first), Some(last)) = (self.first_fiscal_year, self.last_fiscal_year)
            && first > last
        {
            return Err(ConfigError::Invalid(format!(
                "fiscal year window {first}..={last} is empty"
            )));
        }

        if !(self.trading_days_per_year > 0.0) {
            return Err(ConfigError::Invalid(
                "trading_days_per_year must be positive".to_string(),
            ));
        }

        if !(self.estimator.tolerance > 0.0) || self.estimator.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "estimator tolerance and max_iterations must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn compustat_annual_path(&self) -> PathBuf {
        self.data_dir.join(&self.files.compustat_annual)
    }

    pub fn compustat_quarterly_path(&self) -> PathBuf {
        self.data_dir.join(&self.files.compustat_quarterly)
    }

    pub fn crsp_daily_path(&self) -> PathBuf {
        self.data_dir.join(&self.files.crsp_daily)
    }

    pub fn ccm_annual_path(&self) -> PathBuf {
        self.data_dir.join(&self.files.ccm_annual)
    }
}
