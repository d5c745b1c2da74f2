//! Least squares with absorbed high-dimensional fixed effects and cluster-robust errors.
//!
//! Fixed effects are swept out of the target and predictors by alternating projections
//! (iterated group demeaning across every absorbed dimension). OLS on the residualized data
//! recovers the slope coefficients. Standard errors are clustered one-way or multiway
//! (Cameron, Gelbach & Miller), with the small-sample factor
//! `G / (G - 1) * (N - 1) / (N - K)` where `K` counts the slopes plus the absorbed
//! degrees of freedom not nested within a cluster dimension.

use std::collections::HashMap;
use std::fmt;

use nalgebra::DMatrix;
use ndarray::{Array1, Array2, Axis};
use polars::prelude::DataFrame;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use thiserror::Error;
use tracing::warn;

use crate::config::EstimatorConfig;
use crate::dataset::{DatasetError, f64_values, str_values};
use crate::features::factorize;
use crate::logging::log_event;

#[derive(Debug, Error)]
pub enum RegressionError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("regression `{0}` needs at least one predictor")]
    NoPredictors(String),
    #[error("regression `{0}` has no usable observations")]
    EmptySample(String),
    #[error("regression `{name}` has {observations} observations for {parameters} parameters")]
    InsufficientDegreesOfFreedom {
        name: String,
        observations: usize,
        parameters: usize,
    },
    #[error("regression `{0}`: predictors are collinear with the absorbed fixed effects")]
    Singular(String),
    #[error("regression `{name}`: cluster variable `{column}` has {groups} group(s), at least two are required")]
    TooFewClusters {
        name: String,
        column: String,
        groups: usize,
    },
    #[error("invalid t distribution with {0} degrees of freedom")]
    Distribution(f64),
}

pub type RegressionResult<T> = Result<T, RegressionError>;

/// What to regress on what, which identifiers to absorb and how to cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegressionSpec {
    pub name: String,
    pub target: String,
    pub predictors: Vec<String>,
    pub absorb: Vec<String>,
    pub cluster: Vec<String>,
}

impl RegressionSpec {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            predictors: Vec::new(),
            absorb: Vec::new(),
            cluster: Vec::new(),
        }
    }

    pub fn predictors(mut self, predictors: &[&str]) -> Self {
        self.predictors = predictors.iter().map(|name| (*name).to_string()).collect();
        self
    }

    pub fn absorb(mut self, absorb: &[&str]) -> Self {
        self.absorb = absorb.iter().map(|name| (*name).to_string()).collect();
        self
    }

    pub fn cluster(mut self, cluster: &[&str]) -> Self {
        self.cluster = cluster.iter().map(|name| (*name).to_string()).collect();
        self
    }

    /// The four business combination law regressions: stock volatility, operating asset
    /// volatility, cash flow volatility and log cash on the law dummy, each absorbing firm,
    /// state-by-year and industry-by-year effects and clustering by state of incorporation.
    pub fn replication_suite() -> Vec<Self> {
        [
            ("column1", "stock_vol"),
            ("column3", "op_asset_vol"),
            ("column4", "cash_flow_vol"),
            ("column5", "log_ch"),
        ]
        .into_iter()
        .map(|(name, target)| {
            Self::new(name, target)
                .predictors(&["bc"])
                .absorb(&["gvkeyn", "styear", "sicyear"])
                .cluster(&["incorpn"])
        })
        .collect()
    }
}

/// The seam between the data pipeline and whatever estimator fits the panel models.
pub trait PanelEstimator {
    fn fit(&self, frame: &DataFrame, spec: &RegressionSpec) -> RegressionResult<PanelFit>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Coefficient {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub t_stat: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterSummary {
    pub column: String,
    pub groups: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PanelFit {
    pub name: String,
    pub target: String,
    pub coefficients: Vec<Coefficient>,
    pub observations: usize,
    pub singletons_dropped: usize,
    pub absorbed: Vec<String>,
    pub absorbed_dof: usize,
    pub residual_dof: usize,
    pub clusters: Vec<ClusterSummary>,
    pub r_squared_within: f64,
    pub rmse: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl PanelFit {
    pub fn coefficient(&self, name: &str) -> Option<&Coefficient> {
        self.coefficients.iter().find(|coef| coef.name == name)
    }
}

impl fmt::Display for PanelFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "-".repeat(86);
        writeln!(f, "{rule}")?;
        writeln!(f, "Model: {:<30} Dependent variable: {}", self.name, self.target)?;
        writeln!(
            f,
            "No. observations: {:<19} Singletons dropped: {}",
            self.observations, self.singletons_dropped
        )?;
        writeln!(
            f,
            "Absorbed: {:<27} Absorbed dof: {}",
            self.absorbed.join(", "),
            self.absorbed_dof
        )?;
        let clusters = self
            .clusters
            .iter()
            .map(|cluster| format!("{} ({})", cluster.column, cluster.groups))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            f,
            "Clusters: {:<27} Within R-squared: {:.4}",
            if clusters.is_empty() { "none".to_string() } else { clusters },
            self.r_squared_within
        )?;
        writeln!(
            f,
            "Residual dof: {:<23} RMSE: {:.6}{}",
            self.residual_dof,
            self.rmse,
            if self.converged { "" } else { "  (not converged)" }
        )?;
        writeln!(f, "{rule}")?;
        writeln!(
            f,
            "{:<14}{:>12}{:>12}{:>10}{:>10}{:>14}{:>14}",
            "", "Coef.", "Std.Err.", "t", "P>|t|", "[0.025", "0.975]"
        )?;
        writeln!(f, "{rule}")?;
        for coef in &self.coefficients {
            writeln!(
                f,
                "{:<14}{:>12.6}{:>12.6}{:>10.4}{:>10.4}{:>14.6}{:>14.6}",
                coef.name, coef.estimate, coef.std_error, coef.t_stat, coef.p_value, coef.ci_lower, coef.ci_upper
            )?;
        }
        write!(f, "{rule}")
    }
}

/// One categorical dimension with dense codes `0..levels`.
#[derive(Debug, Clone)]
struct Dimension {
    codes: Vec<usize>,
    levels: usize,
}

impl Dimension {
    fn from_codes(codes: impl IntoIterator<Item = usize>) -> Self {
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let codes: Vec<usize> = codes
            .into_iter()
            .map(|code| {
                let next = remap.len();
                *remap.entry(code).or_insert(next)
            })
            .collect();
        Self {
            levels: remap.len(),
            codes,
        }
    }

    fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.levels];
        for &code in &self.codes {
            counts[code] += 1;
        }
        counts
    }

    fn nested_in(&self, cluster: &Self) -> bool {
        let mut owner: Vec<Option<usize>> = vec![None; self.levels];
        for (&level, &group) in self.codes.iter().zip(&cluster.codes) {
            match owner[level] {
                Some(existing) if existing != group => return false,
                Some(_) => {}
                None => owner[level] = Some(group),
            }
        }
        true
    }
}

/// Iteratively remove observations that are alone in any fixed-effect level. Returns the
/// surviving row indices.
fn drop_singleton_rows(dimensions: &[Vec<usize>], mut rows: Vec<usize>) -> Vec<usize> {
    loop {
        let mut counts: Vec<HashMap<usize, usize>> = vec![HashMap::new(); dimensions.len()];
        for &row in &rows {
            for (dim, codes) in dimensions.iter().enumerate() {
                *counts[dim].entry(codes[row]).or_insert(0) += 1;
            }
        }

        let before = rows.len();
        rows.retain(|&row| {
            dimensions
                .iter()
                .enumerate()
                .all(|(dim, codes)| counts[dim].get(&codes[row]).copied().unwrap_or(0) > 1)
        });

        if rows.len() == before {
            return rows;
        }
    }
}

/// Sweep every fixed-effect dimension out of `values` by alternating projections.
/// Returns the number of sweeps and whether the largest update fell within `tolerance`.
fn demean(
    values: &mut [f64],
    dimensions: &[Dimension],
    counts: &[Vec<usize>],
    tolerance: f64,
    max_iterations: usize,
) -> (usize, bool) {
    let mut sums: Vec<Vec<f64>> = dimensions.iter().map(|dim| vec![0.0; dim.levels]).collect();

    for iteration in 1..=max_iterations {
        let mut largest_update: f64 = 0.0;
        for (dim_idx, dimension) in dimensions.iter().enumerate() {
            let level_sums = &mut sums[dim_idx];
            level_sums.iter_mut().for_each(|sum| *sum = 0.0);
            for (&code, value) in dimension.codes.iter().zip(values.iter()) {
                level_sums[code] += value;
            }
            for (sum, &count) in level_sums.iter_mut().zip(&counts[dim_idx]) {
                *sum /= count as f64;
                largest_update = largest_update.max(sum.abs());
            }
            for (&code, value) in dimension.codes.iter().zip(values.iter_mut()) {
                *value -= level_sums[code];
            }
        }

        if largest_update <= tolerance {
            return (iteration, true);
        }
    }

    (max_iterations, false)
}

/// Connected components of the bipartite graph linking levels of two dimensions.
fn connected_components(first: &Dimension, second: &Dimension) -> usize {
    fn find(parent: &mut [usize], mut node: usize) -> usize {
        while parent[node] != node {
            parent[node] = parent[parent[node]];
            node = parent[node];
        }
        node
    }

    let mut parent: Vec<usize> = (0..first.levels + second.levels).collect();
    for (&a, &b) in first.codes.iter().zip(&second.codes) {
        let root_a = find(&mut parent, a);
        let root_b = find(&mut parent, first.levels + b);
        if root_a != root_b {
            parent[root_a] = root_b;
        }
    }

    (0..parent.len())
        .filter(|&node| find(&mut parent, node) == node)
        .count()
}

/// Degrees of freedom consumed by the absorbed fixed effects. Dimensions nested within a
/// cluster dimension cost nothing; the first two remaining dimensions lose one level per
/// connected component and every further dimension loses one level.
fn absorbed_degrees_of_freedom(dimensions: &[Dimension], clusters: &[Dimension]) -> usize {
    let free: Vec<&Dimension> = dimensions
        .iter()
        .filter(|dim| !clusters.iter().any(|cluster| dim.nested_in(cluster)))
        .collect();
    let any_nested = free.len() < dimensions.len();

    let total: usize = free.iter().map(|dim| dim.levels).sum();
    let redundant = match free.as_slice() {
        [] => 0,
        [_] => usize::from(any_nested),
        [first, second, rest @ ..] => connected_components(first, second) + rest.len(),
    };
    total.saturating_sub(redundant)
}

/// Inverse of a symmetric cross-product matrix through its Cholesky factor. `None` when the
/// matrix is not positive definite.
fn invert(matrix: &Array2<f64>) -> Option<Array2<f64>> {
    let size = matrix.nrows();
    let dense = DMatrix::from_fn(size, size, |row, col| matrix[[row, col]]);
    let inverse = dense.cholesky()?.inverse();
    Some(Array2::from_shape_fn((size, size), |(row, col)| inverse[(row, col)]))
}

/// Sum of outer products of the per-cluster score vectors `Σ_g (X_g' e_g)(X_g' e_g)'`.
fn cluster_meat(design: &Array2<f64>, residuals: &Array1<f64>, cluster: &Dimension) -> Array2<f64> {
    let mut scores = Array2::<f64>::zeros((cluster.levels, design.ncols()));
    for ((row, &group), residual) in design.axis_iter(Axis(0)).zip(&cluster.codes).zip(residuals) {
        let mut score = scores.row_mut(group);
        score.scaled_add(*residual, &row);
    }
    scores.t().dot(&scores)
}

/// Intersection of several cluster dimensions, e.g. firm-by-year from firm and year.
fn intersect(dimensions: &[&Dimension]) -> Dimension {
    let observations = dimensions.first().map_or(0, |dim| dim.codes.len());
    let keys: Vec<Option<Vec<usize>>> = (0..observations)
        .map(|row| Some(dimensions.iter().map(|dim| dim.codes[row]).collect()))
        .collect();
    Dimension::from_codes(factorize(&keys).into_iter().flatten().map(|code| code as usize))
}

/// Fixed-effects least squares solved by alternating projections.
#[derive(Debug, Clone, Default)]
pub struct AbsorbingLeastSquares {
    config: EstimatorConfig,
}

impl AbsorbingLeastSquares {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }
}

impl PanelEstimator for AbsorbingLeastSquares {
    fn fit(&self, frame: &DataFrame, spec: &RegressionSpec) -> RegressionResult<PanelFit> {
        if spec.predictors.is_empty() {
            return Err(RegressionError::NoPredictors(spec.name.clone()));
        }

        let target = f64_values(frame, &spec.target)?;
        let predictors = spec
            .predictors
            .iter()
            .map(|name| f64_values(frame, name))
            .collect::<Result<Vec<_>, _>>()?;
        let absorbed = spec
            .absorb
            .iter()
            .map(|name| str_values(frame, name).map(|values| factorize(&values)))
            .collect::<Result<Vec<_>, _>>()?;
        let clustered = spec
            .cluster
            .iter()
            .map(|name| str_values(frame, name).map(|values| factorize(&values)))
            .collect::<Result<Vec<_>, _>>()?;

        let usable = |value: &Option<f64>| value.is_some_and(f64::is_finite);
        let complete: Vec<usize> = (0..frame.height())
            .filter(|&row| {
                usable(&target[row])
                    && predictors.iter().all(|column| usable(&column[row]))
                    && absorbed.iter().all(|codes| codes[row].is_some())
                    && clustered.iter().all(|codes| codes[row].is_some())
            })
            .collect();

        // Without absorbed effects the regression still needs an intercept; a single
        // all-encompassing level plays that role.
        let absorbed_codes: Vec<Vec<usize>> = if absorbed.is_empty() {
            vec![vec![0; frame.height()]]
        } else {
            absorbed
                .iter()
                .map(|codes| codes.iter().map(|code| code.map_or(0, |code| code as usize)).collect())
                .collect()
        };

        let rows = if self.config.drop_singletons {
            drop_singleton_rows(&absorbed_codes, complete.clone())
        } else {
            complete.clone()
        };
        let singletons_dropped = complete.len() - rows.len();
        let observations = rows.len();
        if observations == 0 {
            return Err(RegressionError::EmptySample(spec.name.clone()));
        }

        let dimensions: Vec<Dimension> = absorbed_codes
            .iter()
            .map(|codes| Dimension::from_codes(rows.iter().map(|&row| codes[row])))
            .collect();
        let clusters: Vec<Dimension> = clustered
            .iter()
            .map(|codes| {
                Dimension::from_codes(rows.iter().map(|&row| codes[row].map_or(0, |code| code as usize)))
            })
            .collect();

        for (column, cluster) in spec.cluster.iter().zip(&clusters) {
            if cluster.levels < 2 {
                return Err(RegressionError::TooFewClusters {
                    name: spec.name.clone(),
                    column: column.clone(),
                    groups: cluster.levels,
                });
            }
        }

        let absorbed_dof = absorbed_degrees_of_freedom(&dimensions, &clusters);
        let parameters = spec.predictors.len() + absorbed_dof;
        if observations <= parameters {
            return Err(RegressionError::InsufficientDegreesOfFreedom {
                name: spec.name.clone(),
                observations,
                parameters,
            });
        }
        let residual_dof = observations - parameters;

        let mut columns: Vec<Vec<f64>> = std::iter::once(&target)
            .chain(predictors.iter())
            .map(|column| rows.iter().map(|&row| column[row].unwrap_or(0.0)).collect())
            .collect();
        let raw_squares: Vec<f64> = columns
            .iter()
            .map(|column| column.iter().map(|value| value * value).sum())
            .collect();
        let counts: Vec<Vec<usize>> = dimensions.iter().map(Dimension::counts).collect();
        let sweeps: Vec<(usize, bool)> = columns
            .par_iter_mut()
            .map(|column| {
                demean(
                    column,
                    &dimensions,
                    &counts,
                    self.config.tolerance,
                    self.config.max_iterations,
                )
            })
            .collect();
        let iterations = sweeps.iter().map(|(count, _)| *count).max().unwrap_or(0);
        let converged = sweeps.iter().all(|(_, converged)| *converged);
        if !converged {
            warn!(
                regression = %spec.name,
                iterations,
                "alternating projections stopped before reaching the tolerance"
            );
        }

        // A predictor the fixed effects absorb entirely leaves nothing to estimate.
        let absorbed_entirely = columns.iter().zip(&raw_squares).skip(1).any(|(column, raw)| {
            let remaining: f64 = column.iter().map(|value| value * value).sum();
            remaining <= raw * 1e-20
        });
        if absorbed_entirely {
            return Err(RegressionError::Singular(spec.name.clone()));
        }

        let response = Array1::from(columns.remove(0));
        let design = Array2::from_shape_fn((observations, spec.predictors.len()), |(row, col)| {
            columns[col][row]
        });

        let bread = invert(&design.t().dot(&design))
            .ok_or_else(|| RegressionError::Singular(spec.name.clone()))?;
        let beta = bread.dot(&design.t().dot(&response));
        let residuals = &response - &design.dot(&beta);
        let ssr = residuals.dot(&residuals);
        let tss = response.dot(&response);

        let scale = (observations as f64 - 1.0) / residual_dof as f64;
        let (variance, t_dof) = if clusters.is_empty() {
            (&bread * (ssr / residual_dof as f64), residual_dof as f64)
        } else {
            let mut variance = Array2::<f64>::zeros(bread.raw_dim());
            for mask in 1_usize..(1 << clusters.len()) {
                let members: Vec<&Dimension> = clusters
                    .iter()
                    .enumerate()
                    .filter(|(idx, _)| mask & (1 << idx) != 0)
                    .map(|(_, cluster)| cluster)
                    .collect();
                let combined = intersect(&members);
                let groups = combined.levels as f64;
                let adjustment = groups / (groups - 1.0).max(1.0) * scale;
                let sandwich = bread.dot(&cluster_meat(&design, &residuals, &combined)).dot(&bread);
                let sign = if members.len() % 2 == 1 { 1.0 } else { -1.0 };
                variance.scaled_add(sign * adjustment, &sandwich);
            }
            let fewest = clusters.iter().map(|cluster| cluster.levels).min().unwrap_or(2);
            (variance, fewest as f64 - 1.0)
        };

        let distribution =
            StudentsT::new(0.0, 1.0, t_dof).map_err(|_| RegressionError::Distribution(t_dof))?;
        let critical = distribution.inverse_cdf(0.975);

        let coefficients = spec
            .predictors
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let estimate = beta[idx];
                let diagonal = variance[[idx, idx]];
                if diagonal < 0.0 {
                    warn!(regression = %spec.name, predictor = %name, "negative multiway cluster variance");
                }
                let std_error = if diagonal >= 0.0 { diagonal.sqrt() } else { f64::NAN };
                let t_stat = estimate / std_error;
                Coefficient {
                    name: name.clone(),
                    estimate,
                    std_error,
                    t_stat,
                    p_value: 2.0 * (1.0 - distribution.cdf(t_stat.abs())),
                    ci_lower: estimate - critical * std_error,
                    ci_upper: estimate + critical * std_error,
                }
            })
            .collect();

        let fit = PanelFit {
            name: spec.name.clone(),
            target: spec.target.clone(),
            coefficients,
            observations,
            singletons_dropped,
            absorbed: spec.absorb.clone(),
            absorbed_dof,
            residual_dof,
            clusters: spec
                .cluster
                .iter()
                .zip(&clusters)
                .map(|(column, cluster)| ClusterSummary {
                    column: column.clone(),
                    groups: cluster.levels,
                })
                .collect(),
            r_squared_within: if tss > 0.0 { 1.0 - ssr / tss } else { 0.0 },
            rmse: (ssr / residual_dof as f64).sqrt(),
            iterations,
            converged,
        };

        log_event(
            file!(),
            "AbsorbingLeastSquares",
            "fit",
            "regression.fit",
            line!(),
            &format!(
                "Fitted {} on {} absorbing {} ({} iterations)",
                spec.target,
                spec.predictors.join(", "),
                spec.absorb.join(", "),
                iterations
            ),
            Some(observations),
            None,
        );

        Ok(fit)
    }
}
