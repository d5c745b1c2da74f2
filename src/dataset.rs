use std::path::Path;

use polars::lazy::dsl::col;
use polars::prelude::*;
use thiserror::Error;

use crate::logging::log_event;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to load panel data from {path}: {source}")]
    Load { path: String, source: PolarsError },
    #[error("failed to transform panel data: {source}")]
    Transform { source: PolarsError },
    #[error("panel data is missing column `{0}`")]
    MissingColumn(String),
}

impl From<PolarsError> for DatasetError {
    fn from(source: PolarsError) -> Self {
        Self::Transform { source }
    }
}

pub type DatasetResult<T> = Result<T, DatasetError>;

/// A lazily scanned panel extract with lower-cased column names.
#[derive(Clone)]
pub struct PanelData {
    frame: LazyFrame,
    columns: Vec<String>,
}

impl PanelData {
    pub fn from_csv<P: AsRef<Path>>(path: P) -> DatasetResult<Self> {
        let path_ref = path.as_ref();
        let load_error = |source: PolarsError| {
            log_event(
                file!(),
                "PanelData",
                "from_csv",
                "dataset.load",
                line!(),
                &format!("Failed to load {}", path_ref.display()),
                None,
                Some(&source.to_string()),
            );
            DatasetError::Load {
                path: path_ref.display().to_string(),
                source,
            }
        };

        // Every column is scanned as text; `select_as` decides the types.
        let mut scanned = LazyCsvReader::new(path_ref)
            .with_has_header(true)
            .with_try_parse_dates(false)
            .with_infer_schema_length(Some(0))
            .finish()
            .map_err(load_error)?;
        let schema = scanned.collect_schema().map_err(load_error)?;

        // WRDS extracts mix `GVKEY` and `gvkey` depending on the product.
        let mut columns = Vec::with_capacity(schema.len());
        let mut renamed = Vec::with_capacity(schema.len());
        for name in schema.iter_names() {
            let lower = name.as_str().to_lowercase();
            renamed.push(col(name.as_str()).alias(lower.as_str()));
            columns.push(lower);
        }

        log_event(
            file!(),
            "PanelData",
            "from_csv",
            "dataset.load",
            line!(),
            &format!(
                "Scanned {} with columns: {}",
                path_ref.display(),
                columns.join(", ")
            ),
            None,
            None,
        );

        Ok(Self {
            frame: scanned.select(renamed),
            columns,
        })
    }

    /// Keep only `columns`, casting each one. Casts are non-strict, so cells that do not
    /// parse as the requested type become missing. Integer columns go through `Float64`
    /// first so that exports writing `1990.0` still parse.
    pub fn select_as(&self, columns: &[(&str, DataType)]) -> DatasetResult<Self> {
        if let Some((missing, _)) = columns
            .iter()
            .find(|(name, _)| !self.columns.iter().any(|known| known == name))
        {
            log_event(
                file!(),
                "PanelData",
                "select_as",
                "dataset.transform",
                line!(),
                &format!("Column `{missing}` is not present"),
                None,
                Some("missing column"),
            );
            return Err(DatasetError::MissingColumn((*missing).to_string()));
        }

        let selection: Vec<Expr> = columns
            .iter()
            .map(|(name, dtype)| {
                if dtype.is_integer() {
                    col(*name).cast(DataType::Float64).cast(dtype.clone())
                } else {
                    col(*name).cast(dtype.clone())
                }
            })
            .collect();
        let selected = self.frame.clone().select(selection);

        log_event(
            file!(),
            "PanelData",
            "select_as",
            "dataset.transform",
            line!(),
            &format!(
                "Selected columns: {}",
                columns
                    .iter()
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            None,
            None,
        );

        Ok(Self {
            frame: selected,
            columns: columns.iter().map(|(name, _)| (*name).to_string()).collect(),
        })
    }

    pub fn filter(&self, predicate: Expr) -> Self {
        Self {
            frame: self.frame.clone().filter(predicate),
            columns: self.columns.clone(),
        }
    }

    /// Drop every row with a missing value in any column.
    pub fn drop_missing(&self) -> Self {
        let predicate = self
            .columns
            .iter()
            .map(|name| col(name.as_str()).is_not_null())
            .reduce(|acc, expr| acc.and(expr));

        match predicate {
            Some(predicate) => self.filter(predicate),
            None => self.clone(),
        }
    }

    pub fn collect(&self) -> DatasetResult<DataFrame> {
        self.frame
            .clone()
            .collect()
            .map_err(|source| DatasetError::Transform { source })
    }
}

pub fn f64_values(frame: &DataFrame, name: &str) -> DatasetResult<Vec<Option<f64>>> {
    let column = require(frame, name)?.cast(&DataType::Float64)?;
    Ok(column.as_materialized_series().f64()?.into_iter().collect())
}

pub fn i64_values(frame: &DataFrame, name: &str) -> DatasetResult<Vec<Option<i64>>> {
    let column = require(frame, name)?.cast(&DataType::Int64)?;
    Ok(column.as_materialized_series().i64()?.into_iter().collect())
}

pub fn str_values(frame: &DataFrame, name: &str) -> DatasetResult<Vec<Option<String>>> {
    let column = require(frame, name)?.cast(&DataType::String)?;
    Ok(column
        .as_materialized_series()
        .str()?
        .into_iter()
        .map(|value| value.map(str::to_owned))
        .collect())
}

fn require<'a>(frame: &'a DataFrame, name: &str) -> DatasetResult<&'a Column> {
    frame
        .column(name)
        .map_err(|_| DatasetError::MissingColumn(name.to_string()))
}

/// Keep the rows where `column` holds a value.
pub fn drop_missing_in(frame: DataFrame, column: &str) -> DatasetResult<DataFrame> {
    frame
        .lazy()
        .filter(col(column).is_not_null())
        .collect()
        .map_err(|source| DatasetError::Transform { source })
}
