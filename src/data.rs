//! Data containers
//!
//! Column-major matrix views, the immutable [`Dataset`] handed to the core by
//! the ingestion layer, and the [`RoleMapping`] that names which columns play
//! which causal role.
use crate::errors::CredenceError;
use serde::{Deserialize, Serialize};

/// Contiguous column-major matrix view.
///
/// Holds a dense block of values in a single borrowed slice, column by
/// column, which keeps column extraction (the dominant access pattern for
/// nuisance fitting) a cheap slice operation.
pub struct Matrix<'a> {
    /// The raw data stored in a single slice, column-major.
    pub data: &'a [f64],
    /// Number of rows in the matrix.
    pub rows: usize,
    /// Number of columns in the matrix.
    pub cols: usize,
}

impl<'a> Matrix<'a> {
    /// Create a new matrix over `data`, which must hold `rows * cols` values.
    pub fn new(data: &'a [f64], rows: usize, cols: usize) -> Self {
        assert_eq!(data.len(), rows * cols, "data length must equal rows * cols");
        Matrix { data, rows, cols }
    }

    /// Get a single value.
    ///
    /// * `i` - The ith row of the data to get.
    /// * `j` - the jth column of the data to get.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[j * self.rows + i]
    }

    /// Get an entire column of the matrix.
    pub fn get_col(&self, col: usize) -> &[f64] {
        &self.data[col * self.rows..(col + 1) * self.rows]
    }

    /// Get a row of the data as a vector.
    pub fn get_row(&self, row: usize) -> Vec<f64> {
        (0..self.cols).map(|j| self.get(row, j)).collect()
    }

    /// Copy the rows at `indices` into a new column-major buffer.
    pub fn take_rows(&self, indices: &[usize]) -> Vec<f64> {
        let mut out = Vec::with_capacity(indices.len() * self.cols);
        for col in 0..self.cols {
            let col_data = self.get_col(col);
            for &i in indices {
                out.push(col_data[i]);
            }
        }
        out
    }
}

/// A rectangular table of units by named columns, immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    names: Vec<String>,
    data: Vec<f64>,
    rows: usize,
}

impl Dataset {
    /// Build a dataset from named columns. All columns must share a length.
    pub fn from_columns(columns: Vec<(String, Vec<f64>)>) -> Result<Self, CredenceError> {
        let rows = columns.first().map(|(_, c)| c.len()).unwrap_or(0);
        let mut names = Vec::with_capacity(columns.len());
        let mut data = Vec::with_capacity(rows * columns.len());
        for (name, col) in columns {
            if col.len() != rows {
                return Err(CredenceError::DimensionMismatch(format!("column {}", name), rows, col.len()));
            }
            names.push(name);
            data.extend(col);
        }
        Ok(Dataset { names, data, rows })
    }

    /// Number of rows (units).
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Column names, in construction order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        let idx = self.names.iter().position(|n| n == name)?;
        Some(&self.data[idx * self.rows..(idx + 1) * self.rows])
    }
}

/// Named column roles for one estimation problem.
///
/// `outcome` and `treatment` are required; `covariates` may be empty;
/// `instruments` are only needed by the IV estimators; `cluster_id` enables
/// cluster-robust variance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleMapping {
    pub outcome: String,
    pub treatment: String,
    #[serde(default)]
    pub covariates: Vec<String>,
    #[serde(default)]
    pub instruments: Vec<String>,
    #[serde(default)]
    pub cluster_id: Option<String>,
}

impl RoleMapping {
    pub fn new(outcome: impl Into<String>, treatment: impl Into<String>, covariates: Vec<String>) -> Self {
        RoleMapping {
            outcome: outcome.into(),
            treatment: treatment.into(),
            covariates,
            instruments: Vec::new(),
            cluster_id: None,
        }
    }

    pub fn with_instruments(mut self, instruments: Vec<String>) -> Self {
        self.instruments = instruments;
        self
    }

    pub fn with_cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    /// Resolve the mapping against a dataset, failing fast on missing
    /// required roles or incomplete outcome/treatment columns.
    pub fn resolve<'a>(&self, data: &'a Dataset) -> Result<ResolvedRoles<'a>, CredenceError> {
        let outcome = data
            .column(&self.outcome)
            .ok_or_else(|| CredenceError::MissingRole("outcome".to_string(), self.outcome.clone()))?;
        let treatment = data
            .column(&self.treatment)
            .ok_or_else(|| CredenceError::MissingRole("treatment".to_string(), self.treatment.clone()))?;

        check_complete(&self.outcome, outcome)?;
        check_complete(&self.treatment, treatment)?;
        for (i, v) in treatment.iter().enumerate() {
            if *v != 0.0 && *v != 1.0 {
                return Err(CredenceError::InvalidParameter(
                    format!("treatment column {}", self.treatment),
                    "binary 0/1 values".to_string(),
                    format!("{} at row {}", v, i),
                ));
            }
        }

        let mut covariates = Vec::with_capacity(data.rows() * self.covariates.len());
        for name in &self.covariates {
            let col = data
                .column(name)
                .ok_or_else(|| CredenceError::MissingRole("covariate".to_string(), name.clone()))?;
            covariates.extend_from_slice(col);
        }

        // Instruments are optional; absence is recorded, not fatal.
        let mut instruments = Vec::new();
        let mut n_instruments = 0;
        for name in &self.instruments {
            match data.column(name) {
                Some(col) => {
                    instruments.extend_from_slice(col);
                    n_instruments += 1;
                }
                None => {
                    instruments.clear();
                    n_instruments = 0;
                    break;
                }
            }
        }

        let cluster_ids = match &self.cluster_id {
            Some(name) => {
                let col = data
                    .column(name)
                    .ok_or_else(|| CredenceError::MissingRole("cluster_id".to_string(), name.clone()))?;
                Some(col.iter().map(|v| *v as u64).collect())
            }
            None => None,
        };

        Ok(ResolvedRoles {
            outcome,
            treatment,
            covariates,
            n_covariates: self.covariates.len(),
            instruments,
            n_instruments,
            instruments_requested: !self.instruments.is_empty(),
            cluster_ids,
            rows: data.rows(),
        })
    }
}

fn check_complete(name: &str, col: &[f64]) -> Result<(), CredenceError> {
    for (i, v) in col.iter().enumerate() {
        if v.is_nan() {
            return Err(CredenceError::MissingValue(name.to_string(), i));
        }
    }
    Ok(())
}

/// Role columns resolved against one dataset.
#[derive(Debug)]
pub struct ResolvedRoles<'a> {
    pub outcome: &'a [f64],
    pub treatment: &'a [f64],
    covariates: Vec<f64>,
    pub n_covariates: usize,
    instruments: Vec<f64>,
    pub n_instruments: usize,
    /// Whether the mapping asked for instruments at all. Requested but
    /// unresolvable instruments make the IV estimators ineligible.
    pub instruments_requested: bool,
    pub cluster_ids: Option<Vec<u64>>,
    pub rows: usize,
}

impl<'a> ResolvedRoles<'a> {
    /// The covariate matrix (may have zero columns).
    pub fn covariate_matrix(&self) -> Matrix<'_> {
        Matrix::new(&self.covariates, self.rows, self.n_covariates)
    }

    /// The instrument matrix, if instruments resolved.
    pub fn instrument_matrix(&self) -> Option<Matrix<'_>> {
        if self.n_instruments == 0 {
            None
        } else {
            Some(Matrix::new(&self.instruments, self.rows, self.n_instruments))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_dataset() -> Dataset {
        Dataset::from_columns(vec![
            ("y".to_string(), vec![1.0, 2.0, 3.0, 4.0]),
            ("d".to_string(), vec![0.0, 1.0, 0.0, 1.0]),
            ("x1".to_string(), vec![0.1, 0.2, 0.3, 0.4]),
        ])
        .unwrap()
    }

    #[test]
    fn test_matrix_get_col() {
        let v = vec![1.0, 2.0, 3.0, 5.0, 6.0, 7.0];
        let m = Matrix::new(&v, 3, 2);
        assert_eq!(m.get_col(1), &[5.0, 6.0, 7.0]);
        assert_eq!(m.get(2, 0), 3.0);
        assert_eq!(m.get_row(1), vec![2.0, 6.0]);
    }

    #[test]
    fn test_matrix_take_rows() {
        let v = vec![1.0, 2.0, 3.0, 5.0, 6.0, 7.0];
        let m = Matrix::new(&v, 3, 2);
        let sub = m.take_rows(&[0, 2]);
        assert_eq!(sub, vec![1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_resolve_roles() {
        let data = toy_dataset();
        let roles = RoleMapping::new("y", "d", vec!["x1".to_string()]);
        let resolved = roles.resolve(&data).unwrap();
        assert_eq!(resolved.outcome, &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(resolved.covariate_matrix().cols, 1);
        assert!(resolved.instrument_matrix().is_none());
    }

    #[test]
    fn test_missing_role_is_fatal() {
        let data = toy_dataset();
        let roles = RoleMapping::new("y", "nope", vec![]);
        let err = roles.resolve(&data).unwrap_err();
        assert!(matches!(err, CredenceError::MissingRole(_, _)));
    }

    #[test]
    fn test_nan_outcome_fails_fast() {
        let data = Dataset::from_columns(vec![
            ("y".to_string(), vec![1.0, f64::NAN]),
            ("d".to_string(), vec![0.0, 1.0]),
        ])
        .unwrap();
        let roles = RoleMapping::new("y", "d", vec![]);
        assert!(matches!(roles.resolve(&data), Err(CredenceError::MissingValue(_, 1))));
    }

    #[test]
    fn test_nonbinary_treatment_rejected() {
        let data = Dataset::from_columns(vec![
            ("y".to_string(), vec![1.0, 2.0]),
            ("d".to_string(), vec![0.0, 0.5]),
        ])
        .unwrap();
        let roles = RoleMapping::new("y", "d", vec![]);
        assert!(matches!(roles.resolve(&data), Err(CredenceError::InvalidParameter(_, _, _))));
    }

    #[test]
    fn test_absent_instrument_not_fatal() {
        let data = toy_dataset();
        let roles =
            RoleMapping::new("y", "d", vec![]).with_instruments(vec!["z_missing".to_string()]);
        let resolved = roles.resolve(&data).unwrap();
        assert!(resolved.instruments_requested);
        assert!(resolved.instrument_matrix().is_none());
    }
}
