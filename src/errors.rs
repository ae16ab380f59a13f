//! Errors
//!
//! Custom error types used throughout the `credence` crate.
use thiserror::Error;

/// Errors that can occur while estimating effects or evaluating gates.
#[derive(Debug, Error)]
pub enum CredenceError {
    /// A required column role is absent. Fatal for the whole batch since no
    /// estimator can run without outcome and treatment.
    #[error("Required role {0} maps to column {1}, which is not present in the dataset.")]
    MissingRole(String, String),
    /// An otherwise-valid request cannot run because an optional role is
    /// missing. Recoverable: the estimator is skipped and reported.
    #[error("Estimator {0} is not eligible: {1}")]
    IneligibleEstimator(String, String),
    /// Near-zero variance in a denominator, or a collinear design.
    #[error("Degenerate numeric input in {0}: {1}")]
    NumericDegenerate(String, String),
    /// An iterative solver exceeded its iteration budget.
    #[error("Optimizer for {0} exhausted its budget of {1} iterations.")]
    OptimizerTimeout(String, usize),
    /// A NaN value was found where the core requires a clean column.
    #[error("Column {0} contains a missing value at row {1}; outcome and treatment must be complete.")]
    MissingValue(String, usize),
    /// First value is the name of the parameter, second is expected, third is what was passed.
    #[error("Invalid parameter value passed for {0}, expected {1} but {2} provided.")]
    InvalidParameter(String, String, String),
    /// Mismatched lengths between columns, vectors, or matrices.
    #[error("Dimension mismatch in {0}: expected {1}, got {2}.")]
    DimensionMismatch(String, usize, usize),
}
