//! Model adapters
//!
//! A uniform fit/predict capability wrapper over pluggable nuisance models.
//! Estimators are written against [`ModelAdapter`], never a concrete model
//! type, so any conforming implementation can be swapped in. The
//! [`NuisanceModel`] enum is the default factory used by the engine.
use crate::data::Matrix;
use crate::errors::CredenceError;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Capability interface for nuisance models.
///
/// `fit` consumes a column-major covariate matrix and a target vector;
/// `predict` returns conditional-mean predictions; `predict_proba` is an
/// optional capability for probabilistic classifiers.
pub trait ModelAdapter: Send {
    fn fit(&mut self, x: &Matrix<'_>, y: &[f64]) -> Result<(), CredenceError>;
    fn predict(&self, x: &Matrix<'_>) -> Vec<f64>;
    /// Probabilistic prediction capability; `None` when unsupported.
    fn predict_proba(&self, _x: &Matrix<'_>) -> Option<Vec<f64>> {
        None
    }
}

/// Specification of a nuisance model, acting as a factory for fresh,
/// unfitted adapters (cross-fitting needs one per fold).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum NuisanceModel {
    /// Ridge-penalized linear regression.
    Ridge { lambda: f64 },
    /// Logistic regression fit by bounded IRLS.
    Logistic { max_iter: usize, tol: f64 },
}

impl NuisanceModel {
    pub fn build(&self) -> Box<dyn ModelAdapter> {
        match self {
            NuisanceModel::Ridge { lambda } => Box::new(RidgeRegression::new(*lambda)),
            NuisanceModel::Logistic { max_iter, tol } => {
                Box::new(LogisticRegression::new(*max_iter, *tol))
            }
        }
    }
}

/// Build a row-major design matrix with a leading intercept column.
fn design_with_intercept(x: &Matrix<'_>) -> DMatrix<f64> {
    let n = x.rows;
    let p = x.cols + 1;
    let mut data = Vec::with_capacity(n * p);
    for i in 0..n {
        data.push(1.0);
        for j in 0..x.cols {
            data.push(x.get(i, j));
        }
    }
    DMatrix::from_row_slice(n, p, &data)
}

/// Ridge-penalized linear regression.
///
/// Solves `(X'X + lambda * I) beta = X'y` with an unpenalized intercept.
pub struct RidgeRegression {
    lambda: f64,
    coef: Option<DVector<f64>>,
}

impl RidgeRegression {
    pub fn new(lambda: f64) -> Self {
        RidgeRegression { lambda, coef: None }
    }

    pub fn coefficients(&self) -> Option<&DVector<f64>> {
        self.coef.as_ref()
    }
}

impl ModelAdapter for RidgeRegression {
    fn fit(&mut self, x: &Matrix<'_>, y: &[f64]) -> Result<(), CredenceError> {
        if y.len() != x.rows {
            return Err(CredenceError::DimensionMismatch("ridge fit".to_string(), x.rows, y.len()));
        }
        let design = design_with_intercept(x);
        let p = design.ncols();
        let mut xtx = design.transpose() * &design;
        for j in 1..p {
            xtx[(j, j)] += self.lambda;
        }
        let xty = design.transpose() * DVector::from_column_slice(y);
        let xtx_inv = xtx.try_inverse().ok_or_else(|| {
            CredenceError::NumericDegenerate(
                "ridge fit".to_string(),
                "X'X + lambda*I is singular".to_string(),
            )
        })?;
        self.coef = Some(xtx_inv * xty);
        Ok(())
    }

    fn predict(&self, x: &Matrix<'_>) -> Vec<f64> {
        match &self.coef {
            Some(beta) => {
                let design = design_with_intercept(x);
                (design * beta).iter().copied().collect()
            }
            None => vec![f64::NAN; x.rows],
        }
    }
}

#[inline]
fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Logistic regression fit by iteratively reweighted least squares.
///
/// The Newton loop is bounded by `max_iter`; on exhaustion the last iterate
/// is kept and a warning is logged, matching the recover-not-hang policy of
/// every iterative solver in this crate.
pub struct LogisticRegression {
    max_iter: usize,
    tol: f64,
    coef: Option<DVector<f64>>,
    pub converged: bool,
}

impl LogisticRegression {
    pub fn new(max_iter: usize, tol: f64) -> Self {
        LogisticRegression { max_iter, tol, coef: None, converged: false }
    }
}

impl ModelAdapter for LogisticRegression {
    fn fit(&mut self, x: &Matrix<'_>, y: &[f64]) -> Result<(), CredenceError> {
        if y.len() != x.rows {
            return Err(CredenceError::DimensionMismatch(
                "logistic fit".to_string(),
                x.rows,
                y.len(),
            ));
        }
        let design = design_with_intercept(x);
        let n = design.nrows();
        let p = design.ncols();
        let mut beta = DVector::zeros(p);
        self.converged = false;

        for _ in 0..self.max_iter {
            let eta = &design * &beta;
            let probs: Vec<f64> = eta.iter().map(|&e| sigmoid(e)).collect();

            // X'W X with W = diag(p(1-p)), floored for separation stability.
            let mut xtwx: DMatrix<f64> = DMatrix::zeros(p, p);
            let mut score: DVector<f64> = DVector::zeros(p);
            for i in 0..n {
                let w = (probs[i] * (1.0 - probs[i])).max(1e-6);
                let r = y[i] - probs[i];
                for a in 0..p {
                    score[a] += design[(i, a)] * r;
                    for b in 0..p {
                        xtwx[(a, b)] += design[(i, a)] * w * design[(i, b)];
                    }
                }
            }
            for j in 0..p {
                xtwx[(j, j)] += 1e-8;
            }
            let step = xtwx
                .try_inverse()
                .ok_or_else(|| {
                    CredenceError::NumericDegenerate(
                        "logistic fit".to_string(),
                        "X'WX is singular".to_string(),
                    )
                })?
                * score;
            let max_step = step.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            beta += step;
            if max_step < self.tol {
                self.converged = true;
                break;
            }
        }
        if !self.converged {
            log::warn!(
                "Logistic IRLS reached its iteration budget of {} before converging; keeping the last iterate.",
                self.max_iter
            );
        }
        self.coef = Some(beta);
        Ok(())
    }

    fn predict(&self, x: &Matrix<'_>) -> Vec<f64> {
        self.predict_proba(x).unwrap_or_else(|| vec![f64::NAN; x.rows])
    }

    fn predict_proba(&self, x: &Matrix<'_>) -> Option<Vec<f64>> {
        let beta = self.coef.as_ref()?;
        let design = design_with_intercept(x);
        Some((design * beta).iter().map(|&e| sigmoid(e)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ridge_recovers_linear_coefficients() {
        // y = 1 + 2*x, noise-free; tiny lambda should recover the line.
        let x_data: Vec<f64> = (0..20).map(|i| i as f64 / 10.0).collect();
        let y: Vec<f64> = x_data.iter().map(|&v| 1.0 + 2.0 * v).collect();
        let x = Matrix::new(&x_data, 20, 1);

        let mut model = RidgeRegression::new(1e-8);
        model.fit(&x, &y).unwrap();
        let preds = model.predict(&x);
        for (p, t) in preds.iter().zip(y.iter()) {
            assert!((p - t).abs() < 1e-5, "pred {} truth {}", p, t);
        }
    }

    #[test]
    fn test_ridge_dimension_mismatch() {
        let x_data = vec![1.0, 2.0];
        let x = Matrix::new(&x_data, 2, 1);
        let mut model = RidgeRegression::new(0.1);
        assert!(matches!(
            model.fit(&x, &[1.0]),
            Err(CredenceError::DimensionMismatch(_, _, _))
        ));
    }

    #[test]
    fn test_logistic_separates_simple_pattern() {
        // Larger x strongly predicts class 1.
        let x_data: Vec<f64> = (0..40).map(|i| i as f64 / 10.0).collect();
        let y: Vec<f64> = x_data.iter().map(|&v| if v > 2.0 { 1.0 } else { 0.0 }).collect();
        let x = Matrix::new(&x_data, 40, 1);

        let mut model = LogisticRegression::new(100, 1e-8);
        model.fit(&x, &y).unwrap();
        let probs = model.predict_proba(&x).unwrap();
        assert!(probs[0] < 0.2, "low x should map to low probability, got {}", probs[0]);
        assert!(probs[39] > 0.8, "high x should map to high probability, got {}", probs[39]);
        assert!(probs.iter().all(|p| p.is_finite() && (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_nuisance_factory_builds_fresh_models() {
        let spec = NuisanceModel::Ridge { lambda: 0.01 };
        let x_data = vec![0.0, 1.0, 2.0, 3.0];
        let x = Matrix::new(&x_data, 4, 1);
        let mut model = spec.build();
        model.fit(&x, &[0.0, 1.0, 2.0, 3.0]).unwrap();
        assert!(model.predict(&x).iter().all(|v| v.is_finite()));
        // A newly built model has no state from the previous one.
        let fresh = spec.build();
        assert!(fresh.predict(&x).iter().all(|v| v.is_nan()));
    }
}
