//! Estimate results
//!
//! Immutable value types produced once per estimator invocation and consumed
//! read-only by the inference and gate layers.
use crate::constants::{PROB_EPS, Z_95};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Estimation method that produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// Partially-linear DML.
    Plr,
    /// Interactive (AIPW-scored) DML.
    Irm,
    /// Two-stage least squares.
    TwoStageLeastSquares,
    /// Iterated GMM.
    Gmm,
}

/// An estimator the caller can request from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstimatorKind {
    DmlPlr,
    DmlIrm,
    TwoStageLeastSquares,
    Gmm,
}

impl EstimatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            EstimatorKind::DmlPlr => "dml_plr",
            EstimatorKind::DmlIrm => "dml_irm",
            EstimatorKind::TwoStageLeastSquares => "2sls",
            EstimatorKind::Gmm => "gmm",
        }
    }
}

/// Average treatment effect estimate with inference and diagnostics.
///
/// Created by an estimator, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimateResult {
    pub ate: f64,
    pub se: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub p_value: f64,
    pub method: Method,
    pub diagnostics: HashMap<String, f64>,
    pub converged: bool,
}

impl EstimateResult {
    /// Build a converged result from a point estimate and its standard
    /// error, using the normal approximation for the CI and p-value.
    pub fn from_ate_se(ate: f64, se: f64, method: Method) -> Self {
        let (ci_lower, ci_upper, p_value) = if se.is_finite() && se > 0.0 {
            (ate - Z_95 * se, ate + Z_95 * se, two_sided_p(ate / se))
        } else {
            (f64::NAN, f64::NAN, f64::NAN)
        };
        EstimateResult {
            ate,
            se,
            ci_lower,
            ci_upper,
            p_value,
            method,
            diagnostics: HashMap::new(),
            converged: true,
        }
    }

    /// Build a non-converged placeholder carrying only diagnostics.
    pub fn degenerate(method: Method) -> Self {
        EstimateResult {
            ate: f64::NAN,
            se: f64::NAN,
            ci_lower: f64::NAN,
            ci_upper: f64::NAN,
            p_value: f64::NAN,
            method,
            diagnostics: HashMap::new(),
            converged: false,
        }
    }

    pub fn with_diagnostic(mut self, name: &str, value: f64) -> Self {
        self.diagnostics.insert(name.to_string(), value);
        self
    }

    /// Width of the 95% confidence interval.
    pub fn ci_width(&self) -> f64 {
        self.ci_upper - self.ci_lower
    }
}

/// Per-estimator batch entry: a full result or a structured failure reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EstimatorOutcome {
    Estimate(EstimateResult),
    Ineligible { reason: String },
}

impl EstimatorOutcome {
    pub fn estimate(&self) -> Option<&EstimateResult> {
        match self {
            EstimatorOutcome::Estimate(e) => Some(e),
            EstimatorOutcome::Ineligible { .. } => None,
        }
    }
}

/// Two-sided normal p-value for a z statistic.
pub fn two_sided_p(z: f64) -> f64 {
    if !z.is_finite() {
        return f64::NAN;
    }
    let normal = Normal::new(0.0, 1.0).expect("standard normal should be constructible");
    let p = 2.0 * (1.0 - normal.cdf(z.abs()));
    p.clamp(PROB_EPS, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ate_se_normal_ci() {
        let res = EstimateResult::from_ate_se(2.0, 0.5, Method::Plr);
        assert!((res.ci_lower - (2.0 - Z_95 * 0.5)).abs() < 1e-12);
        assert!((res.ci_upper - (2.0 + Z_95 * 0.5)).abs() < 1e-12);
        assert!(res.p_value < 0.001, "z=4 should be highly significant");
        assert!(res.converged);
    }

    #[test]
    fn test_degenerate_result_carries_no_inference() {
        let res = EstimateResult::degenerate(Method::Irm)
            .with_diagnostic("treatment_residual_variance", 1e-14);
        assert!(!res.converged);
        assert!(res.ate.is_nan() && res.se.is_nan());
        assert!(res.diagnostics.contains_key("treatment_residual_variance"));
    }

    #[test]
    fn test_two_sided_p_symmetry() {
        assert!((two_sided_p(1.5) - two_sided_p(-1.5)).abs() < 1e-12);
        assert!((two_sided_p(0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_result_serializes() {
        let res = EstimateResult::from_ate_se(1.0, 0.2, Method::Gmm).with_diagnostic("j_stat", 0.4);
        let json = serde_json::to_string(&res).unwrap();
        let back: EstimateResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.method, Method::Gmm);
        assert!((back.ate - 1.0).abs() < 1e-12);
    }
}
