//! Sensitivity analysis
//!
//! Quantifies how much unobserved confounding would be needed to overturn an
//! estimate: VanderWeele-Ding E-values on the risk-ratio scale and a critical
//! confounding correlation found by bisection on the adjusted interval.
use crate::constants::Z_95;
use crate::errors::CredenceError;
use serde::{Deserialize, Serialize};

/// How resistant an estimate is to unobserved confounding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitivityReport {
    /// E-value for the point estimate.
    pub evalue_point: f64,
    /// E-value for the CI bound closer to the null.
    pub evalue_ci: f64,
    /// Smallest confounding correlation that moves the adjusted CI to cover
    /// zero; `None` when even `rho = 1` cannot overturn the estimate.
    pub rho_critical: Option<f64>,
    /// Upper bound on feasible confounding given the observed nuisance fit.
    pub rho_max: f64,
}

/// Sensitivity analyzer for a single treatment-effect estimate.
#[derive(Debug, Clone)]
pub struct SensitivityAnalyzer {
    /// Scale linking the confounding correlation to a bias in SE units.
    pub rho_scale: f64,
    /// Out-of-fold R-squared of the outcome nuisance model.
    pub r2_outcome: f64,
    /// Out-of-fold R-squared of the treatment nuisance model.
    pub r2_treatment: f64,
}

impl SensitivityAnalyzer {
    pub fn new(rho_scale: f64, r2_outcome: f64, r2_treatment: f64) -> Result<Self, CredenceError> {
        if !(rho_scale.is_finite() && rho_scale > 0.0) {
            return Err(CredenceError::InvalidParameter(
                "rho_scale".to_string(),
                "a positive finite number".to_string(),
                format!("{}", rho_scale),
            ));
        }
        Ok(SensitivityAnalyzer {
            rho_scale,
            r2_outcome: r2_outcome.clamp(0.0, 1.0),
            r2_treatment: r2_treatment.clamp(0.0, 1.0),
        })
    }

    /// Analyze an estimate given its point value, standard error and CI.
    pub fn analyze(&self, ate: f64, se: f64, ci_lower: f64, ci_upper: f64) -> SensitivityReport {
        SensitivityReport {
            evalue_point: evalue(ate),
            evalue_ci: evalue_for_ci(ci_lower, ci_upper),
            rho_critical: self.rho_critical(ate, se),
            rho_max: ((1.0 - self.r2_outcome) * (1.0 - self.r2_treatment)).max(0.0).sqrt(),
        }
    }

    /// Smallest `rho` in [0, 1] at which the bias-adjusted CI touches zero.
    ///
    /// The adjusted bound shrinks the estimate toward the null by
    /// `rho * rho_scale * se`, so the crossing function
    /// `g(rho) = |ate| - rho * rho_scale * se - z * se` is monotone
    /// decreasing and a plain bisection suffices.
    fn rho_critical(&self, ate: f64, se: f64) -> Option<f64> {
        if !(ate.is_finite() && se.is_finite() && se > 0.0) {
            return None;
        }
        let g = |rho: f64| ate.abs() - rho * self.rho_scale * se - Z_95 * se;
        if g(0.0) <= 0.0 {
            // CI already covers zero; no confounding is needed.
            return Some(0.0);
        }
        if g(1.0) > 0.0 {
            return None;
        }
        let mut lo = 0.0_f64;
        let mut hi = 1.0_f64;
        for _ in 0..60 {
            let mid = 0.5 * (lo + hi);
            if g(mid) > 0.0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Some(0.5 * (lo + hi))
    }
}

/// E-value for an effect expressed on the treatment-effect scale.
///
/// The effect is mapped to an approximate risk ratio `rr = exp(ate)`; effects
/// at or below the null report 1.0 (no confounding needed to explain them).
pub fn evalue(ate: f64) -> f64 {
    if !ate.is_finite() {
        return f64::NAN;
    }
    let rr = ate.exp();
    if rr <= 1.0 {
        return 1.0;
    }
    rr + (rr * (rr - 1.0)).sqrt()
}

/// E-value for the confidence limit closer to the null, under the same
/// non-positive-maps-to-1.0 rule as the point E-value.
fn evalue_for_ci(ci_lower: f64, ci_upper: f64) -> f64 {
    if !(ci_lower.is_finite() && ci_upper.is_finite()) {
        return f64::NAN;
    }
    if ci_lower <= 0.0 && ci_upper >= 0.0 {
        // The CI covers the null outright.
        return 1.0;
    }
    let near_null = if ci_lower.abs() <= ci_upper.abs() { ci_lower } else { ci_upper };
    evalue(near_null)
}
