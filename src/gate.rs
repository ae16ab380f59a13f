//! Quality gate
//!
//! Turns a battery of named checks over estimate diagnostics into a single
//! ship/no-ship verdict. Evaluation is pure and deterministic: the same
//! checks and thresholds always produce the same decision.
use crate::errors::CredenceError;
use serde::{Deserialize, Serialize};

/// Which aspect of the analysis a check guards.
///
/// The rationale lists failures in this declaration order, so the most
/// fundamental problems surface first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GateCategory {
    /// Is the estimate precise enough to act on?
    Precision,
    /// Are the identifying assumptions credible?
    Identification,
    /// Does the estimate survive stress tests?
    Robustness,
    /// Is the pipeline itself healthy?
    Decision,
}

/// Pass direction for a check threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    /// Pass when `value <= threshold`.
    Le,
    /// Pass when `value >= threshold`.
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateStatus {
    Pass,
    Fail,
    /// The underlying diagnostic was unavailable; excluded from the rate.
    Na,
}

/// One named threshold check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCheck {
    pub name: String,
    pub category: GateCategory,
    pub comparator: Comparator,
    pub threshold: f64,
    /// Observed diagnostic; `None` when the producing estimator did not run.
    pub value: Option<f64>,
}

impl GateCheck {
    pub fn new(
        name: &str,
        category: GateCategory,
        comparator: Comparator,
        threshold: f64,
        value: Option<f64>,
    ) -> Self {
        GateCheck { name: name.to_string(), category, comparator, threshold, value }
    }

    pub fn status(&self) -> GateStatus {
        match self.value {
            None => GateStatus::Na,
            Some(v) if !v.is_finite() => GateStatus::Na,
            Some(v) => {
                // Boundary values pass.
                let ok = match self.comparator {
                    Comparator::Le => v <= self.threshold,
                    Comparator::Ge => v >= self.threshold,
                };
                if ok {
                    GateStatus::Pass
                } else {
                    GateStatus::Fail
                }
            }
        }
    }
}

/// Final verdict of the quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// Ship: the evidence supports acting on the estimate.
    Go,
    /// Ship to a limited audience and keep watching.
    Canary,
    /// Do not act on this estimate.
    Hold,
}

/// Gate outcome with the evidence that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    /// Share of evaluable checks that passed.
    pub pass_rate: f64,
    pub pass_count: usize,
    pub fail_count: usize,
    pub na_count: usize,
    /// One line per failed check, ordered by category then name.
    pub rationale: Vec<String>,
    pub checks: Vec<(String, GateStatus)>,
}

/// Threshold-based decision engine over a check battery.
#[derive(Debug, Clone)]
pub struct QualityGateEngine {
    go_threshold: f64,
    canary_threshold: f64,
}

impl QualityGateEngine {
    pub fn new(go_threshold: f64, canary_threshold: f64) -> Result<Self, CredenceError> {
        if !(0.0..=1.0).contains(&go_threshold) || !(0.0..=1.0).contains(&canary_threshold) {
            return Err(CredenceError::InvalidParameter(
                "gate thresholds".to_string(),
                "values in [0, 1]".to_string(),
                format!("go={} canary={}", go_threshold, canary_threshold),
            ));
        }
        if canary_threshold > go_threshold {
            return Err(CredenceError::InvalidParameter(
                "canary_threshold".to_string(),
                "a value <= go_threshold".to_string(),
                format!("{}", canary_threshold),
            ));
        }
        Ok(QualityGateEngine { go_threshold, canary_threshold })
    }

    /// Evaluate a check battery into a verdict.
    ///
    /// NA checks are excluded from the denominator; an all-NA battery is a
    /// `Hold` because nothing could be verified.
    pub fn evaluate(&self, checks: &[GateCheck]) -> Decision {
        let mut pass_count = 0usize;
        let mut fail_count = 0usize;
        let mut na_count = 0usize;
        let mut statuses = Vec::with_capacity(checks.len());

        let mut failed: Vec<&GateCheck> = Vec::new();
        for check in checks {
            let status = check.status();
            statuses.push((check.name.clone(), status));
            match status {
                GateStatus::Pass => pass_count += 1,
                GateStatus::Fail => {
                    fail_count += 1;
                    failed.push(check);
                }
                GateStatus::Na => na_count += 1,
            }
        }

        let evaluable = pass_count + fail_count;
        let pass_rate = if evaluable > 0 { pass_count as f64 / evaluable as f64 } else { 0.0 };

        let verdict = if evaluable == 0 {
            Verdict::Hold
        } else if pass_rate >= self.go_threshold {
            Verdict::Go
        } else if pass_rate >= self.canary_threshold {
            Verdict::Canary
        } else {
            Verdict::Hold
        };

        failed.sort_by(|a, b| a.category.cmp(&b.category).then_with(|| a.name.cmp(&b.name)));
        let rationale = failed
            .iter()
            .map(|c| {
                let op = match c.comparator {
                    Comparator::Le => "<=",
                    Comparator::Ge => ">=",
                };
                format!(
                    "{:?}: {} failed ({} {} {} required)",
                    c.category,
                    c.name,
                    c.value.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "NA".to_string()),
                    op,
                    c.threshold
                )
            })
            .collect();

        if verdict != Verdict::Go {
            log::info!(
                "Quality gate verdict {:?}: {}/{} checks passed ({} not evaluable).",
                verdict,
                pass_count,
                evaluable,
                na_count
            );
        }

        Decision { verdict, pass_rate, pass_count, fail_count, na_count, rationale, checks: statuses }
    }
}
