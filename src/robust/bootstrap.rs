//! Bootstrap inference
//!
//! Resampling-based confidence intervals shared by all estimators. Replicate
//! draws are seeded per replicate, so two runs with the same `(data, method,
//! seed)` produce bit-identical bootstrap distributions regardless of how
//! the replicates are scheduled across threads.
use crate::constants::{MIN_BOOTSTRAP_REPS, PROB_EPS, Z_95};
use crate::errors::CredenceError;
use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Row resampling scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapMethod {
    /// Resample rows with replacement.
    Pairs,
    /// Reshuffle fixed contiguous blocks of the given length.
    Block { block_len: usize },
    /// Resample with replacement within each stratum.
    Stratified,
    /// Resample whole clusters with replacement.
    Cluster,
}

/// Weight distribution for the wild bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WildWeights {
    /// +1 or -1 with equal probability.
    Rademacher,
    /// Mammen's two-point distribution (matches third moments).
    Mammen,
}

/// Confidence interval construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CiMethod {
    Percentile,
    Normal,
    Basic,
    /// Bias-corrected and accelerated (jackknife acceleration).
    Bca,
}

/// Point estimate plus resampling inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapResult {
    /// Full-sample point estimate.
    pub ate: f64,
    /// Standard deviation of the replicate distribution.
    pub se: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Replicates that produced a finite estimate.
    pub n_effective: usize,
}

/// Configured bootstrap driver.
pub struct Bootstrap {
    pub method: BootstrapMethod,
    pub n_reps: usize,
    pub seed: u64,
    pub ci_method: CiMethod,
    /// Stratum id per row, required for `Stratified`.
    pub strata: Option<Vec<u64>>,
    /// Cluster id per row, required for `Cluster`.
    pub clusters: Option<Vec<u64>>,
}

impl Bootstrap {
    pub fn new(method: BootstrapMethod, n_reps: usize, seed: u64) -> Result<Self, CredenceError> {
        if n_reps < MIN_BOOTSTRAP_REPS {
            return Err(CredenceError::InvalidParameter(
                "n_reps".to_string(),
                format!("an integer >= {}", MIN_BOOTSTRAP_REPS),
                n_reps.to_string(),
            ));
        }
        Ok(Bootstrap { method, n_reps, seed, ci_method: CiMethod::Percentile, strata: None, clusters: None })
    }

    pub fn with_ci(mut self, ci_method: CiMethod) -> Self {
        self.ci_method = ci_method;
        self
    }

    pub fn with_strata(mut self, strata: Vec<u64>) -> Self {
        self.strata = Some(strata);
        self
    }

    pub fn with_clusters(mut self, clusters: Vec<u64>) -> Self {
        self.clusters = Some(clusters);
        self
    }

    /// Run an index-resampling bootstrap over `n` rows.
    ///
    /// `estimator` receives resampled row indices and returns `None` when a
    /// replicate is degenerate; failed replicates are dropped from the
    /// distribution rather than poisoning it.
    pub fn run<F>(&self, n: usize, estimator: F) -> Result<BootstrapResult, CredenceError>
    where
        F: Fn(&[usize]) -> Option<f64> + Sync,
    {
        if n == 0 {
            return Err(CredenceError::InvalidParameter(
                "n".to_string(),
                "a positive number of rows".to_string(),
                "0".to_string(),
            ));
        }
        let identity: Vec<usize> = (0..n).collect();
        let theta_hat = estimator(&identity).ok_or_else(|| {
            CredenceError::NumericDegenerate(
                "bootstrap".to_string(),
                "estimator failed on the full sample".to_string(),
            )
        })?;

        let replicates: Vec<f64> = (0..self.n_reps)
            .into_par_iter()
            .filter_map(|rep| {
                let mut rng = self.replicate_rng(rep);
                let indices = self.draw_indices(n, &mut rng)?;
                estimator(&indices).filter(|v| v.is_finite())
            })
            .collect();

        self.summarize(
            theta_hat,
            replicates,
            |left_out| {
                // Leave-one-out estimates feed the BCa acceleration.
                let idx: Vec<usize> = (0..n).filter(|&i| i != left_out).collect();
                estimator(&idx)
            },
            n,
        )
    }

    /// Wild bootstrap for a residual-based linear estimator.
    ///
    /// Each replicate rebuilds the outcome as `fitted + v * residual` with
    /// sign-flipping weights `v` and calls `refit` on the perturbed outcome.
    /// BCa is not defined for this scheme; percentile intervals are used in
    /// its place.
    pub fn wild<F>(
        &self,
        fitted: &[f64],
        residuals: &[f64],
        weights: WildWeights,
        refit: F,
    ) -> Result<BootstrapResult, CredenceError>
    where
        F: Fn(&[f64]) -> Option<f64> + Sync,
    {
        let n = fitted.len();
        if residuals.len() != n {
            return Err(CredenceError::DimensionMismatch("wild residuals".to_string(), n, residuals.len()));
        }
        let original: Vec<f64> = fitted.iter().zip(residuals.iter()).map(|(f, e)| f + e).collect();
        let theta_hat = refit(&original).ok_or_else(|| {
            CredenceError::NumericDegenerate(
                "wild bootstrap".to_string(),
                "estimator failed on the full sample".to_string(),
            )
        })?;

        let replicates: Vec<f64> = (0..self.n_reps)
            .into_par_iter()
            .filter_map(|rep| {
                let mut rng = self.replicate_rng(rep);
                let perturbed: Vec<f64> = fitted
                    .iter()
                    .zip(residuals.iter())
                    .map(|(f, e)| f + draw_wild_weight(weights, &mut rng) * e)
                    .collect();
                refit(&perturbed).filter(|v| v.is_finite())
            })
            .collect();

        let ci_method = if self.ci_method == CiMethod::Bca { CiMethod::Percentile } else { self.ci_method };
        let (se, ci_lower, ci_upper) = interval(theta_hat, &replicates, ci_method, None);
        Ok(BootstrapResult { ate: theta_hat, se, ci_lower, ci_upper, n_effective: replicates.len() })
    }

    fn replicate_rng(&self, rep: usize) -> StdRng {
        // Distinct deterministic stream per replicate.
        StdRng::seed_from_u64(self.seed.wrapping_add((rep as u64 + 1).wrapping_mul(0x9E3779B97F4A7C15)))
    }

    fn draw_indices(&self, n: usize, rng: &mut StdRng) -> Option<Vec<usize>> {
        match self.method {
            BootstrapMethod::Pairs => Some((0..n).map(|_| rng.gen_range(0..n)).collect()),
            BootstrapMethod::Block { block_len } => {
                let block_len = block_len.max(1);
                let mut blocks: Vec<Vec<usize>> =
                    (0..n).collect::<Vec<usize>>().chunks(block_len).map(|c| c.to_vec()).collect();
                blocks.shuffle(rng);
                Some(blocks.into_iter().flatten().collect())
            }
            BootstrapMethod::Stratified => {
                let strata = self.strata.as_ref()?;
                if strata.len() != n {
                    return None;
                }
                let mut groups: HashMap<u64, Vec<usize>> = HashMap::new();
                for (i, &s) in strata.iter().enumerate() {
                    groups.entry(s).or_default().push(i);
                }
                let mut keys: Vec<u64> = groups.keys().copied().collect();
                keys.sort_unstable();
                let mut out = Vec::with_capacity(n);
                for key in keys {
                    let members = &groups[&key];
                    for _ in 0..members.len() {
                        out.push(members[rng.gen_range(0..members.len())]);
                    }
                }
                Some(out)
            }
            BootstrapMethod::Cluster => {
                let clusters = self.clusters.as_ref()?;
                if clusters.len() != n {
                    return None;
                }
                let mut groups: HashMap<u64, Vec<usize>> = HashMap::new();
                for (i, &c) in clusters.iter().enumerate() {
                    groups.entry(c).or_default().push(i);
                }
                let mut keys: Vec<u64> = groups.keys().copied().collect();
                keys.sort_unstable();
                let g = keys.len();
                let mut out = Vec::with_capacity(n);
                for _ in 0..g {
                    let key = keys[rng.gen_range(0..g)];
                    out.extend_from_slice(&groups[&key]);
                }
                Some(out)
            }
        }
    }

    fn summarize<J>(
        &self,
        theta_hat: f64,
        replicates: Vec<f64>,
        jackknife: J,
        n: usize,
    ) -> Result<BootstrapResult, CredenceError>
    where
        J: Fn(usize) -> Option<f64> + Sync,
    {
        if replicates.len() < 2 {
            return Err(CredenceError::NumericDegenerate(
                "bootstrap".to_string(),
                format!("only {} replicates produced a finite estimate", replicates.len()),
            ));
        }
        let jk = if self.ci_method == CiMethod::Bca {
            Some((0..n).into_par_iter().filter_map(&jackknife).collect::<Vec<f64>>())
        } else {
            None
        };
        let (se, ci_lower, ci_upper) = interval(theta_hat, &replicates, self.ci_method, jk.as_deref());
        Ok(BootstrapResult { ate: theta_hat, se, ci_lower, ci_upper, n_effective: replicates.len() })
    }
}

fn draw_wild_weight(weights: WildWeights, rng: &mut StdRng) -> f64 {
    match weights {
        WildWeights::Rademacher => {
            if rng.gen::<bool>() {
                1.0
            } else {
                -1.0
            }
        }
        WildWeights::Mammen => {
            let sqrt5 = 5.0_f64.sqrt();
            let p = (sqrt5 + 1.0) / (2.0 * sqrt5);
            if rng.gen::<f64>() < p {
                -(sqrt5 - 1.0) / 2.0
            } else {
                (sqrt5 + 1.0) / 2.0
            }
        }
    }
}

fn interval(theta_hat: f64, replicates: &[f64], ci_method: CiMethod, jackknife: Option<&[f64]>) -> (f64, f64, f64) {
    let m = replicates.len() as f64;
    let mean = replicates.iter().sum::<f64>() / m;
    let var = replicates.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (m - 1.0);
    let se = var.sqrt();

    let mut sorted = replicates.to_vec();
    sorted.sort_by(f64::total_cmp);

    match ci_method {
        CiMethod::Percentile => (se, quantile_sorted(&sorted, 0.025), quantile_sorted(&sorted, 0.975)),
        CiMethod::Normal => (se, theta_hat - Z_95 * se, theta_hat + Z_95 * se),
        CiMethod::Basic => {
            let lo = quantile_sorted(&sorted, 0.025);
            let hi = quantile_sorted(&sorted, 0.975);
            (se, 2.0 * theta_hat - hi, 2.0 * theta_hat - lo)
        }
        CiMethod::Bca => {
            let z0 = bias_correction_z0(theta_hat, replicates);
            let accel = jackknife.map(acceleration_from_jackknife).unwrap_or(0.0);
            let alpha_lo = bca_adjusted_alpha(0.025, z0, accel);
            let alpha_hi = bca_adjusted_alpha(0.975, z0, accel);
            let lo = quantile_sorted(&sorted, alpha_lo);
            let hi = quantile_sorted(&sorted, alpha_hi);
            (se, lo.min(hi), lo.max(hi))
        }
    }
}

/// Quantile of sorted data via linear interpolation.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let i = pos.floor() as usize;
    let j = pos.ceil() as usize;
    if i == j {
        return sorted[i];
    }
    let t = pos - i as f64;
    (1.0 - t) * sorted[i] + t * sorted[j]
}

fn standard_normal() -> Normal {
    Normal::new(0.0, 1.0).expect("standard normal should be constructible")
}

/// Bias-correction constant from the share of replicates below the point
/// estimate, with mid-rank handling of ties.
fn bias_correction_z0(theta_hat: f64, replicates: &[f64]) -> f64 {
    let mut n_lt = 0usize;
    let mut n_eq = 0usize;
    for &v in replicates {
        if v < theta_hat {
            n_lt += 1;
        } else if v == theta_hat {
            n_eq += 1;
        }
    }
    let p = ((n_lt as f64 + 0.5 * n_eq as f64) / replicates.len() as f64).clamp(PROB_EPS, 1.0 - PROB_EPS);
    standard_normal().inverse_cdf(p)
}

/// Acceleration from leave-one-out estimates:
/// `a = sum((mean - jk_i)^3) / (6 * sum((mean - jk_i)^2)^1.5)`.
fn acceleration_from_jackknife(jackknife: &[f64]) -> f64 {
    if jackknife.len() < 3 {
        return 0.0;
    }
    let mean = jackknife.iter().sum::<f64>() / jackknife.len() as f64;
    let mut sum2 = 0.0;
    let mut sum3 = 0.0;
    for &v in jackknife {
        let d = mean - v;
        sum2 += d * d;
        sum3 += d * d * d;
    }
    if !(sum2.is_finite() && sum2 > 0.0) {
        return 0.0;
    }
    let a = sum3 / (6.0 * sum2.powf(1.5));
    if a.is_finite() {
        a
    } else {
        0.0
    }
}

fn bca_adjusted_alpha(alpha: f64, z0: f64, acceleration: f64) -> f64 {
    let normal = standard_normal();
    let z_alpha = normal.inverse_cdf(alpha.clamp(PROB_EPS, 1.0 - PROB_EPS));
    let denom = 1.0 - acceleration * (z0 + z_alpha);
    if !denom.is_finite() || denom.abs() < 1e-12 {
        return if denom.is_sign_negative() { PROB_EPS } else { 1.0 - PROB_EPS };
    }
    normal.cdf(z0 + (z0 + z_alpha) / denom).clamp(PROB_EPS, 1.0 - PROB_EPS)
}
