//! Double machine learning
//!
//! Cross-fitted, orthogonalized treatment-effect estimation. Nuisance
//! predictions are always out-of-fold: every unit's prediction comes from a
//! model that never saw that unit, which is what makes the orthogonal score
//! insensitive to nuisance overfitting.
use crate::constants::VAR_FLOOR;
use crate::data::Matrix;
use crate::errors::CredenceError;
use crate::estimate::{EstimateResult, Method};
use crate::model::NuisanceModel;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Which orthogonal score to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmlMode {
    /// Partially-linear model: residual-on-residual regression.
    Plr,
    /// Interactive model: AIPW score with per-arm outcome models.
    Irm,
}

/// Cross-fitted DML estimator.
pub struct DoubleMl {
    pub mode: DmlMode,
    pub n_folds: usize,
    pub seed: u64,
    pub outcome_model: NuisanceModel,
    pub treatment_model: NuisanceModel,
    /// Propensities are clipped to `[clip, 1 - clip]` before weighting.
    pub propensity_clip: f64,
}

/// Out-of-fold nuisance predictions for one fold's held-out units.
struct FoldFit {
    test: Vec<usize>,
    /// PLR: E[Y|X]; IRM: mu0 lives in `mu0`, mu1 in `mu1`.
    y_hat: Vec<f64>,
    /// PLR: E[D|X]; IRM: propensity.
    d_hat: Vec<f64>,
    mu0: Vec<f64>,
    mu1: Vec<f64>,
}

impl DoubleMl {
    pub fn new(mode: DmlMode, n_folds: usize, seed: u64) -> Result<Self, CredenceError> {
        if n_folds < 2 {
            return Err(CredenceError::InvalidParameter(
                "n_folds".to_string(),
                "an integer >= 2".to_string(),
                n_folds.to_string(),
            ));
        }
        let treatment_model = match mode {
            DmlMode::Plr => NuisanceModel::Ridge { lambda: 1.0 },
            DmlMode::Irm => NuisanceModel::Logistic { max_iter: 100, tol: 1e-8 },
        };
        Ok(DoubleMl {
            mode,
            n_folds,
            seed,
            outcome_model: NuisanceModel::Ridge { lambda: 1.0 },
            treatment_model,
            propensity_clip: 1e-3,
        })
    }

    pub fn with_models(mut self, outcome: NuisanceModel, treatment: NuisanceModel) -> Self {
        self.outcome_model = outcome;
        self.treatment_model = treatment;
        self
    }

    pub fn with_propensity_clip(mut self, clip: f64) -> Self {
        self.propensity_clip = clip;
        self
    }

    /// Estimate the average treatment effect of binary `d` on `y` given
    /// covariates `x`.
    pub fn estimate(
        &self,
        x: &Matrix<'_>,
        y: &[f64],
        d: &[f64],
    ) -> Result<EstimateResult, CredenceError> {
        let n = y.len();
        if d.len() != n || x.rows != n {
            return Err(CredenceError::DimensionMismatch("dml estimate".to_string(), n, d.len()));
        }
        if n < 2 * self.n_folds {
            return Err(CredenceError::InvalidParameter(
                "n".to_string(),
                format!("at least {} rows for {} folds", 2 * self.n_folds, self.n_folds),
                n.to_string(),
            ));
        }

        let folds = fold_assignment(n, self.n_folds, self.seed);
        let fits: Vec<Option<FoldFit>> = folds
            .par_iter()
            .map(|test| self.fit_fold(x, y, d, test))
            .collect::<Result<_, CredenceError>>()?;

        let method = match self.mode {
            DmlMode::Plr => Method::Plr,
            DmlMode::Irm => Method::Irm,
        };
        let mut any_empty_arm = false;
        let mut merged: Vec<&FoldFit> = Vec::with_capacity(fits.len());
        for fit in &fits {
            match fit {
                Some(f) => merged.push(f),
                None => any_empty_arm = true,
            }
        }
        if any_empty_arm {
            log::warn!("A cross-fitting fold had an empty treatment arm; returning a degenerate result.");
            return Ok(EstimateResult::degenerate(method)
                .with_diagnostic("empty_treatment_arm", 1.0)
                .with_diagnostic("n_folds", self.n_folds as f64));
        }

        // Scatter out-of-fold predictions back to sample order.
        let mut y_hat = vec![0.0; n];
        let mut d_hat = vec![0.0; n];
        let mut mu0 = vec![0.0; n];
        let mut mu1 = vec![0.0; n];
        for fit in &merged {
            for (pos, &i) in fit.test.iter().enumerate() {
                y_hat[i] = fit.y_hat[pos];
                d_hat[i] = fit.d_hat[pos];
                mu0[i] = fit.mu0[pos];
                mu1[i] = fit.mu1[pos];
            }
        }

        let result = match self.mode {
            DmlMode::Plr => self.plr_score(y, d, &y_hat, &d_hat, &folds),
            DmlMode::Irm => self.irm_score(y, d, &d_hat, &mu0, &mu1),
        };
        Ok(result
            .with_diagnostic("outcome_r_squared", match self.mode {
                DmlMode::Plr => r_squared(y, &y_hat),
                DmlMode::Irm => {
                    let blended: Vec<f64> = (0..n)
                        .map(|i| if d[i] > 0.5 { mu1[i] } else { mu0[i] })
                        .collect();
                    r_squared(y, &blended)
                }
            })
            .with_diagnostic("treatment_r_squared", r_squared(d, &d_hat))
            .with_diagnostic("n_folds", self.n_folds as f64))
    }

    fn fit_fold(
        &self,
        x: &Matrix<'_>,
        y: &[f64],
        d: &[f64],
        test: &[usize],
    ) -> Result<Option<FoldFit>, CredenceError> {
        let n = y.len();
        let in_test = {
            let mut mask = vec![false; n];
            for &i in test {
                mask[i] = true;
            }
            mask
        };
        let train: Vec<usize> = (0..n).filter(|&i| !in_test[i]).collect();

        let x_train_buf = x.take_rows(&train);
        let x_train = Matrix::new(&x_train_buf, train.len(), x.cols);
        let x_test_buf = x.take_rows(test);
        let x_test = Matrix::new(&x_test_buf, test.len(), x.cols);
        let d_train: Vec<f64> = train.iter().map(|&i| d[i]).collect();

        let mut treatment = self.treatment_model.build();
        treatment.fit(&x_train, &d_train)?;
        let d_hat = match self.mode {
            DmlMode::Plr => treatment.predict(&x_test),
            DmlMode::Irm => treatment.predict_proba(&x_test).unwrap_or_else(|| treatment.predict(&x_test)),
        };

        match self.mode {
            DmlMode::Plr => {
                let y_train: Vec<f64> = train.iter().map(|&i| y[i]).collect();
                let mut outcome = self.outcome_model.build();
                outcome.fit(&x_train, &y_train)?;
                let y_hat = outcome.predict(&x_test);
                Ok(Some(FoldFit {
                    test: test.to_vec(),
                    y_hat,
                    d_hat,
                    mu0: vec![0.0; test.len()],
                    mu1: vec![0.0; test.len()],
                }))
            }
            DmlMode::Irm => {
                let treated: Vec<usize> = train.iter().copied().filter(|&i| d[i] > 0.5).collect();
                let control: Vec<usize> = train.iter().copied().filter(|&i| d[i] <= 0.5).collect();
                if treated.is_empty() || control.is_empty() {
                    return Ok(None);
                }

                let mut mu = [Vec::new(), Vec::new()];
                for (arm, rows) in [(0, &control), (1, &treated)] {
                    let x_arm_buf = x.take_rows(rows);
                    let x_arm = Matrix::new(&x_arm_buf, rows.len(), x.cols);
                    let y_arm: Vec<f64> = rows.iter().map(|&i| y[i]).collect();
                    let mut model = self.outcome_model.build();
                    model.fit(&x_arm, &y_arm)?;
                    mu[arm] = model.predict(&x_test);
                }
                let [mu0, mu1] = mu;
                Ok(Some(FoldFit {
                    test: test.to_vec(),
                    y_hat: vec![0.0; test.len()],
                    d_hat,
                    mu0,
                    mu1,
                }))
            }
        }
    }

    /// Partially-linear score: fold-level residual-on-residual coefficients
    /// averaged into theta, variance from the normalized influence function
    /// over the pooled residuals.
    fn plr_score(
        &self,
        y: &[f64],
        d: &[f64],
        y_hat: &[f64],
        d_hat: &[f64],
        folds: &[Vec<usize>],
    ) -> EstimateResult {
        let n = y.len();
        let y_res: Vec<f64> = y.iter().zip(y_hat).map(|(a, b)| a - b).collect();
        let d_res: Vec<f64> = d.iter().zip(d_hat).map(|(a, b)| a - b).collect();

        let d_res_var = d_res.iter().map(|v| v * v).sum::<f64>() / n as f64;
        if d_res_var < VAR_FLOOR {
            log::warn!(
                "Treatment residual variance {:.3e} is below the floor; the treatment carries no variation beyond the covariates.",
                d_res_var
            );
            return EstimateResult::degenerate(Method::Plr)
                .with_diagnostic("treatment_residual_variance", d_res_var);
        }

        let mut fold_thetas = Vec::with_capacity(folds.len());
        for fold in folds {
            let denom: f64 = fold.iter().map(|&i| d_res[i] * d_res[i]).sum();
            if denom < VAR_FLOOR {
                return EstimateResult::degenerate(Method::Plr)
                    .with_diagnostic("treatment_residual_variance", denom / fold.len() as f64);
            }
            let num: f64 = fold.iter().map(|&i| y_res[i] * d_res[i]).sum();
            fold_thetas.push(num / denom);
        }
        let theta = fold_thetas.iter().sum::<f64>() / fold_thetas.len() as f64;

        // psi_i = (y_res - theta * d_res) * d_res / mean(d_res^2), so that
        // sd(psi)/sqrt(n) is on the scale of theta.
        let psi: Vec<f64> = y_res
            .iter()
            .zip(&d_res)
            .map(|(yr, dr)| (yr - theta * dr) * dr / d_res_var)
            .collect();
        let se = (sample_variance(&psi) / n as f64).sqrt();
        EstimateResult::from_ate_se(theta, se, Method::Plr)
            .with_diagnostic("treatment_residual_variance", d_res_var)
    }

    /// Interactive score: AIPW pseudo-outcome averaged over the sample.
    fn irm_score(
        &self,
        y: &[f64],
        d: &[f64],
        propensity: &[f64],
        mu0: &[f64],
        mu1: &[f64],
    ) -> EstimateResult {
        let n = y.len();
        let clip = self.propensity_clip;
        let psi: Vec<f64> = (0..n)
            .map(|i| {
                let p = propensity[i].clamp(clip, 1.0 - clip);
                mu1[i] - mu0[i] + d[i] * (y[i] - mu1[i]) / p
                    - (1.0 - d[i]) * (y[i] - mu0[i]) / (1.0 - p)
            })
            .collect();
        let ate = psi.iter().sum::<f64>() / n as f64;
        let se = (sample_variance(&psi) / n as f64).sqrt();

        let n_clipped = propensity.iter().filter(|&&p| p < clip || p > 1.0 - clip).count();
        EstimateResult::from_ate_se(ate, se, Method::Irm)
            .with_diagnostic("propensity_clipped_share", n_clipped as f64 / n as f64)
    }
}

/// Shuffle row indices and split them into `k` near-equal folds.
fn fold_assignment(n: usize, k: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let base = n / k;
    let extra = n % k;
    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for f in 0..k {
        let len = base + usize::from(f < extra);
        folds.push(indices[start..start + len].to_vec());
        start += len;
    }
    folds
}

fn sample_variance(v: &[f64]) -> f64 {
    let n = v.len() as f64;
    let mean = v.iter().sum::<f64>() / n;
    v.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0)
}

/// Out-of-sample R-squared of predictions against a target.
fn r_squared(target: &[f64], predicted: &[f64]) -> f64 {
    let n = target.len() as f64;
    let mean = target.iter().sum::<f64>() / n;
    let tss: f64 = target.iter().map(|v| (v - mean) * (v - mean)).sum();
    if tss < VAR_FLOOR {
        return 0.0;
    }
    let rss: f64 = target.iter().zip(predicted).map(|(t, p)| (t - p) * (t - p)).sum();
    (1.0 - rss / tss).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    /// Confounded synthetic data: x drives both d and y, with a constant
    /// treatment effect tau.
    fn synthetic(n: usize, tau: f64, seed: u64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = Vec::with_capacity(n);
        let mut d = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        for _ in 0..n {
            let xi: f64 = rng.gen_range(-2.0..2.0);
            let p = 1.0 / (1.0 + (-1.5 * xi).exp());
            let di = if rng.gen::<f64>() < p { 1.0 } else { 0.0 };
            let noise: f64 = rng.gen_range(-0.5..0.5);
            y.push(2.0 + tau * di + 3.0 * xi + noise);
            x.push(xi);
            d.push(di);
        }
        (x, y, d)
    }

    #[test]
    fn test_fold_assignment_partitions() {
        let folds = fold_assignment(103, 5, 42);
        assert_eq!(folds.len(), 5);
        let mut seen = vec![false; 103];
        for fold in &folds {
            for &i in fold {
                assert!(!seen[i], "index {} appears in two folds", i);
                seen[i] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
        let sizes: Vec<usize> = folds.iter().map(|f| f.len()).collect();
        assert!(sizes.iter().all(|&s| s == 20 || s == 21));
    }

    #[test]
    fn test_plr_recovers_effect_under_confounding() {
        let (x_col, y, d) = synthetic(800, 5.0, 1);
        let x = Matrix::new(&x_col, 800, 1);
        let dml = DoubleMl::new(DmlMode::Plr, 5, 7).unwrap();
        let res = dml.estimate(&x, &y, &d).unwrap();
        assert!(res.converged);
        assert!((res.ate - 5.0).abs() < 0.5, "ate = {}", res.ate);
        assert!(res.se > 0.0 && res.se < 0.5);
        // Naive difference in means is badly biased upward here.
        let naive = {
            let t: Vec<f64> = y.iter().zip(&d).filter(|(_, &di)| di > 0.5).map(|(v, _)| *v).collect();
            let c: Vec<f64> = y.iter().zip(&d).filter(|(_, &di)| di <= 0.5).map(|(v, _)| *v).collect();
            t.iter().sum::<f64>() / t.len() as f64 - c.iter().sum::<f64>() / c.len() as f64
        };
        assert!((naive - 5.0).abs() > 1.0, "naive = {} should be visibly biased", naive);
    }

    #[test]
    fn test_irm_recovers_effect_under_confounding() {
        let (x_col, y, d) = synthetic(1000, 5.0, 3);
        let x = Matrix::new(&x_col, 1000, 1);
        let dml = DoubleMl::new(DmlMode::Irm, 5, 11).unwrap();
        let res = dml.estimate(&x, &y, &d).unwrap();
        assert!(res.converged);
        assert!((res.ate - 5.0).abs() < 1.0, "ate = {}", res.ate);
        assert!(res.ci_lower < 5.0 && 5.0 < res.ci_upper);
        assert!(res.diagnostics.contains_key("outcome_r_squared"));
    }

    #[test]
    fn test_plr_interval_coverage() {
        // Nominal 95% CIs over 100 simulated datasets must cover the truth
        // at least 93 times (binomial sd of the count is ~2.2 at p=0.95).
        let tau = 3.0;
        let mut covered = 0;
        for seed in 0..100 {
            let (x_col, y, d) = synthetic(500, tau, 1000 + seed);
            let x = Matrix::new(&x_col, 500, 1);
            let res = DoubleMl::new(DmlMode::Plr, 5, seed).unwrap().estimate(&x, &y, &d).unwrap();
            if res.ci_lower <= tau && tau <= res.ci_upper {
                covered += 1;
            }
        }
        assert!(covered >= 93, "covered {}/100", covered);
    }

    #[test]
    fn test_same_seed_is_bit_identical() {
        let (x_col, y, d) = synthetic(300, 2.0, 9);
        let x = Matrix::new(&x_col, 300, 1);
        let a = DoubleMl::new(DmlMode::Plr, 5, 21).unwrap().estimate(&x, &y, &d).unwrap();
        let b = DoubleMl::new(DmlMode::Plr, 5, 21).unwrap().estimate(&x, &y, &d).unwrap();
        assert_eq!(a.ate.to_bits(), b.ate.to_bits());
        assert_eq!(a.se.to_bits(), b.se.to_bits());
    }

    #[test]
    fn test_constant_treatment_is_degenerate_not_error() {
        let (x_col, y, _) = synthetic(200, 2.0, 5);
        let x = Matrix::new(&x_col, 200, 1);
        let d = vec![1.0; 200];
        let res = DoubleMl::new(DmlMode::Plr, 4, 1).unwrap().estimate(&x, &y, &d).unwrap();
        assert!(!res.converged);
        assert!(res.ate.is_nan());
        assert!(res.diagnostics.contains_key("treatment_residual_variance"));
    }

    #[test]
    fn test_irm_empty_arm_is_degenerate() {
        let (x_col, y, _) = synthetic(200, 2.0, 5);
        let x = Matrix::new(&x_col, 200, 1);
        let d = vec![0.0; 200];
        let res = DoubleMl::new(DmlMode::Irm, 4, 1).unwrap().estimate(&x, &y, &d).unwrap();
        assert!(!res.converged);
        assert_eq!(res.diagnostics.get("empty_treatment_arm"), Some(&1.0));
    }

    #[test]
    fn test_cross_fitting_differs_from_in_sample_fit() {
        // An in-sample (leaky) fit has optimistic residuals; the cross-fit
        // estimate must not coincide with it bit-for-bit.
        let (x_col, y, d) = synthetic(400, 3.0, 13);
        let x = Matrix::new(&x_col, 400, 1);
        let crossfit = DoubleMl::new(DmlMode::Plr, 5, 2).unwrap().estimate(&x, &y, &d).unwrap();

        let mut outcome = NuisanceModel::Ridge { lambda: 1.0 }.build();
        outcome.fit(&x, &y).unwrap();
        let y_hat = outcome.predict(&x);
        let mut treatment = NuisanceModel::Ridge { lambda: 1.0 }.build();
        treatment.fit(&x, &d).unwrap();
        let d_hat = treatment.predict(&x);
        let y_res: Vec<f64> = y.iter().zip(&y_hat).map(|(a, b)| a - b).collect();
        let d_res: Vec<f64> = d.iter().zip(&d_hat).map(|(a, b)| a - b).collect();
        let leaky = y_res.iter().zip(&d_res).map(|(a, b)| a * b).sum::<f64>()
            / d_res.iter().map(|v| v * v).sum::<f64>();

        assert_ne!(crossfit.ate.to_bits(), leaky.to_bits());
    }

    #[test]
    fn test_too_few_rows_rejected() {
        let x_col = vec![0.0, 1.0, 2.0, 3.0];
        let x = Matrix::new(&x_col, 4, 1);
        let y = vec![0.0, 1.0, 2.0, 3.0];
        let d = vec![0.0, 1.0, 0.0, 1.0];
        let dml = DoubleMl::new(DmlMode::Plr, 5, 0).unwrap();
        assert!(dml.estimate(&x, &y, &d).is_err());
    }
}
