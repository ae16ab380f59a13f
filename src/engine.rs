//! Estimation engine
//!
//! The batch entry point: resolve roles once, run every requested estimator
//! over the same resolved data, attach sensitivity analysis and dataset
//! diagnostics, then fold everything into the quality gate.
use crate::config::EngineConfig;
use crate::constants::STOCK_YOGO_F;
use crate::data::{Dataset, Matrix, ResolvedRoles, RoleMapping};
use crate::dml::{DmlMode, DoubleMl};
use crate::errors::CredenceError;
use crate::estimate::{EstimateResult, EstimatorKind, EstimatorOutcome, Method};
use crate::gate::{Comparator, Decision, GateCategory, GateCheck, QualityGateEngine};
use crate::iv::InstrumentalVariables;
use crate::model::NuisanceModel;
use crate::robust::bootstrap::{Bootstrap, BootstrapMethod, BootstrapResult};
use crate::robust::sandwich::SeMethod;
use crate::sensitivity::{SensitivityAnalyzer, SensitivityReport};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

/// Per-dataset health indicators computed once per batch and consumed by the
/// quality gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDiagnostics {
    pub n_rows: usize,
    pub treated_share: f64,
    /// Share of units whose estimated propensity lies in [0.05, 0.95];
    /// 1.0 when there are no covariates to condition on.
    pub overlap_share: f64,
    /// Largest absolute standardized mean difference across covariates.
    pub max_abs_smd: f64,
    pub n_clusters: Option<usize>,
}

/// One batch of estimator runs over a single dataset and role mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub results: HashMap<EstimatorKind, EstimatorOutcome>,
    /// Sensitivity report for the primary estimate, when one converged.
    pub sensitivity: Option<SensitivityReport>,
    /// Unadjusted difference in mean outcomes between arms.
    pub naive_difference: f64,
}

impl BatchResult {
    /// The preferred converged estimate: IRM over PLR over 2SLS over GMM.
    pub fn primary(&self) -> Option<(EstimatorKind, &EstimateResult)> {
        const PREFERENCE: [EstimatorKind; 4] = [
            EstimatorKind::DmlIrm,
            EstimatorKind::DmlPlr,
            EstimatorKind::TwoStageLeastSquares,
            EstimatorKind::Gmm,
        ];
        PREFERENCE.iter().find_map(|kind| {
            let est = self.results.get(kind)?.estimate()?;
            if est.converged && est.ate.is_finite() && est.se.is_finite() {
                Some((*kind, est))
            } else {
                None
            }
        })
    }
}

/// Run the requested estimators over one dataset.
///
/// Each entry is independent: a numerically degenerate estimator recovers
/// into a `converged=false` result and an inapplicable one into
/// `Ineligible`, so one bad estimator never takes down the batch. Only role
/// resolution failures abort.
pub fn run_estimators(
    data: &Dataset,
    roles: &RoleMapping,
    estimators: &[EstimatorKind],
    config: &EngineConfig,
) -> Result<BatchResult, CredenceError> {
    config.validate()?;
    let resolved = roles.resolve(data)?;
    let x = resolved.covariate_matrix();
    log::info!(
        "Running {} estimator(s) over {} rows with {} covariate(s).",
        estimators.len(),
        resolved.rows,
        resolved.n_covariates
    );

    let mut results: HashMap<EstimatorKind, EstimatorOutcome> = HashMap::new();
    for &kind in estimators {
        if results.contains_key(&kind) {
            continue;
        }
        let outcome = run_one(kind, &resolved, &x, config)?;
        if let EstimatorOutcome::Ineligible { reason } = &outcome {
            log::warn!("Estimator {} is ineligible: {}", kind.name(), reason);
        }
        results.insert(kind, outcome);
    }

    let naive = naive_difference(resolved.outcome, resolved.treatment);
    let batch = BatchResult { results, sensitivity: None, naive_difference: naive };
    let sensitivity = match batch.primary() {
        Some((_, primary)) => {
            let r2_y = primary.diagnostics.get("outcome_r_squared").copied().unwrap_or(0.0);
            let r2_d = primary.diagnostics.get("treatment_r_squared").copied().unwrap_or(0.0);
            let analyzer = SensitivityAnalyzer::new(config.rho_scale, r2_y, r2_d)?;
            Some(analyzer.analyze(primary.ate, primary.se, primary.ci_lower, primary.ci_upper))
        }
        None => None,
    };
    Ok(BatchResult { sensitivity, ..batch })
}

fn run_one(
    kind: EstimatorKind,
    resolved: &ResolvedRoles<'_>,
    x: &Matrix<'_>,
    config: &EngineConfig,
) -> Result<EstimatorOutcome, CredenceError> {
    match kind {
        EstimatorKind::DmlPlr | EstimatorKind::DmlIrm => {
            // Dataset-size problems are per-estimator, never batch-fatal.
            if resolved.rows < 2 * config.n_folds {
                return Ok(EstimatorOutcome::Ineligible {
                    reason: format!(
                        "{} rows cannot support {} cross-fitting folds",
                        resolved.rows, config.n_folds
                    ),
                });
            }
            let mode = if kind == EstimatorKind::DmlPlr { DmlMode::Plr } else { DmlMode::Irm };
            let dml = DoubleMl::new(mode, config.n_folds, config.random_seed)?
                .with_models(
                    NuisanceModel::Ridge { lambda: 1.0 },
                    match mode {
                        DmlMode::Plr => NuisanceModel::Ridge { lambda: 1.0 },
                        DmlMode::Irm => NuisanceModel::Logistic { max_iter: config.max_iter, tol: 1e-8 },
                    },
                )
                .with_propensity_clip(config.propensity_clip);
            recover(kind, dml.estimate(x, resolved.outcome, resolved.treatment))
        }
        EstimatorKind::TwoStageLeastSquares | EstimatorKind::Gmm => {
            let z = match resolved.instrument_matrix() {
                Some(z) => z,
                None => {
                    let reason = if resolved.instruments_requested {
                        "requested instrument columns are absent from the dataset".to_string()
                    } else {
                        "no instrument columns were mapped".to_string()
                    };
                    return Ok(EstimatorOutcome::Ineligible { reason });
                }
            };
            let min_rows = 1 + resolved.n_covariates + resolved.n_instruments;
            if resolved.rows <= min_rows {
                return Ok(EstimatorOutcome::Ineligible {
                    reason: format!(
                        "{} rows cannot identify {} instrument columns",
                        resolved.rows, min_rows
                    ),
                });
            }
            let clusters = resolved.cluster_ids.as_deref();
            let se_method = effective_se_method(config.se_method, clusters);
            let iv = match kind {
                EstimatorKind::TwoStageLeastSquares => InstrumentalVariables::two_stage(se_method),
                _ => InstrumentalVariables::gmm(config.max_iter),
            };
            recover(kind, iv.estimate(x, &z, resolved.outcome, resolved.treatment, clusters))
        }
    }
}

/// Cluster-requiring variance methods silently fall back to HC1 when no
/// cluster column was mapped.
fn effective_se_method(requested: SeMethod, clusters: Option<&[u64]>) -> SeMethod {
    match requested {
        SeMethod::Cluster | SeMethod::TwoWayCluster if clusters.is_none() => {
            log::warn!("Cluster-robust variance requested without a cluster_id role; using HC1.");
            SeMethod::Hc1
        }
        other => other,
    }
}

/// Map recoverable numeric failures into a non-converged result; propagate
/// everything else.
fn recover(
    kind: EstimatorKind,
    result: Result<EstimateResult, CredenceError>,
) -> Result<EstimatorOutcome, CredenceError> {
    match result {
        Ok(est) => Ok(EstimatorOutcome::Estimate(est)),
        Err(CredenceError::NumericDegenerate(context, reason)) => {
            log::warn!("Estimator {} degenerated in {}: {}", kind.name(), context, reason);
            Ok(EstimatorOutcome::Estimate(EstimateResult::degenerate(method_of(kind))))
        }
        Err(CredenceError::OptimizerTimeout(context, budget)) => {
            log::warn!("Estimator {} exhausted {} iterations in {}.", kind.name(), budget, context);
            Ok(EstimatorOutcome::Estimate(EstimateResult::degenerate(method_of(kind))))
        }
        Err(CredenceError::IneligibleEstimator(_, reason)) => {
            Ok(EstimatorOutcome::Ineligible { reason })
        }
        Err(other) => Err(other),
    }
}

fn method_of(kind: EstimatorKind) -> Method {
    match kind {
        EstimatorKind::DmlPlr => Method::Plr,
        EstimatorKind::DmlIrm => Method::Irm,
        EstimatorKind::TwoStageLeastSquares => Method::TwoStageLeastSquares,
        EstimatorKind::Gmm => Method::Gmm,
    }
}

/// Unadjusted difference in mean outcomes between treated and control arms.
pub fn naive_difference(y: &[f64], d: &[f64]) -> f64 {
    let mut sum_t = 0.0;
    let mut n_t = 0usize;
    let mut sum_c = 0.0;
    let mut n_c = 0usize;
    for (yi, di) in y.iter().zip(d.iter()) {
        if *di > 0.5 {
            sum_t += yi;
            n_t += 1;
        } else {
            sum_c += yi;
            n_c += 1;
        }
    }
    if n_t == 0 || n_c == 0 {
        return f64::NAN;
    }
    sum_t / n_t as f64 - sum_c / n_c as f64
}

/// Bootstrap the naive difference in means, resampling whole clusters when
/// a cluster role is mapped. Gives a model-free reference interval to set
/// against the adjusted estimates.
pub fn bootstrap_naive_difference(
    data: &Dataset,
    roles: &RoleMapping,
    config: &EngineConfig,
) -> Result<BootstrapResult, CredenceError> {
    let resolved = roles.resolve(data)?;
    let mut boot =
        Bootstrap::new(BootstrapMethod::Pairs, config.bootstrap_reps, config.random_seed)?;
    if let Some(ids) = &resolved.cluster_ids {
        boot.method = BootstrapMethod::Cluster;
        boot = boot.with_clusters(ids.clone());
    }
    let y = resolved.outcome;
    let d = resolved.treatment;
    boot.run(resolved.rows, |indices| {
        let yi: Vec<f64> = indices.iter().map(|&i| y[i]).collect();
        let di: Vec<f64> = indices.iter().map(|&i| d[i]).collect();
        let v = naive_difference(&yi, &di);
        if v.is_finite() {
            Some(v)
        } else {
            None
        }
    })
}

/// Compute the per-dataset health indicators the gate consumes.
pub fn dataset_diagnostics(
    data: &Dataset,
    roles: &RoleMapping,
    config: &EngineConfig,
) -> Result<DatasetDiagnostics, CredenceError> {
    let resolved = roles.resolve(data)?;
    let n = resolved.rows;
    let treated: Vec<usize> =
        (0..n).filter(|&i| resolved.treatment[i] > 0.5).collect();
    let treated_share = treated.len() as f64 / n as f64;

    let x = resolved.covariate_matrix();
    let overlap_share = if x.cols == 0 {
        1.0
    } else {
        let mut model = NuisanceModel::Logistic { max_iter: config.max_iter, tol: 1e-8 }.build();
        model.fit(&x, resolved.treatment)?;
        let probs = model.predict_proba(&x).unwrap_or_else(|| model.predict(&x));
        probs.iter().filter(|p| (0.05..=0.95).contains(*p)).count() as f64 / n as f64
    };

    let max_abs_smd = (0..x.cols)
        .map(|j| standardized_mean_difference(x.get_col(j), resolved.treatment).abs())
        .fold(0.0_f64, f64::max);

    let n_clusters = resolved.cluster_ids.as_ref().map(|ids| {
        let unique: HashSet<u64> = ids.iter().copied().collect();
        unique.len()
    });

    Ok(DatasetDiagnostics {
        n_rows: n,
        treated_share,
        overlap_share,
        max_abs_smd,
        n_clusters,
    })
}

/// `(mean_t - mean_c) / sqrt((var_t + var_c) / 2)` for one covariate.
fn standardized_mean_difference(col: &[f64], d: &[f64]) -> f64 {
    let (mut sum_t, mut sum_c, mut n_t, mut n_c) = (0.0, 0.0, 0usize, 0usize);
    for (v, di) in col.iter().zip(d.iter()) {
        if *di > 0.5 {
            sum_t += v;
            n_t += 1;
        } else {
            sum_c += v;
            n_c += 1;
        }
    }
    if n_t < 2 || n_c < 2 {
        return 0.0;
    }
    let mean_t = sum_t / n_t as f64;
    let mean_c = sum_c / n_c as f64;
    let (mut ss_t, mut ss_c) = (0.0, 0.0);
    for (v, di) in col.iter().zip(d.iter()) {
        if *di > 0.5 {
            ss_t += (v - mean_t) * (v - mean_t);
        } else {
            ss_c += (v - mean_c) * (v - mean_c);
        }
    }
    let var_t = ss_t / (n_t - 1) as f64;
    let var_c = ss_c / (n_c - 1) as f64;
    let pooled = ((var_t + var_c) / 2.0).sqrt();
    if pooled > 0.0 {
        (mean_t - mean_c) / pooled
    } else {
        0.0
    }
}

/// Build the default check battery and evaluate it into a verdict.
pub fn evaluate_quality(
    batch: &BatchResult,
    diagnostics: &DatasetDiagnostics,
    config: &EngineConfig,
) -> Result<Decision, CredenceError> {
    let checks = default_battery(batch, diagnostics);
    let gate = QualityGateEngine::new(config.go_threshold, config.canary_threshold)?;
    Ok(gate.evaluate(&checks))
}

/// The default gate battery: precision of the primary estimate, credibility
/// of identification, robustness to confounding, and pipeline health.
pub fn default_battery(batch: &BatchResult, diagnostics: &DatasetDiagnostics) -> Vec<GateCheck> {
    let primary = batch.primary().map(|(_, est)| est);

    let ci_width_ratio = primary.and_then(|p| {
        let scale = p.ate.abs();
        if scale > 0.0 {
            Some(p.ci_width() / scale)
        } else {
            None
        }
    });
    let p_value = primary.map(|p| p.p_value);

    // IV identification diagnostics, from whichever IV estimator ran.
    let iv_diag = |key: &str| {
        [EstimatorKind::TwoStageLeastSquares, EstimatorKind::Gmm].iter().find_map(|kind| {
            batch.results.get(kind)?.estimate()?.diagnostics.get(key).copied()
        })
    };

    let converged_estimates: Vec<&EstimateResult> = batch
        .results
        .values()
        .filter_map(|o| o.estimate())
        .filter(|e| e.converged && e.ate.is_finite())
        .collect();
    let agreement = primary.and_then(|p| {
        if converged_estimates.len() < 2 || !(p.se.is_finite() && p.se > 0.0) {
            return None;
        }
        let mut max_gap = 0.0_f64;
        for a in &converged_estimates {
            for b in &converged_estimates {
                max_gap = max_gap.max((a.ate - b.ate).abs());
            }
        }
        Some(max_gap / p.se)
    });
    let all_converged = if batch.results.is_empty() {
        None
    } else {
        let ok = batch
            .results
            .values()
            .filter_map(|o| o.estimate())
            .all(|e| e.converged);
        Some(if ok { 1.0 } else { 0.0 })
    };

    vec![
        GateCheck::new("ci_width_over_ate", GateCategory::Precision, Comparator::Le, 2.0, ci_width_ratio),
        GateCheck::new("p_value", GateCategory::Precision, Comparator::Le, 0.05, p_value),
        GateCheck::new(
            "first_stage_f",
            GateCategory::Identification,
            Comparator::Ge,
            STOCK_YOGO_F,
            iv_diag("f_statistic"),
        ),
        GateCheck::new(
            "overid_p_value",
            GateCategory::Identification,
            Comparator::Ge,
            0.05,
            iv_diag("overid_p_value"),
        ),
        GateCheck::new(
            "overlap_share",
            GateCategory::Identification,
            Comparator::Ge,
            0.90,
            Some(diagnostics.overlap_share),
        ),
        GateCheck::new(
            "max_abs_smd",
            GateCategory::Identification,
            Comparator::Le,
            0.25,
            Some(diagnostics.max_abs_smd),
        ),
        GateCheck::new(
            "evalue_point",
            GateCategory::Robustness,
            Comparator::Ge,
            1.5,
            batch.sensitivity.as_ref().map(|s| s.evalue_point),
        ),
        GateCheck::new("estimator_agreement", GateCategory::Robustness, Comparator::Le, 1.0, agreement),
        GateCheck::new("all_converged", GateCategory::Decision, Comparator::Ge, 1.0, all_converged),
        GateCheck::new(
            "n_rows",
            GateCategory::Decision,
            Comparator::Ge,
            100.0,
            Some(diagnostics.n_rows as f64),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Verdict;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Confounded observational dataset with a known effect of 5.0: three
    /// covariates drive both selection into treatment and the outcome.
    fn confounded_dataset(n: usize, tau: f64, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut cols: Vec<(String, Vec<f64>)> = vec![
            ("y".to_string(), Vec::with_capacity(n)),
            ("d".to_string(), Vec::with_capacity(n)),
            ("x1".to_string(), Vec::with_capacity(n)),
            ("x2".to_string(), Vec::with_capacity(n)),
            ("x3".to_string(), Vec::with_capacity(n)),
        ];
        for _ in 0..n {
            let x1: f64 = rng.gen_range(-1.0..1.0);
            let x2: f64 = rng.gen_range(-1.0..1.0);
            let x3: f64 = rng.gen_range(-1.0..1.0);
            let score = 1.2 * x1 - 0.8 * x2 + 0.5 * x3 - 0.8;
            let p = 1.0 / (1.0 + (-score).exp());
            let d = if rng.gen::<f64>() < p { 1.0 } else { 0.0 };
            let y = 2.0 + tau * d + 3.0 * x1 - 2.0 * x2 + x3 + rng.gen_range(-0.5..0.5);
            cols[0].1.push(y);
            cols[1].1.push(d);
            cols[2].1.push(x1);
            cols[3].1.push(x2);
            cols[4].1.push(x3);
        }
        Dataset::from_columns(cols).unwrap()
    }

    fn roles() -> RoleMapping {
        RoleMapping::new("y", "d", vec!["x1".to_string(), "x2".to_string(), "x3".to_string()])
    }

    #[test]
    fn test_irm_batch_recovers_known_effect() {
        let data = confounded_dataset(1000, 5.0, 4);
        let config = EngineConfig::default();
        let batch = run_estimators(
            &data,
            &roles(),
            &[EstimatorKind::DmlIrm, EstimatorKind::DmlPlr],
            &config,
        )
        .unwrap();

        let (kind, primary) = batch.primary().unwrap();
        assert_eq!(kind, EstimatorKind::DmlIrm);
        assert!((3.5..=6.5).contains(&primary.ate), "ate = {}", primary.ate);
        assert!(primary.se < 1.5, "se = {}", primary.se);
        // The naive contrast absorbs the confounding and lands off by more
        // than one DML standard error.
        assert!(
            (batch.naive_difference - 5.0).abs() > primary.se,
            "naive = {}, se = {}",
            batch.naive_difference,
            primary.se
        );
        assert!(batch.sensitivity.is_some());
    }

    #[test]
    fn test_iv_without_instruments_is_ineligible() {
        let data = confounded_dataset(300, 2.0, 8);
        let config = EngineConfig::default();
        let batch = run_estimators(
            &data,
            &roles(),
            &[EstimatorKind::TwoStageLeastSquares],
            &config,
        )
        .unwrap();
        match &batch.results[&EstimatorKind::TwoStageLeastSquares] {
            EstimatorOutcome::Ineligible { reason } => {
                assert!(reason.contains("no instrument columns"));
            }
            EstimatorOutcome::Estimate(_) => panic!("should be ineligible without instruments"),
        }
    }

    #[test]
    fn test_tiny_dataset_skips_estimators_without_aborting() {
        // 8 rows cannot support 5-fold cross-fitting; the batch must still
        // come back with one entry per requested estimator.
        let data = confounded_dataset(8, 1.0, 21);
        let batch = run_estimators(
            &data,
            &roles(),
            &[EstimatorKind::DmlPlr, EstimatorKind::TwoStageLeastSquares],
            &EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(batch.results.len(), 2);
        match &batch.results[&EstimatorKind::DmlPlr] {
            EstimatorOutcome::Ineligible { reason } => {
                assert!(reason.contains("cross-fitting folds"), "reason: {}", reason);
            }
            EstimatorOutcome::Estimate(_) => panic!("8 rows cannot feed 5 folds"),
        }
        assert!(batch.results[&EstimatorKind::TwoStageLeastSquares].estimate().is_none());
    }

    #[test]
    fn test_missing_role_aborts_batch() {
        let data = confounded_dataset(100, 1.0, 2);
        let bad = RoleMapping::new("y", "not_a_column", vec![]);
        let err =
            run_estimators(&data, &bad, &[EstimatorKind::DmlPlr], &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, CredenceError::MissingRole(_, _)));
    }

    #[test]
    fn test_diagnostics_and_gate_on_healthy_dataset() {
        let data = confounded_dataset(1000, 5.0, 6);
        let config = EngineConfig::default();
        let diagnostics = dataset_diagnostics(&data, &roles(), &config).unwrap();
        assert_eq!(diagnostics.n_rows, 1000);
        assert!(diagnostics.treated_share > 0.1 && diagnostics.treated_share < 0.9);
        assert!(diagnostics.overlap_share > 0.5);
        // Selection on covariates leaves a visible imbalance.
        assert!(diagnostics.max_abs_smd > 0.1);

        let batch =
            run_estimators(&data, &roles(), &[EstimatorKind::DmlIrm, EstimatorKind::DmlPlr], &config)
                .unwrap();
        let decision = evaluate_quality(&batch, &diagnostics, &config).unwrap();
        // A large, well-estimated effect on a healthy dataset should ship.
        assert_ne!(decision.verdict, Verdict::Hold, "rationale: {:?}", decision.rationale);
    }

    #[test]
    fn test_battery_marks_missing_iv_diagnostics_na() {
        let data = confounded_dataset(400, 3.0, 12);
        let config = EngineConfig::default();
        let diagnostics = dataset_diagnostics(&data, &roles(), &config).unwrap();
        let batch = run_estimators(&data, &roles(), &[EstimatorKind::DmlPlr], &config).unwrap();
        let checks = default_battery(&batch, &diagnostics);
        let f_check = checks.iter().find(|c| c.name == "first_stage_f").unwrap();
        assert!(f_check.value.is_none());
    }

    #[test]
    fn test_naive_difference_simple() {
        let y = vec![1.0, 2.0, 5.0, 6.0];
        let d = vec![0.0, 0.0, 1.0, 1.0];
        assert!((naive_difference(&y, &d) - 4.0).abs() < 1e-12);
        assert!(naive_difference(&y, &[0.0; 4]).is_nan());
    }

    #[test]
    fn test_bootstrap_naive_difference_reproducible() {
        let data = confounded_dataset(300, 4.0, 19);
        let config = EngineConfig { bootstrap_reps: 400, ..Default::default() };
        let a = bootstrap_naive_difference(&data, &roles(), &config).unwrap();
        let b = bootstrap_naive_difference(&data, &roles(), &config).unwrap();
        assert_eq!(a.ci_lower.to_bits(), b.ci_lower.to_bits());
        // The point estimate is the full-sample naive difference.
        let resolved = roles().resolve(&data).unwrap();
        let naive = naive_difference(resolved.outcome, resolved.treatment);
        assert!((a.ate - naive).abs() < 1e-12);
        assert!(a.ci_lower <= naive && naive <= a.ci_upper);
    }

    #[test]
    fn test_batch_is_deterministic() {
        let data = confounded_dataset(400, 3.0, 15);
        let config = EngineConfig::default();
        let kinds = [EstimatorKind::DmlPlr];
        let a = run_estimators(&data, &roles(), &kinds, &config).unwrap();
        let b = run_estimators(&data, &roles(), &kinds, &config).unwrap();
        let ea = a.results[&EstimatorKind::DmlPlr].estimate().unwrap();
        let eb = b.results[&EstimatorKind::DmlPlr].estimate().unwrap();
        assert_eq!(ea.ate.to_bits(), eb.ate.to_bits());
    }
}
