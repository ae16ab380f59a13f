//! Sandwich variance estimators
//!
//! Heteroskedasticity-consistent (HC0-HC3) and cluster-robust covariance for
//! linear estimating equations: `V = (X'X)^{-1} M (X'X)^{-1}` where the meat
//! `M` depends on the chosen method.
use crate::constants::MIN_CLUSTERS;
use crate::errors::CredenceError;
use hashbrown::HashMap;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Analytic robust variance estimator selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeMethod {
    /// Plain White sandwich.
    Hc0,
    /// `n/(n-k)` degrees-of-freedom corrected sandwich.
    Hc1,
    /// Leverage-adjusted: residuals scaled by `1/(1-h_ii)`.
    Hc2,
    /// Leverage-adjusted: residuals scaled by `1/(1-h_ii)^2`.
    Hc3,
    /// One-way Liang-Zeger cluster sandwich.
    Cluster,
    /// Two-way cluster sandwich (inclusion-exclusion of one-way pieces).
    TwoWayCluster,
}

/// Robust standard errors plus the diagnostics callers must surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandwichResult {
    /// One standard error per design column.
    pub se: Vec<f64>,
    /// Number of clusters used, for the cluster variants.
    pub n_clusters: Option<usize>,
    /// Set when fewer than [`MIN_CLUSTERS`] clusters exist; the estimate is
    /// still returned but downstream gates should treat it with suspicion.
    pub few_clusters: bool,
}

/// Compute robust standard errors for a fitted linear estimating equation.
///
/// * `x` - design matrix (n rows, k columns).
/// * `residuals` - fitted residuals, length n.
/// * `method` - variance estimator.
/// * `clusters` - required for the cluster variants.
/// * `clusters2` - second clustering dimension, required for two-way.
pub fn sandwich_se(
    x: &DMatrix<f64>,
    residuals: &[f64],
    method: SeMethod,
    clusters: Option<&[u64]>,
    clusters2: Option<&[u64]>,
) -> Result<SandwichResult, CredenceError> {
    let n = x.nrows();
    let k = x.ncols();
    if residuals.len() != n {
        return Err(CredenceError::DimensionMismatch("sandwich residuals".to_string(), n, residuals.len()));
    }
    let xtx = x.transpose() * x;
    let bread = xtx.try_inverse().ok_or_else(|| {
        CredenceError::NumericDegenerate("sandwich".to_string(), "X'X is singular".to_string())
    })?;

    match method {
        SeMethod::Hc0 | SeMethod::Hc1 | SeMethod::Hc2 | SeMethod::Hc3 => {
            let vcov = hc_vcov(x, residuals, &bread, method);
            Ok(SandwichResult {
                se: diag_se(&vcov),
                n_clusters: None,
                few_clusters: false,
            })
        }
        SeMethod::Cluster => {
            let ids = clusters.ok_or_else(|| {
                CredenceError::InvalidParameter(
                    "clusters".to_string(),
                    "cluster ids for SeMethod::Cluster".to_string(),
                    "None".to_string(),
                )
            })?;
            let (vcov, g) = cluster_vcov(x, residuals, &bread, ids)?;
            let few = g < MIN_CLUSTERS;
            if few {
                log::warn!(
                    "Cluster-robust variance computed over only {} clusters (fewer than {}); treat with suspicion.",
                    g,
                    MIN_CLUSTERS
                );
            }
            Ok(SandwichResult { se: diag_se(&vcov), n_clusters: Some(g), few_clusters: few })
        }
        SeMethod::TwoWayCluster => {
            let ids1 = clusters.ok_or_else(|| {
                CredenceError::InvalidParameter(
                    "clusters".to_string(),
                    "first cluster dimension for SeMethod::TwoWayCluster".to_string(),
                    "None".to_string(),
                )
            })?;
            let ids2 = clusters2.ok_or_else(|| {
                CredenceError::InvalidParameter(
                    "clusters2".to_string(),
                    "second cluster dimension for SeMethod::TwoWayCluster".to_string(),
                    "None".to_string(),
                )
            })?;
            if ids2.len() != n {
                return Err(CredenceError::DimensionMismatch("clusters2".to_string(), n, ids2.len()));
            }
            // Cameron-Gelbach-Miller: V = V1 + V2 - V12.
            let (v1, g1) = cluster_vcov(x, residuals, &bread, ids1)?;
            let (v2, g2) = cluster_vcov(x, residuals, &bread, ids2)?;
            let inter = intersect_ids(ids1, ids2);
            let (v12, _) = cluster_vcov(x, residuals, &bread, &inter)?;
            let vcov = v1 + v2 - v12;
            let g = g1.min(g2);
            let few = g < MIN_CLUSTERS;
            if few {
                log::warn!(
                    "Two-way cluster variance with a smallest dimension of {} clusters (fewer than {}).",
                    g,
                    MIN_CLUSTERS
                );
            }
            Ok(SandwichResult { se: diag_se(&vcov), n_clusters: Some(g), few_clusters: few })
        }
    }
    .map(|mut res| {
        debug_assert_eq!(res.se.len(), k);
        res.se.iter_mut().for_each(|s| {
            if !s.is_finite() {
                *s = f64::NAN;
            }
        });
        res
    })
}

fn hc_vcov(x: &DMatrix<f64>, residuals: &[f64], bread: &DMatrix<f64>, method: SeMethod) -> DMatrix<f64> {
    let n = x.nrows();
    let k = x.ncols();
    let mut meat = DMatrix::zeros(k, k);
    for i in 0..n {
        let xi = x.row(i);
        let e2 = residuals[i] * residuals[i];
        let w = match method {
            SeMethod::Hc2 | SeMethod::Hc3 => {
                // Leverage h_ii = x_i (X'X)^{-1} x_i'.
                let h = (xi * bread * xi.transpose())[(0, 0)];
                let one_minus_h = (1.0 - h).max(1e-12);
                match method {
                    SeMethod::Hc2 => 1.0 / one_minus_h,
                    _ => 1.0 / (one_minus_h * one_minus_h),
                }
            }
            _ => 1.0,
        };
        for a in 0..k {
            for b in 0..k {
                meat[(a, b)] += w * e2 * x[(i, a)] * x[(i, b)];
            }
        }
    }
    let mut vcov = bread * meat * bread;
    if method == SeMethod::Hc1 && n > k {
        vcov *= n as f64 / (n - k) as f64;
    }
    vcov
}

/// Liang-Zeger one-way cluster sandwich with the standard small-sample
/// correction `G/(G-1) * (N-1)/(N-K)`.
fn cluster_vcov(
    x: &DMatrix<f64>,
    residuals: &[f64],
    bread: &DMatrix<f64>,
    cluster_ids: &[u64],
) -> Result<(DMatrix<f64>, usize), CredenceError> {
    let n = x.nrows();
    let k = x.ncols();
    if cluster_ids.len() != n {
        return Err(CredenceError::DimensionMismatch("cluster_ids".to_string(), n, cluster_ids.len()));
    }

    let mut cluster_map: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, &cid) in cluster_ids.iter().enumerate() {
        cluster_map.entry(cid).or_default().push(i);
    }
    let g = cluster_map.len();

    // Meat: B = sum_g s_g s_g' with cluster score s_g = X_g' e_g.
    let mut meat = DMatrix::zeros(k, k);
    for indices in cluster_map.values() {
        let mut s_g = vec![0.0_f64; k];
        for &i in indices {
            let e_i = residuals[i];
            for j in 0..k {
                s_g[j] += x[(i, j)] * e_i;
            }
        }
        for a in 0..k {
            for b in 0..k {
                meat[(a, b)] += s_g[a] * s_g[b];
            }
        }
    }

    let n_f = n as f64;
    let k_f = k as f64;
    let g_f = g as f64;
    let correction = if g > 1 && n_f > k_f {
        (g_f / (g_f - 1.0)) * ((n_f - 1.0) / (n_f - k_f))
    } else {
        1.0
    };
    Ok((bread * meat * bread * correction, g))
}

fn diag_se(vcov: &DMatrix<f64>) -> Vec<f64> {
    (0..vcov.ncols()).map(|j| vcov[(j, j)].max(0.0).sqrt()).collect()
}

/// Map each (a, b) id pair to a unique intersection cluster id.
fn intersect_ids(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut seen: HashMap<(u64, u64), u64> = HashMap::new();
    let mut next = 0u64;
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            *seen.entry((x, y)).or_insert_with(|| {
                let id = next;
                next += 1;
                id
            })
        })
        .collect()
}
