/// Two-sided 95% normal critical value.
pub const Z_95: f64 = 1.959963984540054;
/// First-stage F threshold below which an instrument is flagged as weak.
pub const STOCK_YOGO_F: f64 = 10.0;
/// Variance floor guarding denominators in moment conditions.
pub const VAR_FLOOR: f64 = 1e-10;
/// Cluster count below which cluster-robust variance is unreliable.
pub const MIN_CLUSTERS: usize = 20;
/// Minimum number of bootstrap replicates accepted by the resampler.
pub const MIN_BOOTSTRAP_REPS: usize = 200;
/// Probability clipping bound for CDF inversions.
pub const PROB_EPS: f64 = 1e-12;
