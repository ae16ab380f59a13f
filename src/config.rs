//! Engine configuration
//!
//! Recognized options for the estimation and gate engine, with serde
//! defaults matching the documented decision policy.
use crate::constants::MIN_BOOTSTRAP_REPS;
use crate::errors::CredenceError;
use crate::robust::sandwich::SeMethod;
use serde::{Deserialize, Serialize};

fn default_n_folds() -> usize {
    5
}
fn default_bootstrap_reps() -> usize {
    1000
}
fn default_se_method() -> SeMethod {
    SeMethod::Hc1
}
fn default_go_threshold() -> f64 {
    0.70
}
fn default_canary_threshold() -> f64 {
    0.50
}
fn default_random_seed() -> u64 {
    0
}
fn default_max_iter() -> usize {
    200
}
fn default_rho_scale() -> f64 {
    2.0
}
fn default_propensity_clip() -> f64 {
    1e-3
}

/// Configuration surface for the estimation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of cross-fitting folds, at least 2.
    #[serde(default = "default_n_folds")]
    pub n_folds: usize,
    /// Number of bootstrap replicates, at least 200.
    #[serde(default = "default_bootstrap_reps")]
    pub bootstrap_reps: usize,
    /// Analytic robust variance estimator.
    #[serde(default = "default_se_method")]
    pub se_method: SeMethod,
    /// Pass rate at or above which the verdict is GO.
    #[serde(default = "default_go_threshold")]
    pub go_threshold: f64,
    /// Pass rate at or above which the verdict is CANARY.
    #[serde(default = "default_canary_threshold")]
    pub canary_threshold: f64,
    /// Seed for every stochastic path (fold shuffling, bootstrap draws).
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,
    /// Iteration budget for iterative solvers (GMM, logistic IRLS).
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    /// Scale constant `k` of the linear confounding bias model.
    #[serde(default = "default_rho_scale")]
    pub rho_scale: f64,
    /// Propensity clipping bound for the interactive (IRM) score.
    #[serde(default = "default_propensity_clip")]
    pub propensity_clip: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            n_folds: default_n_folds(),
            bootstrap_reps: default_bootstrap_reps(),
            se_method: default_se_method(),
            go_threshold: default_go_threshold(),
            canary_threshold: default_canary_threshold(),
            random_seed: default_random_seed(),
            max_iter: default_max_iter(),
            rho_scale: default_rho_scale(),
            propensity_clip: default_propensity_clip(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration, returning the first offending parameter.
    pub fn validate(&self) -> Result<(), CredenceError> {
        if self.n_folds < 2 {
            return Err(CredenceError::InvalidParameter(
                "n_folds".to_string(),
                "an integer >= 2".to_string(),
                self.n_folds.to_string(),
            ));
        }
        if self.bootstrap_reps < MIN_BOOTSTRAP_REPS {
            return Err(CredenceError::InvalidParameter(
                "bootstrap_reps".to_string(),
                format!("an integer >= {}", MIN_BOOTSTRAP_REPS),
                self.bootstrap_reps.to_string(),
            ));
        }
        validate_unit_interval(self.go_threshold, "go_threshold")?;
        validate_unit_interval(self.canary_threshold, "canary_threshold")?;
        if self.canary_threshold > self.go_threshold {
            return Err(CredenceError::InvalidParameter(
                "canary_threshold".to_string(),
                "a value <= go_threshold".to_string(),
                self.canary_threshold.to_string(),
            ));
        }
        if self.max_iter == 0 {
            return Err(CredenceError::InvalidParameter(
                "max_iter".to_string(),
                "an integer >= 1".to_string(),
                self.max_iter.to_string(),
            ));
        }
        if !(self.propensity_clip > 0.0 && self.propensity_clip < 0.5) {
            return Err(CredenceError::InvalidParameter(
                "propensity_clip".to_string(),
                "a real value within range 0 and 0.5".to_string(),
                self.propensity_clip.to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_unit_interval(value: f64, parameter: &str) -> Result<(), CredenceError> {
    if value.is_nan() || !(0.0..=1.0).contains(&value) {
        return Err(CredenceError::InvalidParameter(
            parameter.to_string(),
            "a real value within range 0 and 1".to_string(),
            value.to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.n_folds, 5);
        assert_eq!(config.bootstrap_reps, 1000);
        assert!((config.go_threshold - 0.70).abs() < 1e-12);
        assert!((config.canary_threshold - 0.50).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_folds_rejected() {
        let config = EngineConfig { n_folds: 1, ..Default::default() };
        assert!(matches!(config.validate(), Err(CredenceError::InvalidParameter(_, _, _))));
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let config = EngineConfig { canary_threshold: 0.9, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.n_folds, config.n_folds);
        assert_eq!(back.random_seed, config.random_seed);
    }
}
