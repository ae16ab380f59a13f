//! Robust inference
//!
//! Analytic sandwich variance estimators and resampling-based inference
//! shared by every estimator in the crate.
pub mod bootstrap;
pub mod sandwich;
