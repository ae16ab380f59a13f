// Modules
pub mod config;
pub mod constants;
pub mod data;
pub mod dml;
pub mod engine;
pub mod errors;
pub mod estimate;
pub mod gate;
pub mod iv;
pub mod model;
pub mod robust;
pub mod sensitivity;

// Individual classes, and functions
pub use config::EngineConfig;
pub use data::{Dataset, Matrix, RoleMapping};
pub use engine::{dataset_diagnostics, evaluate_quality, run_estimators, BatchResult};
pub use errors::CredenceError;
pub use estimate::{EstimateResult, EstimatorKind, EstimatorOutcome};
pub use gate::{Decision, Verdict};
