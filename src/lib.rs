// Module declarations in dependency order
pub mod utils;
pub mod core;
pub mod processing;
pub mod cli;
pub mod commands;

// Public exports for external consumers
pub use core::{ModelSettings, ModelTask, OptimizationDetails, OptimizationResult};
pub use processing::{optimize_model, ModelOptimizer};
pub use utils::{ModelFormat, OptimizerError, OptimizerResult};

// The binary entry point lives in main.rs; this file is the library API.
