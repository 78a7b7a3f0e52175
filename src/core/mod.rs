//! Core types.
//!
//! This module contains the fundamental types used throughout the crate:
//! - [`ModelTask`]: Represents a model optimization task
//! - [`ModelSettings`]: Configuration for model processing
//! - [`OptimizationResult`]: Result of an optimization operation

mod types;
mod task;

pub use types::{ModelSettings, TorchSettings, OnnxSettings, OptimizationResult, OptimizationDetails};
pub use task::ModelTask;
