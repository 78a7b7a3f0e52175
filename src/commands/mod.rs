//! Command handlers invoked by the binary.
//!
//! - [`optimize_model`]: Optimize a single model file

mod model;

pub use model::*;
