//! The `limos` optimize command.

use tracing::{debug, info};

use crate::cli::Cli;
use crate::core::{ModelSettings, ModelTask, OptimizationResult};
use crate::processing::ModelOptimizer;
use crate::utils::{log_success, OptimizerResult, ValidationError};

/// Optimizes the model named on the command line.
///
/// A missing model path is reported and rejected before settings are
/// loaded or any handler runs.
pub fn optimize_model(cli: &Cli) -> OptimizerResult<OptimizationResult> {
    info!("Starting LIMOS Optimization Pipeline...");

    if !cli.model.exists() {
        return Err(ValidationError::path_not_found(&cli.model).into());
    }

    let settings = match &cli.config {
        Some(path) => {
            debug!("Loading settings from {}", path.display());
            ModelSettings::from_file(path)?
        }
        None => ModelSettings::default(),
    };

    let task = ModelTask::new(&cli.model, &cli.output, cli.format).with_settings(settings);
    let result = ModelOptimizer::new().optimize(&task)?;

    log_success("Optimization completed successfully.");
    Ok(result)
}
