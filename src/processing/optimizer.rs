//! Format dispatch and the load → transform → save pipeline shared by all
//! handlers.

use std::path::Path;
use tracing::{debug, error, info};

use crate::core::{ModelTask, OptimizationDetails, OptimizationResult};
use crate::utils::{
    create_dir_all, extract_filename, get_file_size, read_model, validate_task, write_atomic,
    ModelFormat, OptimizerResult,
};

use super::{onnx, tflite, torch};

/// Runs optimization tasks one at a time.
#[derive(Debug, Default, Clone)]
pub struct ModelOptimizer;

impl ModelOptimizer {
    pub fn new() -> Self {
        Self
    }

    /// Validates, transforms and saves one model.
    ///
    /// The output directory is only created once the handler has succeeded,
    /// so a failed run writes nothing.
    pub fn optimize(&self, task: &ModelTask) -> OptimizerResult<OptimizationResult> {
        validate_task(task)?;

        let input_path = task.input_path.to_string_lossy().to_string();
        let original_size = get_file_size(&task.input_path)?;
        let bytes = read_model(&task.input_path)?;
        debug!("Loaded '{}' ({} bytes) as {}", extract_filename(&input_path), original_size, task.format);

        let (optimized, details) = dispatch(task.format, &bytes, task)?;

        let output_path = task.output_path();
        create_dir_all(&task.output_dir)?;
        write_atomic(&output_path, &optimized)?;
        info!("Optimized model saved at {}", output_path.display());

        let optimized_size = optimized.len() as u64;
        let (saved_bytes, compression_ratio) =
            OptimizationResult::size_delta(original_size, optimized_size);
        debug!(
            "'{}' → {} bytes saved ({:.1}%)",
            extract_filename(&input_path),
            saved_bytes,
            compression_ratio
        );

        Ok(OptimizationResult {
            original_path: input_path,
            optimized_path: output_path.to_string_lossy().to_string(),
            model_format: task.format,
            original_size,
            optimized_size,
            saved_bytes,
            compression_ratio,
            details,
        })
    }
}

/// Routes the model bytes to the handler for `format`.
fn dispatch(
    format: ModelFormat,
    bytes: &[u8],
    task: &ModelTask,
) -> OptimizerResult<(Vec<u8>, OptimizationDetails)> {
    match format {
        ModelFormat::Torch => torch::optimize(bytes, &task.settings.torch)
            .map(|(out, summary)| (out, OptimizationDetails::Torch(summary))),
        ModelFormat::Onnx => onnx::optimize(bytes, &task.settings.onnx)
            .map(|(out, summary)| (out, OptimizationDetails::Onnx(summary))),
        ModelFormat::Tflite => tflite::optimize(bytes)
            .map(|(out, summary)| (out, OptimizationDetails::Tflite(summary))),
    }
}

/// Optimizes a model given its format as a raw tag.
///
/// An unknown tag is logged and returned as a format error before anything
/// is read or written.
pub fn optimize_model(
    model_path: impl AsRef<Path>,
    format_tag: &str,
    output_dir: impl AsRef<Path>,
) -> OptimizerResult<OptimizationResult> {
    let format: ModelFormat = format_tag.parse().inspect_err(|e| error!("{}", e))?;
    let task = ModelTask::new(model_path.as_ref(), output_dir.as_ref(), format);
    ModelOptimizer::new().optimize(&task)
}
