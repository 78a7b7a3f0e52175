//! Model task definition.

use std::path::PathBuf;
use serde::Serialize;
use crate::core::ModelSettings;
use crate::utils::ModelFormat;

/// Represents a single model optimization task.
///
/// Contains the input path, the output directory and the settings for
/// processing one model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelTask {
    /// Path to the source model file
    pub input_path: PathBuf,
    /// Directory the optimized model is written into
    pub output_dir: PathBuf,
    /// Format the input is handled as
    pub format: ModelFormat,
    /// Optimization settings
    pub settings: ModelSettings,
}

impl ModelTask {
    pub fn new(input_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, format: ModelFormat) -> Self {
        Self {
            input_path: input_path.into(),
            output_dir: output_dir.into(),
            format,
            settings: ModelSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ModelSettings) -> Self {
        self.settings = settings;
        self
    }

    /// `<output_dir>/optimized_model.<ext>`
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(self.format.output_file_name())
    }
}
