//! Core types for model optimization settings and results.

use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::processing::onnx::{OnnxPass, OnnxSummary};
use crate::processing::tflite::TfliteSummary;
use crate::processing::torch::TorchSummary;
use crate::utils::{ModelFormat, OptimizerError, OptimizerResult};

/// Configuration settings for model optimization.
///
/// Every field has a default, so a settings file only needs the keys it
/// wants to change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Settings for PyTorch weight quantization
    pub torch: TorchSettings,
    /// Settings for ONNX graph optimization
    pub onnx: OnnxSettings,
}

/// Settings for int8 weight quantization of torch checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TorchSettings {
    /// Minimum tensor rank for a storage to be quantized
    pub min_rank: usize,
    /// Storages with fewer elements are left as-is
    pub min_elements: usize,
}

impl Default for TorchSettings {
    fn default() -> Self {
        Self {
            min_rank: 2,
            min_elements: 16,
        }
    }
}

/// Settings for the ONNX pass pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnnxSettings {
    /// Passes to run, in order
    pub passes: Vec<OnnxPass>,
}

impl Default for OnnxSettings {
    fn default() -> Self {
        Self {
            passes: OnnxPass::ALL.to_vec(),
        }
    }
}

impl ModelSettings {
    /// Loads settings from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> OptimizerResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OptimizerError::config(format!("Cannot read settings {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> OptimizerResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Format-specific summary of what the handler changed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum OptimizationDetails {
    Torch(TorchSummary),
    Onnx(OnnxSummary),
    Tflite(TfliteSummary),
}

/// Result of a model optimization operation.
///
/// Contains the original and optimized file information along with
/// size statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResult {
    /// Path to the original input file
    pub original_path: String,
    /// Path to the optimized output file
    pub optimized_path: String,
    /// Format the model was handled as
    pub model_format: ModelFormat,
    /// Original file size in bytes
    pub original_size: u64,
    /// Optimized file size in bytes
    pub optimized_size: u64,
    /// Bytes saved (can be negative if file grew)
    pub saved_bytes: i64,
    /// Size reduction as a percentage
    pub compression_ratio: f64,
    /// What the handler did
    pub details: OptimizationDetails,
}

impl OptimizationResult {
    /// Saved bytes and ratio derived from the two file sizes
    pub fn size_delta(original_size: u64, optimized_size: u64) -> (i64, f64) {
        let saved_bytes = original_size as i64 - optimized_size as i64;
        let compression_ratio = if original_size > 0 {
            saved_bytes as f64 / original_size as f64 * 100.0
        } else {
            0.0
        };
        (saved_bytes, compression_ratio)
    }
}
