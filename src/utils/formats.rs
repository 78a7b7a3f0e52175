use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use crate::utils::OptimizerError;

/// File name (without extension) every optimized model is written to.
pub const OUTPUT_STEM: &str = "optimized_model";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    /// PyTorch checkpoint written by `torch.save`
    Torch,
    /// ONNX protobuf graph
    Onnx,
    /// TensorFlow Lite flatbuffer
    Tflite,
}

impl ModelFormat {
    /// Tag used on the command line
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Torch => "torch",
            Self::Onnx => "onnx",
            Self::Tflite => "tflite",
        }
    }

    /// Get file extensions associated with this format
    pub fn extensions(&self) -> &[&str] {
        match self {
            Self::Torch => &["pt", "pth", "bin"],
            Self::Onnx => &["onnx"],
            Self::Tflite => &["tflite"],
        }
    }

    /// Check if the extension matches this format
    pub fn matches_extension(&self, ext: &str) -> bool {
        let ext = ext.to_lowercase();
        self.extensions().contains(&ext.as_str())
    }

    /// Get the primary extension for this format
    pub fn primary_extension(&self) -> &str {
        self.extensions()[0]
    }

    /// Fixed output file name, e.g. `optimized_model.onnx`
    pub fn output_file_name(&self) -> String {
        format!("{}.{}", OUTPUT_STEM, self.primary_extension())
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ModelFormat {
    type Err = OptimizerError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let tag = tag.to_lowercase();
        match tag.as_str() {
            "torch" => Ok(Self::Torch),
            "onnx" => Ok(Self::Onnx),
            "tflite" => Ok(Self::Tflite),
            _ => Err(OptimizerError::format(format!(
                "Unsupported model format: {}", tag
            ))),
        }
    }
}
