//! Error types for the model optimizer.
//!
//! Provides a hierarchy of error types using `thiserror` for ergonomic error handling.

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use serde::Serialize;

/// Validation errors for input tasks and settings.
#[derive(Error, Debug, Serialize)]
pub enum ValidationError {
    /// Path-related validation error
    #[error("Path error: {0}")]
    Path(#[from] PathError),
    /// Invalid settings error
    #[error("Settings error: {0}")]
    Settings(String),
}

/// File path errors.
#[derive(Error, Debug, Serialize)]
pub enum PathError {
    /// File does not exist
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    /// Path exists but is not a file
    #[error("Not a file: {0}")]
    NotFile(PathBuf),
    /// Path exists but is not a directory
    #[error("Not a directory: {0}")]
    NotDirectory(PathBuf),
}

/// Main error type for the optimizer.
///
/// Every handler failure is converted to this type and surfaced to the
/// binary, which logs it once and exits non-zero.
#[derive(Error, Debug, Serialize)]
pub enum OptimizerError {
    /// Task or input validation failed
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The model parsed but could not be transformed
    #[error("Processing error: {0}")]
    Processing(String),

    /// File IO error
    #[error("IO error: {0}")]
    IO(String),

    /// Unsupported model format or malformed model file
    #[error("Format error: {0}")]
    Format(String),

    /// Settings file could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),
}

/// Convenience result type for optimizer operations.
pub type OptimizerResult<T> = Result<T, OptimizerError>;

// Helper methods for error creation
impl OptimizerError {
    pub fn processing<T: Into<String>>(msg: T) -> Self {
        Self::Processing(msg.into())
    }

    pub fn format<T: Into<String>>(msg: T) -> Self {
        Self::Format(msg.into())
    }

    pub fn io<T: Into<String>>(msg: T) -> Self {
        Self::IO(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }
}

// Helper methods for validation error creation
impl ValidationError {
    pub fn path_not_found(path: impl Into<PathBuf>) -> Self {
        Self::Path(PathError::NotFound(path.into()))
    }

    pub fn not_a_file(path: impl Into<PathBuf>) -> Self {
        Self::Path(PathError::NotFile(path.into()))
    }

    pub fn not_a_directory(path: impl Into<PathBuf>) -> Self {
        Self::Path(PathError::NotDirectory(path.into()))
    }

    pub fn settings(msg: impl Into<String>) -> Self {
        Self::Settings(msg.into())
    }
}

// Convert std::io::Error to OptimizerError
impl From<io::Error> for OptimizerError {
    fn from(err: io::Error) -> Self {
        Self::IO(err.to_string())
    }
}

// Convert PathError to OptimizerError
impl From<PathError> for OptimizerError {
    fn from(err: PathError) -> Self {
        Self::Validation(ValidationError::Path(err))
    }
}

impl From<zip::result::ZipError> for OptimizerError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Format(format!("Invalid torch archive: {}", err))
    }
}

impl From<prost::DecodeError> for OptimizerError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Format(format!("Invalid ONNX protobuf: {}", err))
    }
}

impl From<flatbuffers::InvalidFlatbuffer> for OptimizerError {
    fn from(err: flatbuffers::InvalidFlatbuffer) -> Self {
        Self::Format(format!("Invalid TFLite flatbuffer: {}", err))
    }
}

impl From<serde_json::Error> for OptimizerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl OptimizerError {
    /// Whether this error means the input model path was missing.
    pub fn is_missing_input(&self) -> bool {
        matches!(
            self,
            Self::Validation(ValidationError::Path(PathError::NotFound(_)))
        )
    }
}
