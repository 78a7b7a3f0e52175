//! TensorFlow Lite handler.
//!
//! A TFLite flatbuffer is already the deployment format; the handler checks
//! that the file really is a TFLite model and re-saves it unchanged.

mod schema;

use serde::Serialize;
use tracing::{debug, info};

use crate::utils::{OptimizerError, OptimizerResult};
use schema::{has_tflite_identifier, root_model, TFLITE_IDENTIFIER};

/// What was found in the model header.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TfliteSummary {
    pub schema_version: u32,
    pub subgraphs: usize,
    pub operator_codes: usize,
    pub buffers: usize,
    pub description: Option<String>,
}

/// Validates the `Model` root table and describes it.
pub fn inspect(bytes: &[u8]) -> OptimizerResult<TfliteSummary> {
    if !has_tflite_identifier(bytes) {
        return Err(OptimizerError::format(format!(
            "Not a TFLite model: missing '{}' file identifier",
            TFLITE_IDENTIFIER
        )));
    }
    let model = root_model(bytes)?;

    Ok(TfliteSummary {
        schema_version: model.version(),
        subgraphs: model.subgraphs().map_or(0, |v| v.len()),
        operator_codes: model.operator_codes().map_or(0, |v| v.len()),
        buffers: model.buffers().map_or(0, |v| v.len()),
        description: model.description().map(str::to_string),
    })
}

/// Returns the bytes to write and the header summary.
pub fn optimize(bytes: &[u8]) -> OptimizerResult<(Vec<u8>, TfliteSummary)> {
    info!("Optimizing TFLite model...");
    let summary = inspect(bytes)?;
    debug!(
        "TFLite schema v{}: {} subgraph(s), {} operator code(s), {} buffer(s)",
        summary.schema_version, summary.subgraphs, summary.operator_codes, summary.buffers
    );
    Ok((bytes.to_vec(), summary))
}
