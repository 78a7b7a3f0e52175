//! ONNX handler: decode `ModelProto`, run the pass pipeline on the main
//! graph, encode.

mod passes;
pub mod proto;

use prost::Message;
use serde::Serialize;
use tracing::{debug, info};

use crate::core::OnnxSettings;
use crate::utils::{OptimizerError, OptimizerResult};
pub use passes::OnnxPass;
use proto::{data_location, GraphProto, ModelProto, NodeProto, SparseTensorProto, TensorProto};

/// Changes made by one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassReport {
    pub pass: OnnxPass,
    pub changes: usize,
}

/// Before/after counts for the main graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnnxSummary {
    pub ir_version: i64,
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub initializers_before: usize,
    pub initializers_after: usize,
    pub passes: Vec<PassReport>,
}

pub fn decode(bytes: &[u8]) -> OptimizerResult<ModelProto> {
    Ok(ModelProto::decode(bytes)?)
}

fn is_external(tensor: &TensorProto) -> bool {
    tensor.data_location == data_location::EXTERNAL
}

fn sparse_parts(sparse: &SparseTensorProto) -> impl Iterator<Item = &TensorProto> {
    sparse.values.iter().chain(sparse.indices.iter())
}

fn external_in_node(node: &NodeProto) -> Option<&TensorProto> {
    node.attribute.iter().find_map(|a| {
        let sparse = a.sparse_tensor.iter().chain(&a.sparse_tensors).flat_map(sparse_parts);
        a.t.iter()
            .chain(&a.tensors)
            .chain(sparse)
            .find(|t| is_external(t))
            .or_else(|| a.g.iter().chain(&a.graphs).find_map(external_in_graph))
    })
}

fn external_in_graph(graph: &GraphProto) -> Option<&TensorProto> {
    let sparse = graph.sparse_initializer.iter().flat_map(sparse_parts);
    graph
        .initializer
        .iter()
        .chain(sparse)
        .find(|t| is_external(t))
        .or_else(|| graph.node.iter().find_map(external_in_node))
}

/// First tensor anywhere in the model whose data is stored in a side file.
fn external_tensor(model: &ModelProto) -> Option<&TensorProto> {
    let training = model
        .training_info
        .iter()
        .flat_map(|t| t.initialization.iter().chain(t.algorithm.iter()));
    model
        .graph
        .iter()
        .chain(training)
        .find_map(external_in_graph)
        .or_else(|| model.functions.iter().flat_map(|f| &f.node).find_map(external_in_node))
}

/// Runs the configured passes over a decoded model in place.
///
/// Models that keep tensor data in side files are rejected: only the
/// `.onnx` file is written, so the output would reference data that is
/// not next to it.
pub fn optimize_model(model: &mut ModelProto, settings: &OnnxSettings) -> OptimizerResult<OnnxSummary> {
    if let Some(tensor) = external_tensor(model) {
        let location = tensor
            .external_data
            .iter()
            .find(|e| e.key == "location")
            .map_or("<unknown>", |e| e.value.as_str());
        return Err(OptimizerError::format(format!(
            "External tensor data is not supported: '{}' is stored in {}",
            tensor.name, location
        )));
    }

    let ir_version = model.ir_version;
    let graph = model
        .graph
        .as_mut()
        .ok_or_else(|| OptimizerError::format("ONNX model has no graph"))?;

    let nodes_before = graph.node.len();
    let initializers_before = graph.initializer.len();
    let mut reports = Vec::with_capacity(settings.passes.len());

    for pass in &settings.passes {
        let changes = pass.run(graph);
        debug!("{}: {} change(s)", pass, changes);
        reports.push(PassReport { pass: *pass, changes });
    }

    Ok(OnnxSummary {
        ir_version,
        nodes_before,
        nodes_after: graph.node.len(),
        initializers_before,
        initializers_after: graph.initializer.len(),
        passes: reports,
    })
}

/// Returns the re-encoded model and what changed.
pub fn optimize(bytes: &[u8], settings: &OnnxSettings) -> OptimizerResult<(Vec<u8>, OnnxSummary)> {
    info!("Optimizing ONNX model...");
    let mut model = decode(bytes)?;
    let summary = optimize_model(&mut model, settings)?;
    debug!(
        "ONNX graph: {} -> {} node(s), {} -> {} initializer(s)",
        summary.nodes_before, summary.nodes_after,
        summary.initializers_before, summary.initializers_after
    );
    Ok((model.encode_to_vec(), summary))
}
