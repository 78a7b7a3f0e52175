//! PyTorch handler: int8 weight quantization inside a `torch.save` archive.
//!
//! # Architecture
//!
//! - [`archive`]: zip container in and out.
//! - [`pickle`]: finds storages and the tensors viewing them in `data.pkl`.
//! - [`quantize`]: snaps float storages to the int8 grid.

mod archive;
mod pickle;
mod quantize;

use std::collections::{BTreeMap, BTreeSet};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::TorchSettings;
use crate::utils::{OptimizerError, OptimizerResult};
use archive::TorchArchive;
use pickle::{StorageDtype, StorageRef, TensorRef};

/// What the quantizer did to the archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorchSummary {
    pub tensors: usize,
    pub storages: usize,
    pub storages_quantized: usize,
    pub storages_skipped: usize,
    pub elements_quantized: usize,
    pub max_abs_error: f64,
}

/// Keys of storages that qualify for quantization, in key order.
fn select_storages(
    storages: &BTreeMap<String, StorageRef>,
    tensors: &[TensorRef],
    settings: &TorchSettings,
) -> BTreeSet<String> {
    let mut weight_views: BTreeSet<&str> = BTreeSet::new();
    for tensor in tensors {
        if tensor.shape.len() >= settings.min_rank {
            weight_views.insert(tensor.storage_key.as_str());
        } else {
            debug!(
                "Skipping rank-{} view of storage {} (offset {})",
                tensor.shape.len(), tensor.storage_key, tensor.offset
            );
        }
    }

    storages
        .values()
        .filter(|s| s.dtype.element_size().is_some())
        .filter(|s| s.numel >= settings.min_elements as u64)
        .filter(|s| weight_views.contains(s.key.as_str()))
        .map(|s| s.key.clone())
        .collect()
}

/// Byte length implied by the storage's element count, if it fits in `usize`.
fn storage_bytes(storage: &StorageRef) -> Option<usize> {
    let numel = usize::try_from(storage.numel).ok()?;
    numel.checked_mul(storage.dtype.element_size()?)
}

/// Returns the rewritten archive and what changed.
pub fn optimize(bytes: &[u8], settings: &TorchSettings) -> OptimizerResult<(Vec<u8>, TorchSummary)> {
    info!("Optimizing PyTorch model...");
    let mut archive = TorchArchive::read(bytes)?;
    if !archive.is_little_endian() {
        return Err(OptimizerError::format("Big-endian torch archives are not supported"));
    }

    let scan = pickle::scan(archive.pickle()?)?;
    let selected = select_storages(&scan.storages, &scan.tensors, settings);
    debug!(
        "{} tensor(s) over {} storage(s); {} eligible for int8",
        scan.tensors.len(), scan.storages.len(), selected.len()
    );

    let mut summary = TorchSummary {
        tensors: scan.tensors.len(),
        storages: scan.storages.len(),
        storages_quantized: 0,
        storages_skipped: 0,
        elements_quantized: 0,
        max_abs_error: 0.0,
    };

    for key in &selected {
        let storage = &scan.storages[key];
        let name = archive.storage_name(key);
        let expected = storage_bytes(storage).ok_or_else(|| {
            OptimizerError::format(format!(
                "Storage {} declares {} elements, too large to address", name, storage.numel
            ))
        })?;
        let data = archive
            .storage_mut(key)
            .ok_or_else(|| OptimizerError::processing(format!("Missing storage record {}", name)))?;

        if data.len() != expected {
            warn!(
                "Storage {} holds {} bytes, expected {}; leaving it unchanged",
                name, data.len(), expected
            );
            summary.storages_skipped += 1;
            continue;
        }

        let outcome = match storage.dtype {
            StorageDtype::F32 => quantize::quantize_f32(data)?,
            StorageDtype::F64 => quantize::quantize_f64(data)?,
            StorageDtype::Other(_) => continue,
        };
        debug!(
            "Quantized {} ({} elements, scale {:.3e}, max error {:.3e})",
            name, outcome.elements, outcome.scale, outcome.max_abs_error
        );
        summary.storages_quantized += 1;
        summary.elements_quantized += outcome.elements;
        summary.max_abs_error = summary.max_abs_error.max(outcome.max_abs_error);
    }
    summary.storages_skipped += summary.storages - selected.len();

    Ok((archive.write()?, summary))
}
