//! Symmetric per-storage int8 weight quantization.
//!
//! Values are snapped to the int8 grid `q * scale` with
//! `scale = max|w| / 127`, and written back in their original float type so
//! the checkpoint keeps loading with `torch.load`.

use crate::utils::{OptimizerError, OptimizerResult};

const QMAX: f64 = 127.0;

/// Outcome of quantizing one storage.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QuantOutcome {
    pub elements: usize,
    pub scale: f64,
    pub max_abs_error: f64,
}

fn scale_for(max_abs: f64) -> Option<f64> {
    (max_abs.is_finite() && max_abs > 0.0).then(|| max_abs / QMAX)
}

fn snap(v: f64, scale: f64) -> f64 {
    (v / scale).round().clamp(-QMAX, QMAX) * scale
}

/// Quantizes little-endian `f32` data in place.
pub fn quantize_f32(data: &mut [u8]) -> OptimizerResult<QuantOutcome> {
    if data.len() % 4 != 0 {
        return Err(OptimizerError::format(format!(
            "float32 storage of {} bytes is not a whole number of elements", data.len()
        )));
    }

    let read = |c: &[u8]| f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
    let max_abs = data
        .chunks_exact(4)
        .map(read)
        .filter(|v| v.is_finite())
        .fold(0.0f32, |m, v| m.max(v.abs()));

    let elements = data.len() / 4;
    let Some(scale) = scale_for(max_abs as f64) else {
        return Ok(QuantOutcome { elements, ..Default::default() });
    };

    let mut max_abs_error = 0.0f64;
    for chunk in data.chunks_exact_mut(4) {
        let v = read(chunk);
        if !v.is_finite() {
            continue;
        }
        let q = snap(v as f64, scale) as f32;
        max_abs_error = max_abs_error.max((v - q).abs() as f64);
        chunk.copy_from_slice(&q.to_le_bytes());
    }

    Ok(QuantOutcome { elements, scale, max_abs_error })
}

/// Quantizes little-endian `f64` data in place.
pub fn quantize_f64(data: &mut [u8]) -> OptimizerResult<QuantOutcome> {
    if data.len() % 8 != 0 {
        return Err(OptimizerError::format(format!(
            "float64 storage of {} bytes is not a whole number of elements", data.len()
        )));
    }

    let read = |c: &[u8]| {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(c);
        f64::from_le_bytes(arr)
    };
    let max_abs = data
        .chunks_exact(8)
        .map(read)
        .filter(|v| v.is_finite())
        .fold(0.0f64, |m, v| m.max(v.abs()));

    let elements = data.len() / 8;
    let Some(scale) = scale_for(max_abs) else {
        return Ok(QuantOutcome { elements, ..Default::default() });
    };

    let mut max_abs_error = 0.0f64;
    for chunk in data.chunks_exact_mut(8) {
        let v = read(chunk);
        if !v.is_finite() {
            continue;
        }
        let q = snap(v, scale);
        max_abs_error = max_abs_error.max((v - q).abs());
        chunk.copy_from_slice(&q.to_le_bytes());
    }

    Ok(QuantOutcome { elements, scale, max_abs_error })
}
