//! Parameters from safetensors files.
//!
//! Floating-point tensors are widened to f32 and returned as records ready
//! for `Session::new` or `ContainerBuilder::add_record`.

use std::collections::BTreeMap;

use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use crate::desc::ParameterRecord;
use crate::format::FormatError;

/// Decode every tensor in a safetensors buffer, sorted by name.
pub fn load_safetensors(data: &[u8]) -> Result<Vec<ParameterRecord>, FormatError> {
    let tensors = SafeTensors::deserialize(data)
        .map_err(|e| FormatError::InvalidHeader(format!("safetensors parse error: {e}")))?;

    let mut records = tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            let values = view_to_f32(&name, &view)?;
            Ok(ParameterRecord::new(name, view.shape(), values))
        })
        .collect::<Result<Vec<_>, FormatError>>()?;
    records.sort_by(|a, b| a.name.cmp(&b.name));

    tracing::debug!(tensors = records.len(), "safetensors loaded");
    Ok(records)
}

/// Tensor names and shapes, without decoding any data.
pub fn inspect_safetensors(data: &[u8]) -> Result<BTreeMap<String, Vec<usize>>, FormatError> {
    let tensors = SafeTensors::deserialize(data)
        .map_err(|e| FormatError::InvalidHeader(format!("safetensors parse error: {e}")))?;
    Ok(tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| (name, view.shape().to_vec()))
        .collect())
}

fn view_to_f32(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>, FormatError> {
    let data = view.data();
    match view.dtype() {
        Dtype::F32 => Ok(bytemuck::pod_collect_to_vec::<u8, f32>(data)),
        Dtype::F16 => Ok(data
            .chunks_exact(2)
            .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()),
        Dtype::BF16 => Ok(data
            .chunks_exact(2)
            .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()),
        other => Err(FormatError::InvalidHeader(format!(
            "tensor {name}: unsupported safetensors dtype {other:?}"
        ))),
    }
}
