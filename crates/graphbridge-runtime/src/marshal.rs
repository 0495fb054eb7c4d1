//! Moves request input buffers into the tensors bound inside an engine
//! infer request.

use graphbridge_core::{
    BridgeError, BridgeResult, EngineInferRequest, EngineTensor, IOName, MemoryType, Shape,
    Tensor, TensorView,
};
use tracing::trace;

use crate::{BatchPlan, BindingTable, InferenceRequest};

/// Copies every input of the batch into `infer_request`.
///
/// The first request is the representative: its input names, dtypes and
/// trailing dims define the batch. Requests are laid out back to back in
/// request order and padding rows, when planned, are zero-filled after the
/// last request. Returns the marshalled input names.
pub fn marshal_inputs(
    bindings: &BindingTable,
    plan: &BatchPlan,
    max_batch_size: usize,
    requests: &[InferenceRequest],
    infer_request: &mut dyn EngineInferRequest,
    scratch: &mut Vec<u8>,
) -> BridgeResult<Vec<IOName>> {
    let representative = requests
        .first()
        .ok_or_else(|| BridgeError::Internal("no requests to marshal".to_string()))?;

    // a bound slot nobody writes would still hold the previous call's data
    if let Some(missing) = bindings
        .input_names()
        .find(|bound| representative.inputs.iter().all(|(n, _)| n.as_str() != *bound))
    {
        return Err(BridgeError::InvalidArgument(format!(
            "request {} is missing input '{missing}' required by the model",
            representative.id
        )));
    }

    let mut names = Vec::with_capacity(representative.inputs.len());
    for (name, rep_tensor) in &representative.inputs {
        let binding = bindings.input(name.as_str())?;

        let batched_shape = if max_batch_size != 0 {
            rep_tensor.desc.shape.with_leading(plan.padded_batch_size())
        } else {
            rep_tensor.desc.shape.clone()
        };
        let dtype = rep_tensor.desc.dtype;
        let expected_bytes = batched_shape
            .checked_byte_size(dtype)
            .ok_or_else(|| too_large(name, &batched_shape))?;

        let data = gather_input(name, rep_tensor, plan, max_batch_size, requests, scratch)?;
        if data.len() != expected_bytes {
            return Err(BridgeError::Unsupported(format!(
                "expected {expected_bytes} bytes of data in input buffer, got {} bytes.",
                data.len()
            )));
        }

        let view = TensorView {
            dtype,
            shape: batched_shape,
            data,
        };
        let dest = infer_request
            .input_tensor_mut(binding.name.as_str())
            .ok_or_else(|| {
                BridgeError::Internal(format!(
                    "infer request holds no tensor for bound input '{name}'"
                ))
            })?;
        copy_into_bound(name, &view, dest)?;
        trace!(input = %name, bytes = expected_bytes, "marshalled input");
        names.push(name.clone());
    }
    Ok(names)
}

/// Requires dtype, shape and byte-size equality, then copies.
pub fn copy_into_bound(
    name: &IOName,
    view: &TensorView<'_>,
    dest: &mut EngineTensor,
) -> BridgeResult<()> {
    if view.dtype != dest.dtype || view.shape != dest.shape || view.byte_size() != dest.byte_size()
    {
        return Err(BridgeError::Internal(format!(
            "source and destination tensors shapes and byte sizes are expected to be equal \
             for data copying: input '{name}' is {} {} ({} bytes), bound slot is {} {} ({} bytes)",
            view.dtype,
            view.shape,
            view.byte_size(),
            dest.dtype,
            dest.shape,
            dest.byte_size()
        )));
    }
    dest.data.copy_from_slice(view.data);
    Ok(())
}

/// Contiguous CPU buffer holding input `name` for the whole batch. A single
/// unpadded request is returned in place; anything else is gathered into
/// `scratch`.
fn gather_input<'a>(
    name: &IOName,
    representative: &Tensor,
    plan: &BatchPlan,
    max_batch_size: usize,
    requests: &'a [InferenceRequest],
    scratch: &'a mut Vec<u8>,
) -> BridgeResult<&'a [u8]> {
    let dtype = representative.desc.dtype;
    let mut parts: Vec<&'a [u8]> = Vec::with_capacity(requests.len());

    for (idx, request) in requests.iter().enumerate() {
        let tensor = request.input(name).ok_or_else(|| {
            BridgeError::InvalidArgument(format!(
                "request {} is missing input '{name}'",
                request.id
            ))
        })?;

        if let MemoryType::Gpu { device_id } = tensor.memory_type() {
            return Err(BridgeError::Unsupported(format!(
                "failed to get input buffer '{name}' in CPU memory (request {} offered gpu:{device_id})",
                request.id
            )));
        }
        if tensor.desc.dtype != dtype {
            return Err(BridgeError::InvalidArgument(format!(
                "input '{name}' of request {} is {}, expected {dtype}",
                request.id, tensor.desc.dtype
            )));
        }
        check_row_shape(name, request.id, &tensor.desc.shape, representative, plan, idx, max_batch_size)?;

        let bytes = tensor
            .storage
            .cpu_bytes()
            .ok_or_else(|| {
                BridgeError::Unsupported(format!("failed to get input buffer '{name}' in CPU memory"))
            })?;
        let expected = tensor
            .desc
            .shape
            .checked_byte_size(dtype)
            .ok_or_else(|| too_large(name, &tensor.desc.shape))?;
        if bytes.len() != expected {
            return Err(BridgeError::Unsupported(format!(
                "expected {expected} bytes of data in input buffer, got {} bytes.",
                bytes.len()
            )));
        }
        parts.push(bytes.as_ref());
    }

    if parts.len() == 1 && plan.batch_pad_size == 0 {
        return Ok(parts[0]);
    }

    let row_bytes = row_bytes(representative, max_batch_size);
    scratch.clear();
    scratch.reserve(parts.iter().map(|p| p.len()).sum::<usize>() + plan.batch_pad_size * row_bytes);
    for part in parts {
        scratch.extend_from_slice(part);
    }
    // padding rows always trail the real rows
    scratch.resize(scratch.len() + plan.batch_pad_size * row_bytes, 0);
    Ok(scratch.as_slice())
}

fn too_large(name: &IOName, shape: &Shape) -> BridgeError {
    BridgeError::InvalidArgument(format!("input '{name}' with shape {shape} is too large"))
}

fn check_row_shape(
    name: &IOName,
    request_id: u64,
    shape: &Shape,
    representative: &Tensor,
    plan: &BatchPlan,
    idx: usize,
    max_batch_size: usize,
) -> BridgeResult<()> {
    let rep = representative.desc.shape.dims();
    let dims = shape.dims();
    let consistent = if max_batch_size == 0 {
        dims == rep
    } else {
        dims.len() == rep.len()
            && !dims.is_empty()
            && dims[1..] == rep[1..]
            && dims[0] == plan.contributions[idx]
    };
    if consistent {
        Ok(())
    } else {
        Err(BridgeError::InvalidArgument(format!(
            "input '{name}' of request {request_id} has shape {shape}, which does not fit \
             the batch (representative shape {}, {} rows expected)",
            representative.desc.shape,
            if max_batch_size == 0 { 1 } else { plan.contributions[idx] }
        )))
    }
}

fn row_bytes(representative: &Tensor, max_batch_size: usize) -> usize {
    let dims = representative.desc.shape.dims();
    let per_row: usize = if max_batch_size == 0 {
        dims.iter().product()
    } else {
        dims.iter().skip(1).product()
    };
    per_row * representative.desc.dtype.byte_size()
}
