//! Splits batched output tensors back into per-request responses.

use bytes::Bytes;
use graphbridge_core::{BridgeError, BridgeResult, EngineInferRequest, IOName};
use tracing::warn;

use crate::{BatchPlan, BindingTable, InferenceRequest, OutputTensor, Response};

/// Stages output slices and attaches them to responses only on
/// [`OutputResponder::finalize`], so a failure part-way through the outputs
/// leaves every response untouched.
pub struct OutputResponder<'a> {
    responses: &'a mut [Option<Response>],
    pending: Vec<(usize, IOName, OutputTensor)>,
}

impl<'a> OutputResponder<'a> {
    pub fn new(responses: &'a mut [Option<Response>]) -> Self {
        Self {
            responses,
            pending: Vec::new(),
        }
    }

    pub fn stage(&mut self, idx: usize, name: IOName, tensor: OutputTensor) {
        self.pending.push((idx, name, tensor));
    }

    /// Attaches staged outputs; returns how many were attached.
    pub fn finalize(self) -> usize {
        let mut attached = 0;
        for (idx, name, tensor) in self.pending {
            if let Some(Some(response)) = self.responses.get_mut(idx) {
                response.add_output(name, tensor);
                attached += 1;
            }
        }
        attached
    }
}

/// Fails, on their own responses, the requests that ask for an output the
/// model does not declare. Siblings are unaffected.
pub fn reject_unknown_requested_outputs(
    output_names: &[IOName],
    requests: &[InferenceRequest],
    responses: &mut [Option<Response>],
) -> usize {
    let mut rejected = 0;
    for (request, slot) in requests.iter().zip(responses.iter_mut()) {
        let Some(requested) = &request.requested_outputs else {
            continue;
        };
        let Some(unknown) = requested.iter().find(|n| !output_names.contains(n)) else {
            continue;
        };
        if let Some(response) = slot.take() {
            warn!(request_id = request.id, output = %unknown, "unknown requested output");
            response.send_error(BridgeError::InvalidArgument(format!(
                "unexpected inference output '{unknown}' for request {}",
                request.id
            )));
            rejected += 1;
        }
    }
    rejected
}

/// Reads each declared output, resolved through `bindings`, from
/// `infer_request` and stages per-request
/// row slices. Padding rows are the trailing rows of every output and are
/// never delivered.
pub fn split_outputs(
    bindings: &BindingTable,
    output_names: &[IOName],
    plan: &BatchPlan,
    max_batch_size: usize,
    requests: &[InferenceRequest],
    responses: &mut [Option<Response>],
    infer_request: &dyn EngineInferRequest,
) -> BridgeResult<usize> {
    let mut responder = OutputResponder::new(responses);

    for name in output_names {
        let binding = bindings.output(name.as_str())?;
        let tensor = infer_request.output_tensor(binding.name.as_str()).ok_or_else(|| {
            BridgeError::Internal(format!("output '{name}' is not available in the infer request"))
        })?;
        let shape = tensor.shape.to_signed();
        let expected_bytes = tensor.shape.checked_byte_size(tensor.dtype);
        if expected_bytes != Some(tensor.byte_size()) {
            return Err(BridgeError::Internal(format!(
                "output '{name}' holds {} bytes, which does not match shape {}",
                tensor.byte_size(),
                tensor.shape
            )));
        }

        if max_batch_size == 0 {
            // a single request owns the whole tensor
            for (idx, request) in requests.iter().enumerate() {
                if request.wants_output(name) {
                    responder.stage(
                        idx,
                        name.clone(),
                        OutputTensor {
                            dtype: tensor.dtype,
                            shape: shape.clone(),
                            data: Bytes::copy_from_slice(&tensor.data),
                        },
                    );
                }
            }
            continue;
        }

        let rows = validate_output_batch(name, &shape, plan, max_batch_size)?;
        let row_bytes = tensor.byte_size() / rows;
        for (idx, request) in requests.iter().enumerate() {
            if !request.wants_output(name) {
                continue;
            }
            let count = plan.contributions[idx];
            let start = plan.offset_of(idx) * row_bytes;
            let end = start + count * row_bytes;
            let mut slice_shape = shape.clone();
            slice_shape[0] = count as i64;
            responder.stage(
                idx,
                name.clone(),
                OutputTensor {
                    dtype: tensor.dtype,
                    shape: slice_shape,
                    data: Bytes::copy_from_slice(&tensor.data[start..end]),
                },
            );
        }
        let delivered = plan.offset_of(requests.len());
        debug_assert_eq!(delivered, plan.total_batch_size);
        // anything past the delivered rows is padding
        debug_assert!(rows - delivered == plan.batch_pad_size || rows == delivered);
    }

    Ok(responder.finalize())
}

/// Leading dim of an output must be the padded batch or the real batch.
fn validate_output_batch(
    name: &IOName,
    shape: &[i64],
    plan: &BatchPlan,
    max_batch_size: usize,
) -> BridgeResult<usize> {
    let lead = shape.first().copied().ok_or_else(|| {
        BridgeError::Internal(format!("output '{name}' has no batch dimension"))
    })?;
    let unpadded = max_batch_size - plan.batch_pad_size;
    if lead != max_batch_size as i64 && lead != unpadded as i64 {
        return Err(BridgeError::Internal(format!(
            "expected the batch size of model output '{name}' to be {max_batch_size}, got {lead}"
        )));
    }
    Ok(lead as usize)
}
