//! Batch-size accumulation and padding decisions.

use graphbridge_core::{BridgeError, BridgeResult};

use crate::InferenceRequest;

/// How the requests of one execution map onto the compiled batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchPlan {
    /// Rows each request occupies, in request order.
    pub contributions: Vec<usize>,
    pub total_batch_size: usize,
    /// Zero-filled rows appended after the last request.
    pub batch_pad_size: usize,
}

impl BatchPlan {
    pub fn is_empty(&self) -> bool {
        self.total_batch_size == 0
    }

    /// Rows the engine sees, padding included.
    pub fn padded_batch_size(&self) -> usize {
        self.total_batch_size + self.batch_pad_size
    }

    /// Row offset of request `idx` inside the batch.
    pub fn offset_of(&self, idx: usize) -> usize {
        self.contributions[..idx].iter().sum()
    }
}

#[derive(Clone, Debug)]
pub struct BatchAccumulator {
    model: String,
    max_batch_size: usize,
    enable_padding: bool,
}

impl BatchAccumulator {
    pub fn new(model: impl Into<String>, max_batch_size: usize, enable_padding: bool) -> Self {
        Self {
            model: model.into(),
            max_batch_size,
            enable_padding,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Rows `request` adds to a batch: the leading dim of its first input,
    /// or 1 for models without a batch dimension.
    pub fn contribution(&self, request: &InferenceRequest) -> BridgeResult<usize> {
        if self.max_batch_size == 0 {
            return Ok(1);
        }
        let (name, tensor) = request.inputs.first().ok_or_else(|| {
            BridgeError::InvalidArgument(format!("request {} has no inputs", request.id))
        })?;
        tensor.desc.shape.leading().ok_or_else(|| {
            BridgeError::InvalidArgument(format!(
                "input '{name}' of request {} has no batch dimension",
                request.id
            ))
        })
    }

    pub fn accumulate(&self, requests: &[InferenceRequest]) -> BridgeResult<BatchPlan> {
        let contributions = requests
            .iter()
            .map(|r| self.contribution(r))
            .collect::<BridgeResult<Vec<_>>>()?;
        let total_batch_size = contributions
            .iter()
            .try_fold(0usize, |acc, c| acc.checked_add(*c))
            .ok_or_else(|| {
                BridgeError::Internal(format!(
                    "batch size for '{}' overflows, max allowed is {}",
                    self.model, self.max_batch_size
                ))
            })?;
        let mut plan = BatchPlan {
            contributions,
            total_batch_size,
            batch_pad_size: 0,
        };

        if total_batch_size == 0 {
            return Ok(plan);
        }

        let max = self.max_batch_size;
        if max == 0 {
            if total_batch_size != 1 {
                return Err(self.exceeded(total_batch_size));
            }
            return Ok(plan);
        }

        if total_batch_size > max {
            return Err(self.exceeded(total_batch_size));
        }
        if total_batch_size < max {
            if !self.enable_padding {
                return Err(BridgeError::Internal(format!(
                    "expected requests with batch size '{max}', got '{total_batch_size}'... \
                     this error can be avoided by setting 'ENABLE_BATCH_PADDING' parameter \
                     in model configuration to 'YES' at a performance cost."
                )));
            }
            plan.batch_pad_size = max - total_batch_size;
        }
        Ok(plan)
    }

    fn exceeded(&self, total: usize) -> BridgeError {
        BridgeError::Internal(format!(
            "batch size {total} for '{}', max allowed is {}",
            self.model, self.max_batch_size
        ))
    }
}
