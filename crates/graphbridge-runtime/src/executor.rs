use std::time::Instant;

use graphbridge_core::{BridgeError, BridgeResult, EngineInferRequest};

/// Start and end of the engine call.
#[derive(Clone, Copy, Debug)]
pub struct ComputeSpan {
    pub start: Instant,
    pub end: Instant,
}

/// Runs the bound graph exactly once. Blocks the calling thread until the
/// engine returns; any failure fails the whole batch.
pub fn run_inference(infer_request: &mut dyn EngineInferRequest) -> (ComputeSpan, BridgeResult<()>) {
    let start = Instant::now();
    let result = infer_request
        .infer()
        .map_err(|e| BridgeError::engine("running inference", e));
    let end = Instant::now();
    (ComputeSpan { start, end }, result)
}
