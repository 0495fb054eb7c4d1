use graphbridge_core::Engine;

use crate::{ExecutionSummary, InferenceRequest, ModelInstance};

/// Object-safe worker model interface.
/// Keep it synchronous; the worker thread calls it directly.
pub trait WorkerModel: Send {
    fn name(&self) -> &str;
    fn execute(&mut self, requests: Vec<InferenceRequest>) -> ExecutionSummary;
}

impl<E: Engine> WorkerModel for ModelInstance<E> {
    fn name(&self) -> &str {
        ModelInstance::name(self)
    }

    fn execute(&mut self, requests: Vec<InferenceRequest>) -> ExecutionSummary {
        ModelInstance::execute(self, requests)
    }
}
