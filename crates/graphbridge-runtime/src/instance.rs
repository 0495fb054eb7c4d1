use std::sync::Arc;
use std::time::Instant;

use graphbridge_core::{BridgeError, BridgeResult, Device, Engine, EngineInferRequest, IOName};
use tracing::{debug, error, warn};

use crate::{
    marshal_inputs, reject_unknown_requested_outputs, requests_respond_with_error,
    respond_all_with_error, run_inference, split_outputs, BatchAccumulator, BatchPlan,
    BindingTable, ComputeSpan, ExecTimestamps, InferenceRequest, InstanceLoader,
    InstanceSettings, ModelConfig, Response, StatsReporter, Timings, TracingStats,
};

/// Outcome of one [`ModelInstance::execute`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub requests: usize,
    pub total_batch_size: usize,
    pub batch_pad_size: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// True once the engine was invoked.
    pub inferred: bool,
    /// Error that failed the whole batch, if any.
    pub error: Option<BridgeError>,
}

/// A compiled graph bound to one inference request, ready to execute
/// batches. Only [`InstanceLoader`] builds one, so an instance always
/// completed every lifecycle step.
pub struct ModelInstance<E: Engine> {
    name: String,
    device: Device,
    config: Arc<ModelConfig>,
    engine: E,
    compiled: Arc<E::Compiled>,
    infer_request: Box<dyn EngineInferRequest>,
    bindings: BindingTable,
    accumulator: BatchAccumulator,
    output_names: Vec<IOName>,
    scratch: Vec<u8>,
    stats: Arc<dyn StatsReporter>,
}

impl<E: Engine> ModelInstance<E> {
    pub fn create(
        engine: E,
        config: Arc<ModelConfig>,
        settings: InstanceSettings,
    ) -> BridgeResult<Self> {
        InstanceLoader::new(engine, config, settings)?.load()
    }

    pub(crate) fn from_parts(
        name: String,
        device: Device,
        config: Arc<ModelConfig>,
        engine: E,
        compiled: Arc<E::Compiled>,
        infer_request: Box<dyn EngineInferRequest>,
        bindings: BindingTable,
    ) -> Self {
        let accumulator = BatchAccumulator::new(
            config.name.clone(),
            config.max_batch_size,
            config.backend_parameters().enable_batch_padding,
        );
        let output_names = config.output_names();
        Self {
            name,
            device,
            config,
            engine,
            compiled,
            infer_request,
            bindings,
            accumulator,
            output_names,
            scratch: Vec::new(),
            stats: Arc::new(TracingStats),
        }
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsReporter>) -> Self {
        self.stats = stats;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn compiled(&self) -> &Arc<E::Compiled> {
        &self.compiled
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    pub fn infer_request(&self) -> &dyn EngineInferRequest {
        &*self.infer_request
    }

    /// Runs one batch to completion. Every request that can still be
    /// answered is answered before this returns; failures are reported
    /// through the responses and the summary, never to the caller.
    pub fn execute(&mut self, mut requests: Vec<InferenceRequest>) -> ExecutionSummary {
        let exec_start = Instant::now();
        let mut summary = ExecutionSummary {
            requests: requests.len(),
            ..Default::default()
        };
        debug!(instance = %self.name, requests = requests.len(), "executing batch");

        if let Some(err) = requests.iter().find_map(|r| r.check_well_formed().err()) {
            error!(instance = %self.name, error = %err, "malformed request in batch");
            requests_respond_with_error(&mut requests, &err);
            summary.failed = requests.len();
            summary.error = Some(err);
            return summary;
        }

        let mut responses: Vec<Option<Response>> = requests
            .iter_mut()
            .map(|request| match Response::new(request) {
                Ok(response) => Some(response),
                Err(err) => {
                    error!(request_id = request.id, error = %err, "failed to create response");
                    None
                }
            })
            .collect();

        let mut compute: Option<ComputeSpan> = None;
        let plan = match self.run_batch(&requests, &mut responses, &mut compute) {
            Ok(plan) => plan,
            Err(err) => {
                error!(instance = %self.name, error = %err, "batch failed");
                respond_all_with_error(&mut responses, &err);
                summary.error = Some(err);
                None
            }
        };
        summary.inferred = compute.is_some();

        let mut success = vec![false; requests.len()];
        let Some(plan) = plan else {
            if summary.error.is_some() {
                summary.failed = summary.requests;
                self.report(&requests, &success, exec_start, compute, None);
            }
            return summary;
        };
        summary.total_batch_size = plan.total_batch_size;
        summary.batch_pad_size = plan.batch_pad_size;

        let compute_us = compute.map_or(0, |c| c.end.duration_since(c.start).as_micros() as u64);
        for ((request, slot), ok) in requests.iter().zip(responses.iter_mut()).zip(success.iter_mut()) {
            if let Some(response) = slot.take() {
                *ok = response.send(Timings {
                    queued_us: exec_start.saturating_duration_since(request.arrived_at).as_micros() as u64,
                    compute_us,
                    exec_us: exec_start.elapsed().as_micros() as u64,
                });
            }
        }
        summary.succeeded = success.iter().filter(|ok| **ok).count();
        summary.failed = summary.requests - summary.succeeded;
        debug!(
            instance = %self.name,
            batch = plan.total_batch_size,
            pad = plan.batch_pad_size,
            succeeded = summary.succeeded,
            "batch complete"
        );

        self.report(&requests, &success, exec_start, compute, Some(&plan));
        summary
    }

    /// The fallible part of an execution. `Ok(None)` means the batch holds
    /// no rows and the engine was not called.
    fn run_batch(
        &mut self,
        requests: &[InferenceRequest],
        responses: &mut [Option<Response>],
        compute: &mut Option<ComputeSpan>,
    ) -> BridgeResult<Option<BatchPlan>> {
        let plan = self.accumulator.accumulate(requests)?;
        if plan.is_empty() {
            debug!(instance = %self.name, "batch holds no rows, skipping");
            return Ok(None);
        }

        let rejected = reject_unknown_requested_outputs(&self.output_names, requests, responses);
        if rejected > 0 {
            warn!(instance = %self.name, rejected, "requests asked for unknown outputs");
        }

        let max_batch_size = self.accumulator.max_batch_size();
        marshal_inputs(
            &self.bindings,
            &plan,
            max_batch_size,
            requests,
            &mut *self.infer_request,
            &mut self.scratch,
        )?;

        let (span, result) = run_inference(&mut *self.infer_request);
        *compute = Some(span);
        result?;

        split_outputs(
            &self.bindings,
            &self.output_names,
            &plan,
            max_batch_size,
            requests,
            responses,
            &*self.infer_request,
        )?;
        Ok(Some(plan))
    }

    fn report(
        &self,
        requests: &[InferenceRequest],
        success: &[bool],
        exec_start: Instant,
        compute: Option<ComputeSpan>,
        plan: Option<&BatchPlan>,
    ) {
        let exec_end = Instant::now();
        let (compute_start, compute_end) = compute.map_or((exec_end, exec_end), |c| (c.start, c.end));
        let ts = ExecTimestamps {
            exec_start,
            compute_start,
            compute_end,
            exec_end,
        };
        for (request, ok) in requests.iter().zip(success) {
            self.stats.report_request(&self.name, request.id, *ok, &ts);
        }
        if let Some(plan) = plan {
            if success.iter().any(|ok| *ok) {
                self.stats.report_batch(&self.name, plan.total_batch_size, &ts);
            }
        }
    }
}
