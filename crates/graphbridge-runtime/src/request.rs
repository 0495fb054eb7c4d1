use std::collections::HashSet;
use std::time::Instant;

use anyhow::Result;
use bytes::Bytes;
use graphbridge_core::{bytes_to_f32, BridgeError, DType, IOName, Tensor};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type InferResult = std::result::Result<InferenceResponse, BridgeError>;

#[derive(Debug)]
pub struct InferenceRequest {
    pub id: u64,
    pub model: String,
    pub inputs: Vec<(IOName, Tensor)>,
    /// Outputs to deliver; `None` delivers every output.
    pub requested_outputs: Option<Vec<IOName>>,
    pub arrived_at: Instant,
    pub resp_tx: Option<oneshot::Sender<InferResult>>,
}

impl InferenceRequest {
    pub fn new(
        id: u64,
        model: impl Into<String>,
        inputs: Vec<(IOName, Tensor)>,
    ) -> (Self, oneshot::Receiver<InferResult>) {
        let (tx, rx) = oneshot::channel();
        let req = Self {
            id,
            model: model.into(),
            inputs,
            requested_outputs: None,
            arrived_at: Instant::now(),
            resp_tx: Some(tx),
        };
        (req, rx)
    }

    pub fn with_requested_outputs(mut self, names: Vec<IOName>) -> Self {
        self.requested_outputs = Some(names);
        self
    }

    pub fn input(&self, name: &IOName) -> Option<&Tensor> {
        self.inputs.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn wants_output(&self, name: &IOName) -> bool {
        self.requested_outputs
            .as_ref()
            .map_or(true, |names| names.contains(name))
    }

    /// Structural problems that make the request unusable for any batch.
    pub fn check_well_formed(&self) -> std::result::Result<(), BridgeError> {
        if self.resp_tx.is_none() {
            return Err(BridgeError::Internal(format!(
                "request {} has no response channel",
                self.id
            )));
        }
        if self.inputs.is_empty() {
            return Err(BridgeError::Internal(format!(
                "request {} carries no inputs",
                self.id
            )));
        }
        let mut seen = HashSet::with_capacity(self.inputs.len());
        for (name, _) in &self.inputs {
            if !seen.insert(name) {
                return Err(BridgeError::Internal(format!(
                    "request {} carries input '{name}' more than once",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Answers the request directly, without a [`Response`].
    pub fn respond_with_error(&mut self, err: BridgeError) {
        if let Some(tx) = self.resp_tx.take() {
            if tx.send(Err(err)).is_err() {
                debug!(request_id = self.id, "requester went away before error delivery");
            }
        }
    }
}

/// An output slice delivered to one request.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputTensor {
    pub dtype: DType,
    pub shape: Vec<i64>,
    pub data: Bytes,
}

impl OutputTensor {
    pub fn to_f32(&self) -> Result<Vec<f32>> {
        anyhow::ensure!(self.dtype == DType::F32, "output is {}, not FP32", self.dtype);
        bytes_to_f32(&self.data)
    }
}

#[derive(Debug)]
pub struct InferenceResponse {
    pub request_id: u64,
    pub outputs: Vec<(IOName, OutputTensor)>,
    pub timings: Timings,
}

impl InferenceResponse {
    pub fn output(&self, name: &str) -> Option<&OutputTensor> {
        self.outputs
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, t)| t)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Timings {
    pub queued_us: u64,
    pub compute_us: u64,
    pub exec_us: u64,
}

/// Framework-side response, created before any fallible step of an
/// execution. Sending consumes it.
#[derive(Debug)]
pub struct Response {
    request_id: u64,
    tx: oneshot::Sender<InferResult>,
    outputs: Vec<(IOName, OutputTensor)>,
}

impl Response {
    /// Takes the request's response channel. Fails when the channel was
    /// already taken or the requester is gone.
    pub fn new(request: &mut InferenceRequest) -> std::result::Result<Self, BridgeError> {
        let tx = request.resp_tx.take().ok_or_else(|| {
            BridgeError::Internal(format!("request {} has no response channel", request.id))
        })?;
        if tx.is_closed() {
            return Err(BridgeError::Unavailable(format!(
                "requester of request {} is no longer listening",
                request.id
            )));
        }
        Ok(Self {
            request_id: request.id,
            tx,
            outputs: Vec::new(),
        })
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn outputs(&self) -> &[(IOName, OutputTensor)] {
        &self.outputs
    }

    pub fn add_output(&mut self, name: IOName, tensor: OutputTensor) {
        self.outputs.push((name, tensor));
    }

    /// Returns false when the requester dropped its receiver.
    pub fn send(self, timings: Timings) -> bool {
        let delivered = self
            .tx
            .send(Ok(InferenceResponse {
                request_id: self.request_id,
                outputs: self.outputs,
                timings,
            }))
            .is_ok();
        if !delivered {
            warn!(request_id = self.request_id, "failed to send response");
        }
        delivered
    }

    pub fn send_error(self, err: BridgeError) {
        if self.tx.send(Err(err)).is_err() {
            warn!(request_id = self.request_id, "failed to send error response");
        }
    }
}

/// Fails every response still held, leaving all slots empty. Returns how
/// many responses were answered.
pub fn respond_all_with_error(responses: &mut [Option<Response>], err: &BridgeError) -> usize {
    let mut answered = 0;
    for slot in responses.iter_mut() {
        if let Some(response) = slot.take() {
            response.send_error(err.clone());
            answered += 1;
        }
    }
    answered
}

/// Fails every request through its own channel; used before responses exist.
pub fn requests_respond_with_error(requests: &mut [InferenceRequest], err: &BridgeError) {
    for request in requests.iter_mut() {
        request.respond_with_error(err.clone());
    }
}
