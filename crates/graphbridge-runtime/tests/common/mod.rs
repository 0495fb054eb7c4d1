#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use graphbridge_backend_ref::{EngineProbe, GraphDef, ReferenceEngine};
use graphbridge_core::{DType, Device, IOName, ModelArtifact, Tensor};
use graphbridge_runtime::{
    InferResult, InferenceRequest, InstanceSettings, ModelConfig, ModelInstance,
};
use serde_json::json;
use tokio::sync::oneshot;

pub const MODEL: &str = "identity";

/// Configuration of a single FP32 input `INPUT0` echoed to `OUTPUT0`.
pub fn identity_config(max_batch_size: usize, padding: bool, dims: &[i64]) -> Arc<ModelConfig> {
    let mut parameters = serde_json::Map::new();
    if padding {
        parameters.insert(
            "ENABLE_BATCH_PADDING".to_string(),
            json!({ "string_value": "yes" }),
        );
    }
    let raw = json!({
        "name": MODEL,
        "max_batch_size": max_batch_size,
        "input": [{ "name": "INPUT0", "data_type": "TYPE_FP32", "dims": dims }],
        "output": [{ "name": "OUTPUT0", "data_type": "TYPE_FP32", "dims": dims }],
        "parameters": parameters,
    });
    Arc::new(ModelConfig::from_json(&raw.to_string()).expect("valid test configuration"))
}

/// Network dims as the engine sees them: a dynamic batch axis in front
/// when the model batches.
pub fn network_dims(batched: bool, dims: &[i64]) -> Vec<i64> {
    let mut out = Vec::with_capacity(dims.len() + 1);
    if batched {
        out.push(-1);
    }
    out.extend_from_slice(dims);
    out
}

pub fn identity_artifact(batched: bool, dims: &[i64]) -> Result<ModelArtifact> {
    let def = GraphDef::identity("INPUT0", "OUTPUT0", DType::F32, &network_dims(batched, dims));
    Ok(ModelArtifact::inline(MODEL, def.to_json()?))
}

pub fn identity_instance(
    max_batch_size: usize,
    padding: bool,
    dims: &[i64],
) -> Result<(ModelInstance<ReferenceEngine>, EngineProbe)> {
    let probe = EngineProbe::default();
    let engine = ReferenceEngine::with_probe(probe.clone());
    let config = identity_config(max_batch_size, padding, dims);
    let settings = InstanceSettings::new(
        "identity_0",
        Device::Cpu,
        identity_artifact(max_batch_size > 0, dims)?,
    );
    let instance = ModelInstance::create(engine, config, settings)?;
    Ok((instance, probe))
}

pub fn request(
    id: u64,
    shape: &[usize],
    values: &[f32],
) -> (InferenceRequest, oneshot::Receiver<InferResult>) {
    InferenceRequest::new(
        id,
        MODEL,
        vec![(IOName::from("INPUT0"), Tensor::from_f32(shape, values))],
    )
}

/// The response already delivered on `rx`.
pub fn delivered(rx: &mut oneshot::Receiver<InferResult>) -> InferResult {
    rx.try_recv().expect("response should have been delivered")
}
