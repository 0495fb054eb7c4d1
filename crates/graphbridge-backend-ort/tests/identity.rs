use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use graphbridge_backend_ort::OrtEngine;
use graphbridge_core::{
    bytes_to_f32, f32_to_bytes, CompileOptions, CompiledGraph, DType, Device, Engine,
    EngineProperties, ModelArtifact, Network,
};

fn identity_model() -> Option<PathBuf> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../models/identity.onnx");
    path.exists().then_some(path)
}

#[test]
fn ort_identity_cpu() -> Result<()> {
    let Some(model_path) = identity_model() else {
        eprintln!("models/identity.onnx not present, skipping");
        return Ok(());
    };

    let mut engine = OrtEngine::new();
    let mut properties = EngineProperties::new();
    properties.insert("CPU_THREADS_NUM".to_string(), "1".to_string());
    engine.configure(Device::Cpu, &properties)?;

    let network = engine.read_network(&ModelArtifact::Path(model_path))?;
    let input_spec = network.spec().inputs.first().context("missing model input spec")?;
    ensure!(input_spec.dtype == DType::F32, "expected f32 identity model");
    let batched = input_spec.dims.first().is_some_and(Option::is_none);

    let compiled = engine.compile(
        &network,
        Device::Cpu,
        &CompileOptions {
            batch_size: batched.then_some(2),
        },
    )?;
    let input = compiled.inputs().first().context("missing input binding")?.clone();
    let output = compiled.outputs().first().context("missing output binding")?.clone();

    let mut request = compiled.create_infer_request()?;
    let numel = input.shape.numel();
    let data: Vec<f32> = (0..numel).map(|i| i as f32).collect();
    let slot = request
        .input_tensor_mut(input.name.as_str())
        .context("input slot not bound")?;
    slot.data.copy_from_slice(&f32_to_bytes(&data));

    request.infer()?;
    let out = request
        .output_tensor(output.name.as_str())
        .context("output slot not bound")?;
    ensure!(out.dtype == DType::F32, "expected f32 output");
    assert_eq!(bytes_to_f32(&out.data)?, data);
    Ok(())
}

#[test]
fn unknown_property_is_rejected() {
    let mut engine = OrtEngine::new();
    let mut properties = EngineProperties::new();
    properties.insert("GPU_STREAMS".to_string(), "2".to_string());
    assert!(engine.configure(Device::Cpu, &properties).is_err());
}

#[test]
fn gpu_configuration_is_rejected() {
    let mut engine = OrtEngine::new();
    assert!(engine
        .configure(Device::Cuda { device_id: 0 }, &EngineProperties::new())
        .is_err());
}
