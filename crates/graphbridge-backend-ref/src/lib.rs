//! Reference CPU engine.
//!
//! Networks are small JSON documents naming typed inputs and outputs, where
//! every output is one elementwise op over the inputs:
//!
//! ```json
//! {
//!   "name": "doubler",
//!   "inputs": [{ "name": "INPUT0", "data_type": "FP32", "dims": [-1, 4] }],
//!   "outputs": [{ "name": "OUTPUT0", "op": { "scale": { "input": "INPUT0", "factor": 2.0 } } }]
//! }
//! ```
//!
//! A leading `-1` is resolved to the compile-time batch size; any other
//! dynamic dim is rejected at compile time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use graphbridge_core::{
    BackendCapabilities, BindingDesc, CompileOptions, CompiledGraph, DType, Device, Engine,
    EngineInferRequest, EngineProperties, EngineTensor, IOName, ModelArtifact, ModelSpec, Network,
    Shape, TensorSpec,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

const SUPPORTED_PROPERTIES: &[&str] = &[
    "CPU_THREADS_NUM",
    "ENFORCE_BF16",
    "CPU_BIND_THREAD",
    "CPU_THROUGHPUT_STREAMS",
];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphDef {
    pub name: String,
    pub inputs: Vec<IoDef>,
    pub outputs: Vec<OutputDef>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IoDef {
    pub name: String,
    pub data_type: String,
    pub dims: Vec<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputDef {
    pub name: String,
    pub op: Op,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Identity { input: String },
    Scale { input: String, factor: f32 },
    Add { lhs: String, rhs: String },
}

impl Op {
    /// The input whose dtype and shape the output inherits.
    fn primary(&self) -> &str {
        match self {
            Op::Identity { input } | Op::Scale { input, .. } => input,
            Op::Add { lhs, .. } => lhs,
        }
    }

    fn operands(&self) -> Vec<&str> {
        match self {
            Op::Identity { input } | Op::Scale { input, .. } => vec![input],
            Op::Add { lhs, rhs } => vec![lhs, rhs],
        }
    }

    fn requires_f32(&self) -> bool {
        !matches!(self, Op::Identity { .. })
    }
}

impl GraphDef {
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context("failed to parse reference graph definition")
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to encode reference graph definition")
    }

    /// Single input, single output identity graph.
    pub fn identity(input: &str, output: &str, dtype: DType, dims: &[i64]) -> Self {
        Self {
            name: "identity".to_string(),
            inputs: vec![IoDef {
                name: input.to_string(),
                data_type: dtype.as_str().to_string(),
                dims: dims.to_vec(),
            }],
            outputs: vec![OutputDef {
                name: output.to_string(),
                op: Op::Identity {
                    input: input.to_string(),
                },
            }],
        }
    }
}

/// Observes and steers a [`ReferenceEngine`] from tests and harnesses.
#[derive(Clone, Debug, Default)]
pub struct EngineProbe {
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl EngineProbe {
    pub fn infer_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes every subsequent `infer` fail until reset.
    pub fn fail_inference(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct ReferenceEngine {
    properties: EngineProperties,
    probe: EngineProbe,
}

impl ReferenceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose compiled graphs report into `probe`.
    pub fn with_probe(probe: EngineProbe) -> Self {
        Self {
            properties: EngineProperties::new(),
            probe,
        }
    }

    pub fn probe(&self) -> EngineProbe {
        self.probe.clone()
    }

    pub fn properties(&self) -> &EngineProperties {
        &self.properties
    }
}

pub struct ReferenceNetwork {
    def: GraphDef,
    spec: ModelSpec,
}

impl ReferenceNetwork {
    pub fn from_def(def: GraphDef) -> Result<Self> {
        let spec = build_model_spec(&def)?;
        Ok(Self { def, spec })
    }
}

impl Network for ReferenceNetwork {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }
}

pub struct ReferenceCompiled {
    inputs: Vec<BindingDesc>,
    outputs: Vec<BindingDesc>,
    ops: Arc<[(String, Op)]>,
    probe: EngineProbe,
}

impl Engine for ReferenceEngine {
    type Network = ReferenceNetwork;
    type Compiled = ReferenceCompiled;

    fn name(&self) -> &'static str {
        "reference"
    }

    fn default_model_filename(&self) -> &'static str {
        "model.json"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_dynamic_shapes: false,
        }
    }

    fn read_network(&self, artifact: &ModelArtifact) -> Result<Self::Network> {
        let raw = artifact.load_bytes()?;
        let def = GraphDef::from_json(&raw)?;
        debug!(graph = %def.name, "read reference network");
        ReferenceNetwork::from_def(def)
    }

    fn configure(&mut self, device: Device, properties: &EngineProperties) -> Result<()> {
        ensure!(
            device.is_cpu(),
            "reference engine cannot be configured for device {device}"
        );
        for (key, value) in properties {
            if !SUPPORTED_PROPERTIES.contains(&key.as_str()) {
                bail!("reference engine does not support property '{key}'");
            }
            self.properties.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn compile(
        &self,
        network: &Self::Network,
        device: Device,
        options: &CompileOptions,
    ) -> Result<Self::Compiled> {
        ensure!(device.is_cpu(), "reference engine only runs on CPU, got {device}");

        let mut inputs = Vec::with_capacity(network.def.inputs.len());
        for (index, io) in network.def.inputs.iter().enumerate() {
            let dtype: DType = io.data_type.parse()?;
            let shape = resolve_dims(&io.name, &io.dims, options.batch_size)?;
            inputs.push(BindingDesc {
                name: IOName(io.name.clone()),
                index,
                dtype,
                shape,
            });
        }

        let mut outputs = Vec::with_capacity(network.def.outputs.len());
        for (index, out) in network.def.outputs.iter().enumerate() {
            let source = inputs
                .iter()
                .find(|b| b.name.0 == out.op.primary())
                .with_context(|| format!("output '{}' reads unknown input", out.name))?;
            outputs.push(BindingDesc {
                name: IOName(out.name.clone()),
                index,
                dtype: source.dtype,
                shape: source.shape.clone(),
            });
        }

        let ops = network
            .def
            .outputs
            .iter()
            .map(|o| (o.name.clone(), o.op.clone()))
            .collect();

        Ok(ReferenceCompiled {
            inputs,
            outputs,
            ops,
            probe: self.probe.clone(),
        })
    }
}

impl CompiledGraph for ReferenceCompiled {
    fn inputs(&self) -> &[BindingDesc] {
        &self.inputs
    }

    fn outputs(&self) -> &[BindingDesc] {
        &self.outputs
    }

    fn create_infer_request(&self) -> Result<Box<dyn EngineInferRequest>> {
        let slots = |descs: &[BindingDesc]| {
            descs
                .iter()
                .map(|b| (b.name.0.clone(), EngineTensor::zeros(b.dtype, b.shape.clone())))
                .collect::<Vec<_>>()
        };
        Ok(Box::new(ReferenceInferRequest {
            inputs: slots(&self.inputs),
            outputs: slots(&self.outputs),
            ops: Arc::clone(&self.ops),
            probe: self.probe.clone(),
        }))
    }
}

pub struct ReferenceInferRequest {
    inputs: Vec<(String, EngineTensor)>,
    outputs: Vec<(String, EngineTensor)>,
    ops: Arc<[(String, Op)]>,
    probe: EngineProbe,
}

impl ReferenceInferRequest {
    fn bound_input(&self, name: &str) -> Result<&EngineTensor> {
        self.input_tensor(name)
            .with_context(|| format!("input '{name}' is not bound"))
    }
}

impl EngineInferRequest for ReferenceInferRequest {
    fn input_tensor(&self, name: &str) -> Option<&EngineTensor> {
        self.inputs.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    fn input_tensor_mut(&mut self, name: &str) -> Option<&mut EngineTensor> {
        self.inputs
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    fn output_tensor(&self, name: &str) -> Option<&EngineTensor> {
        self.outputs.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    fn infer(&mut self) -> Result<()> {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        if self.probe.fail.load(Ordering::SeqCst) {
            bail!("reference engine failure injected");
        }

        let mut results = Vec::with_capacity(self.ops.len());
        for (name, op) in self.ops.iter() {
            let data = match op {
                Op::Identity { input } => self.bound_input(input)?.data.clone(),
                Op::Scale { input, factor } => {
                    let src = self.bound_input(input)?;
                    map_f32(&src.data, |v| v * factor)
                }
                Op::Add { lhs, rhs } => {
                    let a = self.bound_input(lhs)?;
                    let b = self.bound_input(rhs)?;
                    ensure!(
                        a.shape == b.shape,
                        "add operands have different shapes {} and {}",
                        a.shape,
                        b.shape
                    );
                    zip_f32(&a.data, &b.data, |x, y| x + y)
                }
            };
            results.push((name.as_str(), data));
        }

        for (name, data) in results {
            let slot = self
                .outputs
                .iter_mut()
                .find(|(n, _)| n == name)
                .map(|(_, t)| t)
                .with_context(|| format!("output '{name}' is not bound"))?;
            ensure!(
                slot.data.len() == data.len(),
                "output '{name}' produced {} bytes, slot holds {}",
                data.len(),
                slot.data.len()
            );
            slot.data = data;
        }
        Ok(())
    }
}

fn build_model_spec(def: &GraphDef) -> Result<ModelSpec> {
    let mut seen = HashSet::new();
    let mut inputs = Vec::with_capacity(def.inputs.len());
    for io in &def.inputs {
        ensure!(seen.insert(io.name.as_str()), "duplicate input '{}'", io.name);
        let dtype: DType = io.data_type.parse()?;
        inputs.push(TensorSpec::from_signed_dims(io.name.clone(), dtype, &io.dims));
    }

    let mut outputs = Vec::with_capacity(def.outputs.len());
    for out in &def.outputs {
        ensure!(seen.insert(out.name.as_str()), "duplicate output '{}'", out.name);
        for operand in out.op.operands() {
            let input = inputs
                .iter()
                .find(|s: &&TensorSpec| s.name.0 == operand)
                .with_context(|| format!("output '{}' reads unknown input '{operand}'", out.name))?;
            if out.op.requires_f32() {
                ensure!(
                    input.dtype == DType::F32,
                    "output '{}' needs FP32 input, '{operand}' is {}",
                    out.name,
                    input.dtype
                );
            }
        }
        let source = inputs
            .iter()
            .find(|s| s.name.0 == out.op.primary())
            .with_context(|| format!("output '{}' has no source input", out.name))?;
        outputs.push(TensorSpec {
            name: IOName(out.name.clone()),
            ..source.clone()
        });
    }

    Ok(ModelSpec { inputs, outputs })
}

fn resolve_dims(name: &str, dims: &[i64], batch_size: Option<usize>) -> Result<Shape> {
    let mut resolved = Vec::with_capacity(dims.len());
    for (axis, d) in dims.iter().enumerate() {
        match (axis, *d, batch_size) {
            (_, d, _) if d >= 0 => resolved.push(d as usize),
            (0, _, Some(batch)) => resolved.push(batch),
            _ => bail!("dynamic dimension {axis} of '{name}' cannot be resolved at compile time"),
        }
    }
    Ok(Shape::from_slice(&resolved))
}

fn map_f32(bytes: &[u8], f: impl Fn(f32) -> f32) -> Vec<u8> {
    bytes
        .chunks_exact(4)
        .flat_map(|b| f(f32::from_le_bytes([b[0], b[1], b[2], b[3]])).to_le_bytes())
        .collect()
}

fn zip_f32(a: &[u8], b: &[u8], f: impl Fn(f32, f32) -> f32) -> Vec<u8> {
    a.chunks_exact(4)
        .zip(b.chunks_exact(4))
        .flat_map(|(x, y)| {
            let x = f32::from_le_bytes([x[0], x[1], x[2], x[3]]);
            let y = f32::from_le_bytes([y[0], y[1], y[2], y[3]]);
            f(x, y).to_le_bytes()
        })
        .collect()
}
