use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use graphbridge_core::{
    BackendCapabilities, BindingDesc, CompileOptions, CompiledGraph, DType, Device, Engine,
    EngineInferRequest, EngineProperties, EngineTensor, IOName, ModelArtifact, ModelSpec, Network,
    Shape, TensorSpec,
};
use ort::{
    session::{builder::GraphOptimizationLevel, Session, SessionInputValue},
    tensor::TensorElementType,
    value::{DynValue, ValueType},
};
use tracing::{debug, warn};

pub struct OrtEngine {
    intra_threads: Option<usize>,
    inter_threads: Option<usize>,
}

impl OrtEngine {
    pub fn new() -> Self {
        Self {
            intra_threads: None,
            inter_threads: None,
        }
    }
}

impl Default for OrtEngine {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OrtNetwork {
    bytes: Bytes,
    spec: ModelSpec,
}

impl Network for OrtNetwork {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }
}

pub struct OrtCompiled {
    bytes: Bytes,
    settings: SessionSettings,
    inputs: Vec<BindingDesc>,
    outputs: Vec<BindingDesc>,
}

#[derive(Clone, Copy, Debug)]
struct SessionSettings {
    intra_threads: Option<usize>,
    inter_threads: Option<usize>,
}

impl Engine for OrtEngine {
    type Network = OrtNetwork;
    type Compiled = OrtCompiled;

    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn default_model_filename(&self) -> &'static str {
        "model.onnx"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_dynamic_shapes: false,
        }
    }

    fn read_network(&self, artifact: &ModelArtifact) -> Result<Self::Network> {
        let bytes = artifact.load_bytes()?;
        let session = Session::builder()
            .context("failed to create ORT session builder")?
            .commit_from_memory(&bytes)
            .context("failed to load ONNX model")?;
        let spec = build_model_spec(&session)?;
        Ok(OrtNetwork { bytes, spec })
    }

    fn configure(&mut self, device: Device, properties: &EngineProperties) -> Result<()> {
        ensure!(device.is_cpu(), "onnxruntime engine is CPU-only, got {device}");
        for (key, value) in properties {
            match key.as_str() {
                "CPU_THREADS_NUM" => {
                    let n: usize = value.parse().context("invalid CPU_THREADS_NUM")?;
                    // 0 keeps the runtime default
                    self.intra_threads = (n > 0).then_some(n);
                }
                "CPU_THROUGHPUT_STREAMS" => match value.parse::<usize>() {
                    Ok(n) if n > 0 => self.inter_threads = Some(n),
                    _ => debug!(%value, "leaving ORT inter-op threads at default"),
                },
                "ENFORCE_BF16" | "CPU_BIND_THREAD" => {
                    warn!(property = %key, %value, "property has no onnxruntime equivalent, ignoring")
                }
                other => bail!("onnxruntime engine does not support property '{other}'"),
            }
        }
        Ok(())
    }

    fn compile(
        &self,
        network: &Self::Network,
        device: Device,
        options: &CompileOptions,
    ) -> Result<Self::Compiled> {
        ensure!(device.is_cpu(), "onnxruntime engine is CPU-only, got {device}");

        let settings = SessionSettings {
            intra_threads: self.intra_threads,
            inter_threads: self.inter_threads,
        };
        // Build once up front so a broken model fails here rather than on the
        // first infer request.
        build_session(&network.bytes, settings)?;

        let inputs = bindings_from_specs(&network.spec.inputs, options.batch_size)?;
        let outputs = bindings_from_specs(&network.spec.outputs, options.batch_size)?;

        Ok(OrtCompiled {
            bytes: network.bytes.clone(),
            settings,
            inputs,
            outputs,
        })
    }
}

impl CompiledGraph for OrtCompiled {
    fn inputs(&self) -> &[BindingDesc] {
        &self.inputs
    }

    fn outputs(&self) -> &[BindingDesc] {
        &self.outputs
    }

    fn create_infer_request(&self) -> Result<Box<dyn EngineInferRequest>> {
        let session = build_session(&self.bytes, self.settings)?;
        let slots = |descs: &[BindingDesc]| {
            descs
                .iter()
                .map(|b| (b.name.0.clone(), EngineTensor::zeros(b.dtype, b.shape.clone())))
                .collect::<Vec<_>>()
        };
        Ok(Box::new(OrtInferRequest {
            session,
            inputs: slots(&self.inputs),
            outputs: slots(&self.outputs),
        }))
    }
}

pub struct OrtInferRequest {
    session: Session,
    inputs: Vec<(String, EngineTensor)>,
    outputs: Vec<(String, EngineTensor)>,
}

impl EngineInferRequest for OrtInferRequest {
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
        let mut ort_inputs = Vec::with_capacity(self.inputs.len());
        for (name, tensor) in &self.inputs {
            let value = tensor_to_ort_value(tensor)?;
            ort_inputs.push((name.clone(), SessionInputValue::from(value)));
        }

        let produced = {
            let outputs = self.session.run(ort_inputs)?;
            let mut produced = Vec::with_capacity(outputs.len());
            for (name, value) in outputs.iter() {
                produced.push((name.to_string(), ort_value_to_tensor(&value)?));
            }
            produced
        };

        store_outputs(&mut self.outputs, produced)
    }
}

/// Moves produced tensors into the bound output slots. Every bound output
/// must be produced, otherwise a slot would keep the previous call's data.
fn store_outputs(
    slots: &mut [(String, EngineTensor)],
    mut produced: Vec<(String, EngineTensor)>,
) -> Result<()> {
    if let Some((missing, _)) = slots
        .iter()
        .find(|(name, _)| produced.iter().all(|(p, _)| p != name))
    {
        bail!("ORT did not produce bound output '{missing}'");
    }
    for (name, slot) in slots.iter_mut() {
        if let Some(pos) = produced.iter().position(|(p, _)| p == name) {
            *slot = produced.swap_remove(pos).1;
        }
    }
    for (name, _) in produced {
        debug!(output = %name, "dropping unbound ORT output");
    }
    Ok(())
}

fn build_session(bytes: &[u8], settings: SessionSettings) -> Result<Session> {
    let mut builder = Session::builder()
        .context("failed to create ORT session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("failed to configure ORT session builder")?;
    if let Some(n) = settings.intra_threads {
        builder = builder
            .with_intra_threads(n)
            .context("failed to set ORT intra-op threads")?;
    }
    if let Some(n) = settings.inter_threads {
        builder = builder
            .with_inter_threads(n)
            .context("failed to set ORT inter-op threads")?;
    }
    builder
        .commit_from_memory(bytes)
        .context("failed to load ONNX model")
}

fn build_model_spec(session: &Session) -> Result<ModelSpec> {
    let inputs = session
        .inputs
        .iter()
        .map(|input| tensor_spec_from_value_type(&input.name, &input.input_type))
        .collect::<Result<Vec<_>>>()?;

    let outputs = session
        .outputs
        .iter()
        .map(|output| tensor_spec_from_value_type(&output.name, &output.output_type))
        .collect::<Result<Vec<_>>>()?;

    Ok(ModelSpec { inputs, outputs })
}

fn bindings_from_specs(specs: &[TensorSpec], batch_size: Option<usize>) -> Result<Vec<BindingDesc>> {
    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            let mut dims = Vec::with_capacity(spec.dims.len());
            for (axis, d) in spec.dims.iter().enumerate() {
                match (axis, d, batch_size) {
                    (_, Some(d), _) => dims.push(*d),
                    (0, None, Some(batch)) => dims.push(batch),
                    _ => bail!(
                        "dynamic dimension {axis} of '{}' cannot be bound to a fixed slot",
                        spec.name
                    ),
                }
            }
            Ok(BindingDesc {
                name: spec.name.clone(),
                index,
                dtype: spec.dtype,
                shape: Shape::from_slice(&dims),
            })
        })
        .collect()
}

fn tensor_spec_from_value_type(name: &str, value_type: &ValueType) -> Result<TensorSpec> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        bail!("unsupported non-tensor IO value type");
    };

    let dtype = ort_tensor_element_to_dtype(*ty)?;
    let dims = shape
        .iter()
        .map(|d| if *d < 0 { None } else { Some(*d as usize) })
        .collect::<Vec<_>>();

    Ok(TensorSpec {
        name: IOName(name.to_string()),
        dtype,
        rank: shape.len(),
        dims,
    })
}

fn ort_tensor_element_to_dtype(ty: TensorElementType) -> Result<DType> {
    match ty {
        TensorElementType::Float32 => Ok(DType::F32),
        TensorElementType::Float16 => Ok(DType::F16),
        TensorElementType::Float64 => Ok(DType::F64),
        TensorElementType::Int64 => Ok(DType::I64),
        TensorElementType::Int32 => Ok(DType::I32),
        TensorElementType::Uint8 => Ok(DType::U8),
        _ => bail!("unsupported tensor element type: {ty}"),
    }
}

fn tensor_to_ort_value(tensor: &EngineTensor) -> Result<DynValue> {
    let shape: Vec<usize> = tensor.shape.dims().to_vec();
    let expected_bytes = tensor.shape.numel() * tensor.dtype.byte_size();
    ensure!(
        tensor.data.len() == expected_bytes,
        "input byte size mismatch: got {}, expected {}",
        tensor.data.len(),
        expected_bytes
    );

    let bytes = &tensor.data;
    let value = match tensor.dtype {
        DType::F32 => {
            let data: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::F64 => {
            let data: Vec<f64> = bytes
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect();
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::I64 => {
            let data: Vec<i64> = bytes
                .chunks_exact(8)
                .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect();
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::I32 => {
            let data: Vec<i32> = bytes
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::U8 => ort::value::Tensor::from_array((shape, bytes.clone()))?.into_dyn(),
        other => bail!("{other} inputs are not supported by the onnxruntime engine yet"),
    };

    Ok(value)
}

fn ort_value_to_tensor(value: &ort::value::ValueRef<'_>) -> Result<EngineTensor> {
    let ValueType::Tensor { ty, shape, .. } = value.dtype() else {
        bail!("non-tensor outputs are not supported");
    };

    let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
    let shape = Shape::from_slice(&dims);

    let (dtype, data) = match *ty {
        TensorElementType::Float32 => {
            let array = value.try_extract_array::<f32>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            (DType::F32, bytes_from_slice(slice))
        }
        TensorElementType::Float64 => {
            let array = value.try_extract_array::<f64>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            (DType::F64, bytes_from_slice(slice))
        }
        TensorElementType::Int64 => {
            let array = value.try_extract_array::<i64>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            (DType::I64, bytes_from_slice(slice))
        }
        TensorElementType::Int32 => {
            let array = value.try_extract_array::<i32>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            (DType::I32, bytes_from_slice(slice))
        }
        TensorElementType::Uint8 => {
            let array = value.try_extract_array::<u8>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            (DType::U8, slice.to_vec())
        }
        TensorElementType::Float16 => bail!("f16 outputs are not supported yet"),
        _ => bail!("unsupported output tensor element type: {ty}"),
    };

    Ok(EngineTensor { dtype, shape, data })
}

fn bytes_from_slice<T: Copy>(slice: &[T]) -> Vec<u8> {
    let byte_len = std::mem::size_of_val(slice);
    let ptr = slice.as_ptr().cast::<u8>();
    // SAFETY: `slice` is a live, initialized buffer of plain numeric values
    // spanning exactly `byte_len` bytes.
    let bytes = unsafe { std::slice::from_raw_parts(ptr, byte_len) };
    bytes.to_vec()
}
