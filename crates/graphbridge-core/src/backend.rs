use std::collections::BTreeMap;

use anyhow::Result;

use crate::{DType, Device, EngineTensor, IOName, ModelArtifact, ModelSpec, Shape};

/// Engine-specific key/value settings applied before compilation.
pub type EngineProperties = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug)]
pub struct BackendCapabilities {
    /// Whether dims other than the leading batch axis may stay dynamic.
    pub supports_dynamic_shapes: bool,
}

#[derive(Clone, Debug, Default)]
pub struct CompileOptions {
    /// Leading dimension to fix dynamic batch axes to. `None` compiles the
    /// network without a batch axis.
    pub batch_size: Option<usize>,
}

/// A named tensor slot advertised by a compiled graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingDesc {
    pub name: IOName,
    pub index: usize,
    pub dtype: DType,
    pub shape: Shape,
}

pub trait Engine: Send + 'static {
    type Network: Network;
    type Compiled: CompiledGraph;

    fn name(&self) -> &'static str;
    fn default_model_filename(&self) -> &'static str;
    fn capabilities(&self) -> BackendCapabilities;

    fn read_network(&self, artifact: &ModelArtifact) -> Result<Self::Network>;
    fn configure(&mut self, device: Device, properties: &EngineProperties) -> Result<()>;
    fn compile(
        &self,
        network: &Self::Network,
        device: Device,
        options: &CompileOptions,
    ) -> Result<Self::Compiled>;
}

/// A network that has been read but not compiled.
pub trait Network: Send + Sync + 'static {
    fn spec(&self) -> &ModelSpec;
}

/// Immutable once built; may be shared between instances behind an `Arc`.
pub trait CompiledGraph: Send + Sync + 'static {
    fn inputs(&self) -> &[BindingDesc];
    fn outputs(&self) -> &[BindingDesc];
    fn create_infer_request(&self) -> Result<Box<dyn EngineInferRequest>>;
}

/// Mutable per-call tensor bindings. Owned by exactly one instance.
pub trait EngineInferRequest: Send {
    fn input_tensor(&self, name: &str) -> Option<&EngineTensor>;
    fn input_tensor_mut(&mut self, name: &str) -> Option<&mut EngineTensor>;
    fn output_tensor(&self, name: &str) -> Option<&EngineTensor>;

    /// Runs the graph over the bound inputs. Blocks until the engine returns.
    fn infer(&mut self) -> Result<()>;
}
