//! One-time, ordered construction of a model instance.
//!
//! ```text
//! Created -> NetworkRead -> ValidatedNetwork -> ConfiguredEngine
//!         -> Compiled -> BoundInferRequest -> Ready
//! ```
//!
//! Every step checks the transition first, so repeating a step or jumping
//! ahead is reported instead of silently redoing work.

use std::fmt;
use std::sync::Arc;

use graphbridge_core::{
    BridgeError, BridgeResult, CompileOptions, CompiledGraph, Device, Engine, EngineInferRequest,
    ModelArtifact, Network, TensorSpec,
};
use tracing::{debug, info};

use crate::{BindingTable, IoConfig, ModelConfig, ModelInstance};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Created,
    NetworkRead,
    ValidatedNetwork,
    ConfiguredEngine,
    Compiled,
    BoundInferRequest,
    Ready,
}

impl LifecycleState {
    pub fn next(self) -> Option<Self> {
        use LifecycleState::*;
        match self {
            Created => Some(NetworkRead),
            NetworkRead => Some(ValidatedNetwork),
            ValidatedNetwork => Some(ConfiguredEngine),
            ConfiguredEngine => Some(Compiled),
            Compiled => Some(BoundInferRequest),
            BoundInferRequest => Some(Ready),
            Ready => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::NetworkRead => "network-read",
            LifecycleState::ValidatedNetwork => "validated-network",
            LifecycleState::ConfiguredEngine => "configured-engine",
            LifecycleState::Compiled => "compiled",
            LifecycleState::BoundInferRequest => "bound-infer-request",
            LifecycleState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// The single authoritative state of an instance under construction.
#[derive(Clone, Debug)]
pub struct LifecycleGuard {
    model: String,
    device: Device,
    state: LifecycleState,
}

impl LifecycleGuard {
    pub fn new(model: impl Into<String>, device: Device) -> Self {
        Self {
            model: model.into(),
            device,
            state: LifecycleState::Created,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn ensure_can_enter(&self, next: LifecycleState) -> BridgeResult<()> {
        if next <= self.state {
            return Err(self.repeated(next));
        }
        if self.state.next() != Some(next) {
            return Err(BridgeError::Internal(format!(
                "model '{}' cannot move from {} to {next}",
                self.model, self.state
            )));
        }
        Ok(())
    }

    pub fn enter(&mut self, next: LifecycleState) -> BridgeResult<()> {
        self.ensure_can_enter(next)?;
        debug!(model = %self.model, from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
        Ok(())
    }

    fn repeated(&self, step: LifecycleState) -> BridgeError {
        let message = match step {
            LifecycleState::Created | LifecycleState::NetworkRead => {
                format!("attempt to read model '{}' more than once", self.model)
            }
            LifecycleState::Compiled => format!(
                "attempt to load model '{}' on device '{}' more than once",
                self.model, self.device
            ),
            other => format!("model '{}' already passed {other}", self.model),
        };
        BridgeError::Internal(message)
    }
}

/// Where and what an instance loads.
#[derive(Clone, Debug)]
pub struct InstanceSettings {
    pub name: String,
    pub device: Device,
    pub artifact: ModelArtifact,
}

impl InstanceSettings {
    pub fn new(name: impl Into<String>, device: Device, artifact: ModelArtifact) -> Self {
        Self {
            name: name.into(),
            device,
            artifact,
        }
    }
}

/// Drives an engine through the lifecycle steps. Steps can be run one by
/// one or all at once with [`InstanceLoader::load`].
pub struct InstanceLoader<E: Engine> {
    engine: E,
    config: Arc<ModelConfig>,
    settings: InstanceSettings,
    guard: LifecycleGuard,
    network: Option<E::Network>,
    compiled: Option<Arc<E::Compiled>>,
    infer_request: Option<Box<dyn EngineInferRequest>>,
    bindings: Option<BindingTable>,
}

impl<E: Engine> InstanceLoader<E> {
    /// Rejects every device other than the CPU before anything is read.
    pub fn new(engine: E, config: Arc<ModelConfig>, settings: InstanceSettings) -> BridgeResult<Self> {
        if !settings.device.is_cpu() {
            return Err(BridgeError::InvalidArgument(format!(
                "device '{}' is not supported for model instance '{}', only CPU is",
                settings.device, settings.name
            )));
        }
        let guard = LifecycleGuard::new(config.name.clone(), settings.device);
        Ok(Self {
            engine,
            config,
            settings,
            guard,
            network: None,
            compiled: None,
            infer_request: None,
            bindings: None,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.guard.state()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Runs every remaining step and hands over the ready instance.
    pub fn load(mut self) -> BridgeResult<ModelInstance<E>> {
        self.read_network()?;
        self.validate_network()?;
        self.configure_engine()?;
        self.compile()?;
        self.create_infer_request()?;
        self.capture_bindings()?;
        self.finish()
    }

    pub fn read_network(&mut self) -> BridgeResult<()> {
        self.guard.ensure_can_enter(LifecycleState::NetworkRead)?;
        let artifact = &self.settings.artifact;
        if let ModelArtifact::Path(path) = artifact {
            if !path.exists() {
                return Err(BridgeError::Unavailable(format!(
                    "unable to find '{}' for model instance '{}'",
                    path.display(),
                    self.settings.name
                )));
            }
        }
        let network = self
            .engine
            .read_network(artifact)
            .map_err(|e| BridgeError::engine(format!("reading {}", artifact.describe()), e))?;
        self.network = Some(network);
        self.guard.enter(LifecycleState::NetworkRead)?;
        info!(model = %self.config.name, artifact = %artifact.describe(), "read network");
        Ok(())
    }

    /// Checks the configured inputs and outputs against the network.
    pub fn validate_network(&mut self) -> BridgeResult<()> {
        self.guard.ensure_can_enter(LifecycleState::ValidatedNetwork)?;
        let spec = self.network()?.spec();
        let batched = self.config.supports_batching();
        let dynamic_ok = self.engine.capabilities().supports_dynamic_shapes;

        if self.config.input.len() != spec.inputs.len() {
            return Err(BridgeError::InvalidArgument(format!(
                "unable to load model '{}', configuration expects {} inputs, model provides {}",
                self.config.name,
                self.config.input.len(),
                spec.inputs.len()
            )));
        }
        for io in &self.config.input {
            validate_io(&self.config.name, "input", io, spec.input(&io.name), batched, dynamic_ok)?;
        }
        for io in &self.config.output {
            validate_io(&self.config.name, "output", io, spec.output(&io.name), batched, dynamic_ok)?;
        }
        self.guard.enter(LifecycleState::ValidatedNetwork)
    }

    pub fn configure_engine(&mut self) -> BridgeResult<()> {
        self.guard.ensure_can_enter(LifecycleState::ConfiguredEngine)?;
        let device = self.settings.device;
        let properties = self.config.device_properties(device)?;
        self.engine
            .configure(device, &properties)
            .map_err(|e| BridgeError::engine(format!("configuring {}", self.engine.name()), e))?;
        debug!(model = %self.config.name, properties = properties.len(), "engine configured");
        self.guard.enter(LifecycleState::ConfiguredEngine)
    }

    pub fn compile(&mut self) -> BridgeResult<()> {
        self.guard.ensure_can_enter(LifecycleState::Compiled)?;
        let options = CompileOptions {
            batch_size: self
                .config
                .supports_batching()
                .then_some(self.config.max_batch_size),
        };
        let network = self.network()?;
        let compiled = self
            .engine
            .compile(network, self.settings.device, &options)
            .map_err(|e| BridgeError::engine(format!("compiling model '{}'", self.config.name), e))?;
        self.compiled = Some(Arc::new(compiled));
        self.guard.enter(LifecycleState::Compiled)?;
        info!(
            model = %self.config.name,
            device = %self.settings.device,
            batch = ?options.batch_size,
            "compiled network"
        );
        Ok(())
    }

    pub fn create_infer_request(&mut self) -> BridgeResult<()> {
        self.guard.ensure_can_enter(LifecycleState::BoundInferRequest)?;
        let request = self
            .compiled()?
            .create_infer_request()
            .map_err(|e| BridgeError::engine("creating infer request", e))?;
        self.infer_request = Some(request);
        self.guard.enter(LifecycleState::BoundInferRequest)
    }

    /// Captures the binding table and moves to `Ready`.
    pub fn capture_bindings(&mut self) -> BridgeResult<()> {
        self.guard.ensure_can_enter(LifecycleState::Ready)?;
        let bindings = BindingTable::from_compiled(&**self.compiled()?)?;
        self.bindings = Some(bindings);
        self.guard.enter(LifecycleState::Ready)
    }

    pub fn finish(self) -> BridgeResult<ModelInstance<E>> {
        if self.guard.state() != LifecycleState::Ready {
            return Err(BridgeError::Internal(format!(
                "model instance '{}' is {}, not ready",
                self.settings.name,
                self.guard.state()
            )));
        }
        let missing = |what: &str| {
            BridgeError::Internal(format!("model instance '{}' lost its {what}", self.settings.name))
        };
        let compiled = self.compiled.ok_or_else(|| missing("compiled graph"))?;
        let infer_request = self.infer_request.ok_or_else(|| missing("infer request"))?;
        let bindings = self.bindings.ok_or_else(|| missing("bindings"))?;
        info!(instance = %self.settings.name, model = %self.config.name, "instance ready");
        Ok(ModelInstance::from_parts(
            self.settings.name,
            self.settings.device,
            self.config,
            self.engine,
            compiled,
            infer_request,
            bindings,
        ))
    }

    fn network(&self) -> BridgeResult<&E::Network> {
        self.network
            .as_ref()
            .ok_or_else(|| BridgeError::Internal("network has not been read".to_string()))
    }

    fn compiled(&self) -> BridgeResult<&Arc<E::Compiled>> {
        self.compiled
            .as_ref()
            .ok_or_else(|| BridgeError::Internal("network has not been compiled".to_string()))
    }
}

fn validate_io(
    model: &str,
    kind: &str,
    io: &IoConfig,
    declared: Option<&TensorSpec>,
    batched: bool,
    dynamic_ok: bool,
) -> BridgeResult<()> {
    let declared = declared.ok_or_else(|| {
        BridgeError::InvalidArgument(format!(
            "unable to load model '{model}', configuration {kind} '{}' is not found in the network",
            io.name
        ))
    })?;
    let dtype = io.dtype()?;
    if declared.dtype != dtype {
        return Err(BridgeError::InvalidArgument(format!(
            "unable to load model '{model}', configuration expects datatype {dtype} for {kind} '{}', model provides {}",
            io.name, declared.dtype
        )));
    }
    let mut dims = Vec::with_capacity(io.effective_dims().len() + 1);
    if batched {
        dims.push(-1);
    }
    dims.extend_from_slice(io.effective_dims());
    let configured = TensorSpec::from_signed_dims(io.name.clone(), dtype, &dims);
    if !declared.dims_compatible(&configured.dims) {
        return Err(BridgeError::InvalidArgument(format!(
            "unable to load model '{model}', {kind} '{}' dims {:?} do not match the network dims {:?}",
            io.name, dims, declared.dims
        )));
    }
    let fixed_from = usize::from(batched);
    if !dynamic_ok && declared.dims.iter().skip(fixed_from).any(Option::is_none) {
        return Err(BridgeError::InvalidArgument(format!(
            "unable to load model '{model}', {kind} '{}' has dynamic dims {:?} and the engine only binds fixed shapes",
            io.name, declared.dims
        )));
    }
    Ok(())
}
