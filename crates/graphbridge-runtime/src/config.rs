//! Model configuration as written in a model repository's `config.json`.
//!
//! ```json
//! {
//!   "name": "doubler",
//!   "max_batch_size": 4,
//!   "input":  [{ "name": "INPUT0",  "data_type": "TYPE_FP32", "dims": [4] }],
//!   "output": [{ "name": "OUTPUT0", "data_type": "TYPE_FP32", "dims": [4] }],
//!   "parameters": { "ENABLE_BATCH_PADDING": { "string_value": "YES" } },
//!   "instance_group": [{ "kind": "KIND_CPU", "count": 2 }]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use graphbridge_core::{BridgeError, BridgeResult, DType, Device, EngineProperties, IOName};
use serde::Deserialize;

pub const CONFIG_FILENAME: &str = "config.json";

#[derive(Clone, Debug, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// 0 means the model has no batch dimension.
    #[serde(default)]
    pub max_batch_size: usize,
    #[serde(default)]
    pub input: Vec<IoConfig>,
    #[serde(default)]
    pub output: Vec<IoConfig>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
    #[serde(default)]
    pub instance_group: Vec<InstanceGroup>,
    #[serde(default)]
    pub default_model_filename: Option<String>,
    #[serde(default = "default_version")]
    pub version: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IoConfig {
    pub name: String,
    pub data_type: String,
    pub dims: Vec<i64>,
    #[serde(default)]
    pub reshape: Option<ReshapeConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReshapeConfig {
    pub shape: Vec<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ParameterValue {
    pub string_value: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InstanceGroup {
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default)]
    pub kind: InstanceKind,
    #[serde(default)]
    pub gpus: Vec<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum InstanceKind {
    #[default]
    #[serde(rename = "KIND_CPU")]
    Cpu,
    #[serde(rename = "KIND_GPU")]
    Gpu,
}

/// Backend switches read from `parameters`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackendParameters {
    pub enable_batch_padding: bool,
}

fn default_version() -> u64 {
    1
}

fn default_count() -> usize {
    1
}

impl IoConfig {
    pub fn io_name(&self) -> IOName {
        IOName(self.name.clone())
    }

    pub fn dtype(&self) -> BridgeResult<DType> {
        self.data_type.parse().map_err(|_| {
            BridgeError::InvalidArgument(format!(
                "unsupported datatype {} for '{}'",
                self.data_type, self.name
            ))
        })
    }

    /// Dims the model is expected to see: `reshape.shape` when given,
    /// otherwise `dims`.
    pub fn effective_dims(&self) -> &[i64] {
        match &self.reshape {
            Some(reshape) => &reshape.shape,
            None => &self.dims,
        }
    }
}

impl InstanceGroup {
    /// Devices this group asks for, one entry per instance.
    pub fn devices(&self) -> Vec<Device> {
        match self.kind {
            InstanceKind::Cpu => vec![Device::Cpu; self.count],
            InstanceKind::Gpu => {
                let gpus = if self.gpus.is_empty() {
                    vec![0]
                } else {
                    self.gpus.clone()
                };
                gpus.iter()
                    .flat_map(|id| std::iter::repeat(Device::Cuda { device_id: *id }).take(self.count))
                    .collect()
            }
        }
    }
}

impl ModelConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse model configuration")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read model configuration '{}'", path.display()))?;
        Self::from_json(&raw)
    }

    /// Loads `<repository>/config.json`.
    pub fn from_repository(repository: &Path) -> Result<Self> {
        Self::from_file(&repository.join(CONFIG_FILENAME))
    }

    pub fn supports_batching(&self) -> bool {
        self.max_batch_size > 0
    }

    pub fn output_names(&self) -> Vec<IOName> {
        self.output.iter().map(IoConfig::io_name).collect()
    }

    /// Model file to read, falling back to the engine's default name.
    pub fn model_path(&self, repository: &Path, engine_default: &str) -> PathBuf {
        let filename = self
            .default_model_filename
            .as_deref()
            .filter(|f| !f.is_empty())
            .unwrap_or(engine_default);
        repository.join(self.version.to_string()).join(filename)
    }

    /// Instance devices from `instance_group`; a single CPU instance when the
    /// group list is empty.
    pub fn instance_devices(&self) -> Vec<Device> {
        if self.instance_group.is_empty() {
            return vec![Device::Cpu];
        }
        self.instance_group
            .iter()
            .flat_map(InstanceGroup::devices)
            .collect()
    }

    fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|p| p.string_value.as_str())
    }

    fn bool_parameter(&self, key: &str) -> bool {
        self.parameter(key)
            .is_some_and(|v| v.eq_ignore_ascii_case("yes"))
    }

    pub fn backend_parameters(&self) -> BackendParameters {
        BackendParameters {
            enable_batch_padding: self.bool_parameter("ENABLE_BATCH_PADDING"),
        }
    }

    /// Engine properties for `device`, translated from the CPU parameters.
    /// Non-CPU devices get no properties.
    pub fn device_properties(&self, device: Device) -> BridgeResult<EngineProperties> {
        let mut properties = EngineProperties::new();
        if !device.is_cpu() {
            return Ok(properties);
        }
        for key in [
            "CPU_THREADS_NUM",
            "ENFORCE_BF16",
            "CPU_BIND_THREAD",
            "CPU_THROUGHPUT_STREAMS",
        ] {
            if let Some(raw) = self.parameter(key).filter(|v| !v.is_empty()) {
                let value = normalize_cpu_parameter(key, raw)?;
                properties.insert(key.to_string(), value);
            }
        }
        Ok(properties)
    }
}

fn is_number(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

fn normalize_cpu_parameter(key: &str, raw: &str) -> BridgeResult<String> {
    let value = raw.to_ascii_lowercase();
    let invalid = |expected: &str| {
        BridgeError::InvalidArgument(format!(
            "expected the parameter '{key}' to be {expected}, got {raw}"
        ))
    };
    match key {
        "CPU_THREADS_NUM" if is_number(&value) => Ok(value),
        "CPU_THREADS_NUM" => Err(invalid("a non-negative number")),
        "ENFORCE_BF16" => match value.as_str() {
            "yes" => Ok("YES".to_string()),
            "no" => Ok("NO".to_string()),
            _ => Err(invalid("either YES or NO")),
        },
        "CPU_BIND_THREAD" => match value.as_str() {
            "yes" => Ok("YES".to_string()),
            "numa" => Ok("NUMA".to_string()),
            "no" => Ok("NO".to_string()),
            _ => Err(invalid("either YES/NUMA/NO")),
        },
        "CPU_THROUGHPUT_STREAMS" => match value.as_str() {
            "auto" => Ok("CPU_THROUGHPUT_AUTO".to_string()),
            "numa" => Ok("CPU_THROUGHPUT_NUMA".to_string()),
            v if is_number(v) => Ok(value),
            _ => Err(invalid("a non-negative number or AUTO/NUMA")),
        },
        _ => Err(BridgeError::InvalidArgument(format!(
            "the parameter '{key}' is not yet supported by this backend"
        ))),
    }
}
