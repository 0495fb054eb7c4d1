use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use graphbridge_backend_ort::OrtEngine;
use graphbridge_backend_ref::ReferenceEngine;
use graphbridge_core::{Engine, ModelArtifact};
use graphbridge_runtime::{InstanceSettings, ModelConfig, ModelInstance, StatsReporter, WorkerModel};
use tracing::info;

use crate::cli::EngineKind;

pub struct LoadedModel {
    pub config: Arc<ModelConfig>,
    pub instances: Vec<Box<dyn WorkerModel>>,
}

pub struct ModelRegistry {
    models: HashMap<String, LoadedModel>,
    stats: Arc<dyn StatsReporter>,
}

impl ModelRegistry {
    pub fn new(stats: Arc<dyn StatsReporter>) -> Self {
        Self {
            models: HashMap::new(),
            stats,
        }
    }

    /// Loads the repository's configuration and builds one instance per
    /// configured device. Returns the model name.
    pub fn load_repository(&mut self, repository: &Path, engine: EngineKind) -> Result<String> {
        let config = Arc::new(ModelConfig::from_repository(repository)?);
        let instances = match engine {
            EngineKind::Ref => self.build_instances(repository, &config, ReferenceEngine::new)?,
            EngineKind::Onnx => self.build_instances(repository, &config, OrtEngine::new)?,
        };
        info!(model = %config.name, instances = instances.len(), "model loaded");

        let name = config.name.clone();
        self.models
            .insert(name.clone(), LoadedModel { config, instances });
        Ok(name)
    }

    pub fn take(&mut self, name: &str) -> Option<LoadedModel> {
        self.models.remove(name)
    }

    fn build_instances<E: Engine>(
        &self,
        repository: &Path,
        config: &Arc<ModelConfig>,
        make_engine: impl Fn() -> E,
    ) -> Result<Vec<Box<dyn WorkerModel>>> {
        let mut instances: Vec<Box<dyn WorkerModel>> = Vec::new();
        for (idx, device) in config.instance_devices().into_iter().enumerate() {
            let engine = make_engine();
            let path = config.model_path(repository, engine.default_model_filename());
            let name = format!("{}_{idx}", config.name);
            let settings = InstanceSettings::new(name.clone(), device, ModelArtifact::Path(path));
            let instance = ModelInstance::create(engine, Arc::clone(config), settings)
                .with_context(|| format!("failed to create instance '{name}' on {device}"))?
                .with_stats(Arc::clone(&self.stats));
            instances.push(Box::new(instance));
        }
        Ok(instances)
    }
}
