use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{builtin_models, find_model, Backend, BackendSettings, ConfigError, ModelConfig};

type Slot = Arc<Mutex<Option<Arc<Backend>>>>;

/// Lazily creates and caches one backend per model name.
///
/// Concurrent requests for the same name wait on that name's slot, so a
/// backend is never built twice. Different names do not block each other.
pub struct BackendRegistry {
    models: Vec<ModelConfig>,
    settings: BackendSettings,
    slots: Mutex<HashMap<String, Slot>>,
}

impl BackendRegistry {
    pub fn new(models: Vec<ModelConfig>, settings: BackendSettings) -> Self {
        Self {
            models,
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Built-in models with settings read from the environment.
    pub fn from_env() -> Self {
        Self::new(builtin_models().to_vec(), BackendSettings::from_env())
    }

    pub fn models(&self) -> &[ModelConfig] {
        &self.models
    }

    pub fn model_config(&self, name: &str) -> Result<&ModelConfig, ConfigError> {
        find_model(&self.models, name)
    }

    /// Return the live backend for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Backend>, ConfigError> {
        let config = self.model_config(name)?;

        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(slots.entry(name.to_string()).or_default())
        };

        let mut cached = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(backend) = cached.as_ref() {
            if !backend.is_closed() {
                return Ok(Arc::clone(backend));
            }
        }

        let backend = Arc::new(Backend::create(config, &self.settings)?);
        *cached = Some(Arc::clone(&backend));
        Ok(backend)
    }

    /// Shut down every cached backend and forget it.
    pub fn shutdown_all(&self) {
        let slots: Vec<Slot> = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let mut cached = slot.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(backend) = cached.take() {
                tracing::info!(model = %backend.config().name, "Shutting down backend");
                backend.shutdown();
            }
        }
    }
}

impl Drop for BackendRegistry {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}
