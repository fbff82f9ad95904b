//! Backend registry
//!
//! Maps provider names to backends. Built-in providers are constructed from
//! configuration on first use; callers may register their own under any name.

use crate::config::ProviderSettings;
use crate::error::PipelineError;
use crate::provider::{GenerationBackend, OllamaBackend, OpenAiBackend};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct BackendRegistry {
    settings: ProviderSettings,
    request_timeout: Duration,
    backends: Mutex<HashMap<String, Arc<dyn GenerationBackend>>>,
}

impl BackendRegistry {
    pub fn new(settings: ProviderSettings, request_timeout: Duration) -> Self {
        Self {
            settings,
            request_timeout,
            backends: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the backend used for `name`.
    pub fn register(&self, name: impl Into<String>, backend: Arc<dyn GenerationBackend>) {
        let name = name.into().to_lowercase();
        debug!(provider = %name, "Registered generation backend");
        self.backends.lock().insert(name, backend);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn GenerationBackend>, PipelineError> {
        let name = name.to_lowercase();
        let mut backends = self.backends.lock();
        if let Some(backend) = backends.get(&name) {
            return Ok(Arc::clone(backend));
        }

        let backend: Arc<dyn GenerationBackend> = match name.as_str() {
            "openai" => Arc::new(OpenAiBackend::new(&self.settings.openai, self.request_timeout)?),
            "ollama" => Arc::new(OllamaBackend::new(&self.settings.ollama, self.request_timeout)?),
            _ => {
                return Err(PipelineError::Configuration(format!(
                    "Unknown provider: {}",
                    name
                )))
            }
        };
        debug!(provider = %name, "Created built-in generation backend");
        backends.insert(name, Arc::clone(&backend));
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new(ProviderSettings::default(), Duration::from_secs(300))
    }
}
