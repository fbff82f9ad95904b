//! Configuration System
//!
//! Layered runner configuration: merge-policy defaults, then the global config file,
//! then workspace `config/*.toml`, then `PROMPTLINE__SECTION__KEY` environment
//! variables. Pipeline definitions are separate YAML files; this only covers how the
//! runner itself behaves.

use crate::error::PipelineError;
use crate::logging::LoggingConfig;
use config::Environment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

mod merge;
mod sources;

pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub runner: RunnerSettings,

    #[serde(default)]
    pub providers: ProviderSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Run execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Directory new runs are created under, relative to the workspace
    #[serde(default = "default_runs_root")]
    pub runs_root: PathBuf,

    /// Pool size for concurrent stages that omit `max_in_flight`
    #[serde(default = "default_max_in_flight")]
    pub default_max_in_flight: usize,

    /// Upper bound on every backend call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_runs_root() -> PathBuf {
    PathBuf::from("runs")
}

fn default_max_in_flight() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            runs_root: default_runs_root(),
            default_max_in_flight: default_max_in_flight(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl RunnerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub openai: OpenAiSettings,

    #[serde(default)]
    pub ollama: OllamaSettings,
}

/// OpenAI connection settings. Unset fields fall back to the usual `OPENAI_*` variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub organization: Option<String>,

    #[serde(default)]
    pub project: Option<String>,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            organization: None,
            project: None,
            api_key_env: default_api_key_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaSettings {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
}

fn default_ollama_base_url() -> String {
    crate::provider::ollama::DEFAULT_BASE_URL.to_string()
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
        }
    }
}

impl RunnerConfig {
    /// Validate the complete configuration
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut errors = Vec::new();
        if self.runner.runs_root.as_os_str().is_empty() {
            errors.push("runner.runs_root must not be empty".to_string());
        }
        if self.runner.default_max_in_flight == 0 {
            errors.push("runner.default_max_in_flight must be at least 1".to_string());
        }
        if self.runner.request_timeout_secs == 0 {
            errors.push("runner.request_timeout_secs must be at least 1".to_string());
        }
        if self.providers.openai.api_key_env.trim().is_empty() {
            errors.push("providers.openai.api_key_env must not be empty".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Configuration(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }

    /// `runs_root` resolved against the workspace.
    pub fn runs_root(&self, workspace_root: &Path) -> PathBuf {
        if self.runner.runs_root.is_absolute() {
            self.runner.runs_root.clone()
        } else {
            workspace_root.join(&self.runner.runs_root)
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix("PROMPTLINE")
        .separator("__")
        .try_parsing(true)
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration layered for a workspace.
    pub fn load(workspace_root: &Path) -> Result<RunnerConfig, PipelineError> {
        let builder = merge::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let config: RunnerConfig = builder.add_source(environment()).build()?.try_deserialize()?;
        config.validate()?;
        debug!(workspace = %workspace_root.display(), "Loaded runner configuration");
        Ok(config)
    }

    /// Load configuration from one explicit file (plus environment overrides).
    pub fn load_from_file(path: &Path) -> Result<RunnerConfig, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::Configuration(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let config: RunnerConfig = merge::builder_with_defaults()?
            .add_source(config::File::from(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
