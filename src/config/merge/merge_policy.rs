//! Merge rules: built-in defaults for every layered key.

use crate::provider::ollama;
use config::builder::DefaultState;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("runner.runs_root", "runs")?
        .set_default("runner.default_max_in_flight", 4)?
        .set_default("runner.request_timeout_secs", 300)?
        .set_default("providers.openai.api_key_env", "OPENAI_API_KEY")?
        .set_default("providers.ollama.base_url", ollama::DEFAULT_BASE_URL)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stderr")
}

