//! Error types for the promptline pipeline runner.

use std::path::PathBuf;
use thiserror::Error;

/// Run-state storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{label} contained invalid JSON: {path}: {detail}")]
    InvalidJson {
        label: String,
        path: PathBuf,
        detail: String,
    },

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_json(
        label: impl Into<String>,
        path: impl Into<PathBuf>,
        err: &serde_json::Error,
    ) -> Self {
        StorageError::InvalidJson {
            label: label.into(),
            path: path.into(),
            detail: err.to_string(),
        }
    }
}

/// Generation backend errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend not configured: {0}")]
    NotConfigured(String),

    #[error("Backend authentication failed: {0}")]
    AuthFailed(String),

    #[error("Backend rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Backend model not found: {0}")]
    ModelNotFound(String),

    #[error("Backend request failed: {0}")]
    RequestFailed(String),

    #[error("Backend request timed out after {0}s")]
    Timeout(u64),

    #[error("Backend returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Backend operation unsupported: {0}")]
    Unsupported(String),
}

/// Errors raised while validating or executing a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Output format error: {0}")]
    OutputFormat(String),

    #[error("Batch for stage '{stage_id}' failed with status '{status}'.")]
    BatchTerminal { stage_id: String, status: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PipelineError {
    /// Short machine-friendly label written into run records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration",
            PipelineError::Dependency(_) => "dependency",
            PipelineError::Backend(_) => "backend",
            PipelineError::OutputFormat(_) => "output_format",
            PipelineError::BatchTerminal { .. } => "batch_terminal",
            PipelineError::Storage(_) => "storage",
        }
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Configuration(err.to_string())
    }
}
