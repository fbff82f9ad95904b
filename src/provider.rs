//! Generation Backends
//!
//! A backend turns a rendered prompt into text. Backends that can also run asynchronous
//! bulk jobs expose a [`BatchBackend`] through [`GenerationBackend::batch`]. Backends are
//! resolved by provider name through the [`BackendRegistry`].

use crate::error::BackendError;
use crate::pipeline::Stage;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

pub mod ollama;
pub mod openai;
pub mod registry;

pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;
pub use registry::BackendRegistry;

/// One generation call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

impl GenerateRequest {
    pub fn for_stage(stage: &Stage, prompt: impl Into<String>) -> Self {
        Self {
            model: stage.model.clone(),
            prompt: prompt.into(),
            temperature: stage.temperature,
            reasoning_effort: stage.reasoning_effort.clone(),
        }
    }
}

/// A submitted batch job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHandle {
    pub id: String,
    pub status: Option<String>,
}

/// Current state of a batch job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPoll {
    pub status: String,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
}

impl BatchPoll {
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self.status.as_str(),
            "failed" | "expired" | "canceled" | "cancelled"
        )
    }

    /// Results can be downloaded.
    pub fn is_ready(&self) -> bool {
        self.status == "completed" && self.output_file_id.is_some()
    }
}

/// Model provider client trait
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Provider name as written in pipeline files
    fn name(&self) -> &str;

    /// Fail early when `model` cannot be served.
    async fn ensure_model(&self, model: &str) -> Result<(), BackendError>;

    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError>;

    /// Batch capability, when the provider has one.
    fn batch(&self) -> Option<&dyn BatchBackend> {
        None
    }
}

/// Asynchronous bulk generation: upload a request file, submit, poll, download.
#[async_trait]
pub trait BatchBackend: Send + Sync {
    /// Upload request lines and return the provider's file id.
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, BackendError>;

    async fn submit(
        &self,
        input_file_id: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<BatchHandle, BackendError>;

    async fn poll(&self, batch_id: &str) -> Result<BatchPoll, BackendError>;

    /// Raw content of a result file (JSON lines).
    async fn download(&self, file_id: &str) -> Result<String, BackendError>;

    /// Generated text inside one result body.
    fn extract_text(&self, body: &Value) -> Result<String, BackendError>;

    /// One request line of the batch input file.
    fn encode_request(&self, custom_id: &str, request: &GenerateRequest) -> Value;
}

// Map transport errors to BackendError
pub(crate) fn map_http_error(error: reqwest::Error, timeout: Duration) -> BackendError {
    if let Some(status) = error.status() {
        return status_error(status, error.to_string());
    }
    if error.is_timeout() {
        BackendError::Timeout(timeout.as_secs())
    } else if error.is_connect() {
        BackendError::RequestFailed(format!("Connection error: {}", error))
    } else {
        BackendError::RequestFailed(format!("HTTP error: {}", error))
    }
}

pub(crate) fn status_error(status: StatusCode, message: String) -> BackendError {
    match status.as_u16() {
        401 | 403 => BackendError::AuthFailed(format!("Authentication failed: {}", message)),
        429 => BackendError::RateLimit(format!("Rate limit exceeded: {}", message)),
        404 => BackendError::ModelNotFound(format!("Not found: {}", message)),
        _ => BackendError::RequestFailed(format!(
            "Request failed with status {}: {}",
            status, message
        )),
    }
}

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn build_http_client(request_timeout: Duration) -> Result<Client, BackendError> {
    Client::builder()
        .no_proxy()
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .build()
        .map_err(|e| BackendError::NotConfigured(format!("Failed to create HTTP client: {}", e)))
}
