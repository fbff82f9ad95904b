//! Ollama provider client (local models)

use crate::config::OllamaSettings;
use crate::error::BackendError;
use crate::provider::{build_http_client, map_http_error, status_error, GenerateRequest, GenerationBackend};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaBackend {
    client: Client,
    timeout: Duration,
    base_url: String,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f64,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct ModelInfo {
    name: String,
}

impl OllamaBackend {
    pub fn new(settings: &OllamaSettings, request_timeout: Duration) -> Result<Self, BackendError> {
        Ok(Self {
            client: build_http_client(request_timeout)?,
            timeout: request_timeout,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn unreachable(&self, error: reqwest::Error) -> BackendError {
        if error.is_connect() {
            BackendError::RequestFailed(format!(
                "Failed to reach Ollama at {}. Is the Ollama server running?",
                self.base_url
            ))
        } else {
            map_http_error(error, self.timeout)
        }
    }

    pub async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(status_error(status, error_text));
        }

        let tags: TagsResponse = response.json().await.map_err(|e| {
            BackendError::InvalidResponse(format!("Failed to parse models response: {}", e))
        })?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

/// Ollama tags may carry an implicit `:latest` suffix.
fn model_matches(available: &str, wanted: &str) -> bool {
    available == wanted || available.strip_suffix(":latest") == Some(wanted)
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn ensure_model(&self, model: &str) -> Result<(), BackendError> {
        let models = self.list_models().await?;
        if models.iter().any(|available| model_matches(available, model)) {
            Ok(())
        } else {
            Err(BackendError::ModelNotFound(format!(
                "Model '{}' is not available in Ollama. Pull it with `ollama pull {}`.",
                model, model
            )))
        }
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            stream: false,
            options: request
                .temperature
                .map(|temperature| GenerateOptions { temperature }),
        };

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(status_error(status, error_text));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|_| {
            BackendError::InvalidResponse("Ollama response was not valid JSON.".into())
        })?;
        parsed.response.ok_or_else(|| {
            BackendError::InvalidResponse("Ollama response missing 'response' field.".into())
        })
    }
}
