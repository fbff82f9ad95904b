//! OpenAI Responses API backend with batch support

use crate::config::OpenAiSettings;
use crate::error::BackendError;
use crate::provider::{
    build_http_client, map_http_error, status_error, BatchBackend, BatchHandle, BatchPoll,
    GenerateRequest, GenerationBackend,
};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const BATCH_ENDPOINT: &str = "/v1/responses";
const COMPLETION_WINDOW: &str = "24h";

pub struct OpenAiBackend {
    client: Client,
    timeout: Duration,
    base_url: String,
    api_key_env: String,
    organization: Option<String>,
    project: Option<String>,
}

impl OpenAiBackend {
    pub fn new(settings: &OpenAiSettings, request_timeout: Duration) -> Result<Self, BackendError> {
        let base_url = settings
            .base_url
            .clone()
            .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            client: build_http_client(request_timeout)?,
            timeout: request_timeout,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key_env: settings.api_key_env.clone(),
            organization: settings
                .organization
                .clone()
                .or_else(|| std::env::var("OPENAI_ORGANIZATION").ok()),
            project: settings
                .project
                .clone()
                .or_else(|| std::env::var("OPENAI_PROJECT").ok()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_key(&self) -> Result<String, BackendError> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                BackendError::NotConfigured(format!(
                    "{} is required when using the OpenAI provider.",
                    self.api_key_env
                ))
            })
    }

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, BackendError> {
        let mut builder = builder.bearer_auth(self.api_key()?);
        if let Some(organization) = &self.organization {
            builder = builder.header("OpenAI-Organization", organization);
        }
        if let Some(project) = &self.project {
            builder = builder.header("OpenAI-Project", project);
        }
        Ok(builder)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, BackendError> {
        let response = self
            .authorized(builder)?
            .send()
            .await
            .map_err(|e| map_http_error(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(
                status,
                format!("OpenAI request failed: {}", error_message(status.as_u16(), &body)),
            ));
        }
        Ok(response)
    }

    async fn send_json(&self, builder: RequestBuilder) -> Result<Value, BackendError> {
        self.send(builder)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("OpenAI response was not valid JSON: {}", e)))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Request body shared by direct calls and batch lines.
fn response_body(request: &GenerateRequest) -> Value {
    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert(
        "input".into(),
        json!([{ "role": "user", "content": request.prompt }]),
    );
    if let Some(temperature) = request.temperature {
        body.insert("temperature".into(), json!(temperature));
    }
    if let Some(effort) = request.reasoning_effort.as_deref().filter(|e| !e.is_empty()) {
        body.insert("reasoning".into(), json!({ "effort": effort }));
    }
    Value::Object(body)
}

/// Prefer the API's `error.message`, then the raw body, then the status code.
fn error_message(status: u16, body: &str) -> String {
    if body.trim().is_empty() {
        return format!("HTTP {}", status);
    }
    match serde_json::from_str::<Value>(body) {
        Ok(parsed) => parsed
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", status)),
        Err(_) => body.to_string(),
    }
}

/// Join the text parts of every `message` output item.
pub fn extract_response_text(payload: &Value) -> Result<String, BackendError> {
    let output = payload
        .get("output")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::InvalidResponse("OpenAI response missing 'output' list.".into()))?;

    let texts: Vec<&str> = output
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|part| {
            matches!(
                part.get("type").and_then(Value::as_str),
                Some("output_text") | Some("text")
            )
        })
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();

    if texts.is_empty() {
        return Err(BackendError::InvalidResponse(
            "OpenAI response contained no text output.".into(),
        ));
    }
    Ok(texts.join("\n"))
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn ensure_model(&self, model: &str) -> Result<(), BackendError> {
        if model.trim().is_empty() {
            return Err(BackendError::ModelNotFound(
                "OpenAI model name must be a non-empty string.".into(),
            ));
        }
        self.api_key().map(|_| ())
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        debug!(model = %request.model, prompt_chars = request.prompt.len(), "OpenAI generate");
        let payload = self
            .send_json(self.client.post(self.url("/responses")).json(&response_body(request)))
            .await?;
        extract_response_text(&payload)
    }

    fn batch(&self) -> Option<&dyn BatchBackend> {
        Some(self)
    }
}

#[async_trait]
impl BatchBackend for OpenAiBackend {
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, BackendError> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("application/jsonl")
            .map_err(|e| map_http_error(e, self.timeout))?;
        let form = Form::new().text("purpose", "batch").part("file", part);

        let payload = self
            .send_json(self.client.post(self.url("/files")).multipart(form))
            .await?;
        string_field(&payload, "id").ok_or_else(|| {
            BackendError::InvalidResponse("OpenAI file upload response missing 'id'.".into())
        })
    }

    async fn submit(
        &self,
        input_file_id: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<BatchHandle, BackendError> {
        let mut body = json!({
            "input_file_id": input_file_id,
            "endpoint": BATCH_ENDPOINT,
            "completion_window": COMPLETION_WINDOW,
        });
        if !metadata.is_empty() {
            body["metadata"] = json!(metadata);
        }

        let payload = self
            .send_json(self.client.post(self.url("/batches")).json(&body))
            .await?;
        let id = string_field(&payload, "id").ok_or_else(|| {
            BackendError::InvalidResponse("OpenAI batch response missing 'id'.".into())
        })?;
        Ok(BatchHandle {
            id,
            status: string_field(&payload, "status"),
        })
    }

    async fn poll(&self, batch_id: &str) -> Result<BatchPoll, BackendError> {
        let payload = self
            .send_json(self.client.get(self.url(&format!("/batches/{}", batch_id))))
            .await?;
        Ok(BatchPoll {
            status: string_field(&payload, "status").unwrap_or_else(|| "unknown".to_string()),
            output_file_id: string_field(&payload, "output_file_id"),
            error_file_id: string_field(&payload, "error_file_id"),
        })
    }

    async fn download(&self, file_id: &str) -> Result<String, BackendError> {
        self.send(self.client.get(self.url(&format!("/files/{}/content", file_id))))
            .await?
            .text()
            .await
            .map_err(|e| map_http_error(e, self.timeout))
    }

    fn extract_text(&self, body: &Value) -> Result<String, BackendError> {
        extract_response_text(body)
    }

    fn encode_request(&self, custom_id: &str, request: &GenerateRequest) -> Value {
        json!({
            "custom_id": custom_id,
            "method": "POST",
            "url": BATCH_ENDPOINT,
            "body": response_body(request),
        })
    }
}
