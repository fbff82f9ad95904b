//! Shared fakes and helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use promptline::error::BackendError;
use promptline::pipeline::{parse_pipeline, Pipeline};
use promptline::provider::{
    BackendRegistry, BatchBackend, BatchHandle, BatchPoll, GenerateRequest, GenerationBackend,
};
use promptline::runner::{RunOptions, Runner};
use promptline::store::{ArtifactStore, MemoryArtifactStore, RunRecord, StateStore};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

enum Rule {
    Respond(String),
    Fail(String),
}

/// Synchronous backend with scripted answers. Unmatched prompts echo back.
pub struct FakeBackend {
    name: String,
    rules: Vec<(String, Rule)>,
    latency: Option<Box<dyn Fn(&str) -> Duration + Send + Sync>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
            latency: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Answer prompts containing `needle` with `text`.
    pub fn respond(mut self, needle: &str, text: &str) -> Self {
        self.rules
            .push((needle.to_string(), Rule::Respond(text.to_string())));
        self
    }

    /// Fail prompts containing `needle`.
    pub fn fail(mut self, needle: &str, message: &str) -> Self {
        self.rules
            .push((needle.to_string(), Rule::Fail(message.to_string())));
        self
    }

    /// Sleep before answering, per prompt.
    pub fn latency(mut self, delay: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        self.latency = Some(Box::new(delay));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_model(&self, _model: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        self.calls.lock().push(request.prompt.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = &self.latency {
            tokio::time::sleep(delay(&request.prompt)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        for (needle, rule) in &self.rules {
            if request.prompt.contains(needle.as_str()) {
                return match rule {
                    Rule::Respond(text) => Ok(text.clone()),
                    Rule::Fail(message) => Err(BackendError::RequestFailed(message.clone())),
                };
            }
        }
        Ok(format!("echo: {}", request.prompt))
    }
}

/// Batch-capable backend whose remote job is driven by the test.
pub struct FakeBatchBackend {
    name: String,
    status: Mutex<String>,
    output_lines: Mutex<Vec<String>>,
    error_lines: Mutex<Vec<String>>,
    uploads: Mutex<Vec<String>>,
    submissions: AtomicUsize,
    generate_calls: AtomicUsize,
}

impl FakeBatchBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: Mutex::new("in_progress".to_string()),
            output_lines: Mutex::new(Vec::new()),
            error_lines: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            submissions: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_status(&self, status: &str) {
        *self.status.lock() = status.to_string();
    }

    pub fn push_output(&self, line: String) {
        self.output_lines.lock().push(line);
    }

    pub fn push_error(&self, line: String) {
        self.error_lines.lock().push(line);
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Parsed lines of every uploaded request file.
    pub fn uploaded_requests(&self) -> Vec<Value> {
        self.uploads
            .lock()
            .iter()
            .flat_map(|content| {
                content
                    .lines()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect::<Vec<Value>>()
            })
            .collect()
    }

    /// Custom ids and prompts of the uploaded requests.
    pub fn uploaded_prompts(&self) -> Vec<(String, String)> {
        self.uploaded_requests()
            .iter()
            .map(|line| {
                (
                    line["custom_id"].as_str().unwrap_or_default().to_string(),
                    line["body"]["prompt"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

/// A successful result line in the fake provider's format.
pub fn batch_result_line(custom_id: &str, text: &str) -> String {
    json!({
        "custom_id": custom_id,
        "response": { "status_code": 200, "body": { "text": text } },
        "error": null,
    })
    .to_string()
}

#[async_trait]
impl GenerationBackend for FakeBatchBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_model(&self, _model: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("sync: {}", request.prompt))
    }

    fn batch(&self) -> Option<&dyn BatchBackend> {
        Some(self)
    }
}

#[async_trait]
impl BatchBackend for FakeBatchBackend {
    async fn upload(&self, _file_name: &str, bytes: Vec<u8>) -> Result<String, BackendError> {
        let content = String::from_utf8(bytes)
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        let mut uploads = self.uploads.lock();
        uploads.push(content);
        Ok(format!("file_in_{}", uploads.len()))
    }

    async fn submit(
        &self,
        input_file_id: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<BatchHandle, BackendError> {
        assert!(metadata.contains_key("stage_id"));
        assert!(metadata.contains_key("run_id"));
        let count = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(BatchHandle {
            id: format!("batch_{}_{}", count, input_file_id),
            status: Some("validating".to_string()),
        })
    }

    async fn poll(&self, _batch_id: &str) -> Result<BatchPoll, BackendError> {
        let status = self.status.lock().clone();
        let completed = status == "completed";
        let has_errors = !self.error_lines.lock().is_empty();
        Ok(BatchPoll {
            status,
            output_file_id: completed.then(|| "file_out".to_string()),
            error_file_id: (completed && has_errors).then(|| "file_err".to_string()),
        })
    }

    async fn download(&self, file_id: &str) -> Result<String, BackendError> {
        let lines = match file_id {
            "file_out" => self.output_lines.lock().clone(),
            "file_err" => self.error_lines.lock().clone(),
            other => return Err(BackendError::ModelNotFound(other.to_string())),
        };
        Ok(lines.join("\n"))
    }

    fn extract_text(&self, body: &Value) -> Result<String, BackendError> {
        body.get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::InvalidResponse("missing text".to_string()))
    }

    fn encode_request(&self, custom_id: &str, request: &GenerateRequest) -> Value {
        json!({
            "custom_id": custom_id,
            "body": { "model": request.model, "prompt": request.prompt },
        })
    }
}

/// Erase a fake into the trait object the registry stores.
pub fn dynamic<B: GenerationBackend + 'static>(backend: &Arc<B>) -> Arc<dyn GenerationBackend> {
    backend.clone()
}

/// Registry with each backend registered under its own name.
pub fn registry_with(backends: Vec<Arc<dyn GenerationBackend>>) -> Arc<BackendRegistry> {
    let registry = BackendRegistry::default();
    for backend in backends {
        registry.register(backend.name().to_string(), backend);
    }
    Arc::new(registry)
}

pub fn runner_with(runs_root: &Path, backends: Vec<Arc<dyn GenerationBackend>>) -> Runner {
    Runner::new(runs_root, registry_with(backends))
        .with_request_timeout(Duration::from_secs(5))
}

/// Parse pipeline YAML anchored at `/work/<name>.yml`.
pub fn pipeline(yaml: &str) -> Pipeline {
    parse_pipeline(yaml, Path::new("/work/pipeline.yml")).expect("pipeline parses")
}

/// Write pipeline YAML into `dir` and load it from disk.
pub fn pipeline_file(dir: &Path, yaml: &str) -> (PathBuf, Pipeline) {
    let path = dir.join("pipeline.yml");
    std::fs::write(&path, yaml).expect("write pipeline");
    let pipeline = promptline::pipeline::load_pipeline(&path).expect("pipeline loads");
    (path, pipeline)
}

/// An in-memory run directory plus a handle for inspecting it.
pub struct MemoryRun {
    pub store: Arc<MemoryArtifactStore>,
}

impl MemoryRun {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryArtifactStore::new("/runs/run_mem")),
        }
    }

    pub fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        self.store.clone()
    }

    pub fn state(&self) -> StateStore {
        StateStore::new(self.artifacts())
    }

    pub fn run_record(&self) -> RunRecord {
        self.state()
            .get_run()
            .expect("readable run record")
            .expect("run record exists")
    }

    pub fn text(&self, path: &str) -> Option<String> {
        self.state().read_text(Path::new(path)).expect("readable artifact")
    }

    pub fn json(&self, path: &str) -> Option<Value> {
        self.state().read_json(Path::new(path)).expect("readable artifact")
    }

    pub fn exists(&self, path: &str) -> bool {
        self.store.exists(Path::new(path)).expect("exists check")
    }

    pub fn paths(&self) -> Vec<String> {
        self.store
            .paths()
            .iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.text("run.log")
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub async fn run(
        &self,
        runner: &Runner,
        pipeline: &Pipeline,
        params: &[(&str, &str)],
        options: RunOptions,
    ) -> Result<PathBuf, promptline::error::PipelineError> {
        let params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        runner
            .run_in_store(self.artifacts(), pipeline, params, options)
            .await
    }
}

/// Options that resume from `stage` onward.
pub fn from_stage(stage: &str) -> RunOptions {
    RunOptions {
        start_stage: Some(stage.to_string()),
        ..RunOptions::default()
    }
}

pub fn stop_after(stage: &str) -> RunOptions {
    RunOptions {
        stop_after: Some(stage.to_string()),
        ..RunOptions::default()
    }
}

pub fn only(stage: &str) -> RunOptions {
    RunOptions {
        stage_only: Some(stage.to_string()),
        ..RunOptions::default()
    }
}

pub fn with_concurrency(n: usize) -> RunOptions {
    RunOptions {
        concurrency_override: Some(n),
        ..RunOptions::default()
    }
}

/// Backend call counts keyed by prompt.
pub fn count_by_prompt(calls: &[String]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for call in calls {
        *counts.entry(call.clone()).or_insert(0) += 1;
    }
    counts
}
