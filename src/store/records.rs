//! Persisted record shapes: run, stage, item, map manifest and batch state.

use crate::context::SourceMeta;
use crate::pipeline::{OutputFormat, Stage, StageMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Completed,
    CompletedWithErrors,
    Stopped,
    BatchPending,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Completed,
    CompletedWithErrors,
    Skipped,
    Failed,
    BatchSubmitted,
    BatchPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Started,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Serial,
    Concurrent,
    Batch,
}

macro_rules! display_as_serde_name {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match serde_json::to_value(self) {
                    Ok(Value::String(name)) => f.write_str(&name),
                    _ => write!(f, "{:?}", self),
                }
            }
        }
    )*};
}

display_as_serde_name!(RunStatus, StageStatus, ItemStatus, ExecutionMode);

/// One published artifact, path relative to the run root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedArtifact {
    pub stage_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub output_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub published_at: DateTime<Utc>,
    pub path: String,
    pub artifacts: Vec<PublishedArtifact>,
}

/// `run.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub pipeline: String,
    pub pipeline_provider: String,
    pub pipeline_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_reasoning_effort: Option<String>,
    pub pipeline_path: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub status: RunStatus,
    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_pending_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PublishRecord>,
}

/// `stages/<id>/stage.json`, mirrored into the run record's stage map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_id: String,
    pub status: StageStatus,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    pub enabled: bool,
    pub output: OutputFormat,
    pub mode: StageMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_from_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_source: Option<SourceMeta>,
    pub publish: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_total: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_completed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_failed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_skipped: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    /// A record carrying the stage's resolved settings and `status`.
    pub fn for_stage(stage: &Stage, status: StageStatus) -> Self {
        Self {
            stage_id: stage.id.clone(),
            status,
            provider: stage.provider.clone(),
            model: stage.model.clone(),
            temperature: stage.temperature,
            reasoning_effort: stage.reasoning_effort.clone(),
            enabled: stage.enabled,
            output: stage.output,
            mode: stage.mode,
            map_from: stage.map_from().map(str::to_string),
            map_from_file: stage.map_from_file().map(|p| p.display().to_string()),
            map_source: None,
            publish: stage.publish,
            execution_mode: None,
            max_in_flight: None,
            items_total: None,
            items_completed: None,
            items_failed: None,
            items_skipped: None,
            batch_id: None,
            batch_status: None,
            error: None,
            error_path: None,
            dependency: None,
            skip_reason: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            skipped_at: None,
            updated_at: None,
        }
    }
}

/// `stages/<id>/items/<item>/stage.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub stage_id: String,
    pub item_id: String,
    pub item_index: usize,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_at: Option<DateTime<Utc>>,
}

impl ItemRecord {
    pub fn new(stage_id: &str, item_id: &str, item_index: usize, status: ItemStatus) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            item_id: item_id.to_string(),
            item_index,
            status,
            provider: None,
            model: None,
            temperature: None,
            reasoning_effort: None,
            execution_mode: None,
            max_in_flight: None,
            output: None,
            prompt: None,
            custom_id: None,
            started_at: None,
            submitted_at: None,
            completed_at: None,
            failed_at: None,
            skipped_at: None,
        }
    }

    /// Record for an item about to be sent with `stage`'s settings.
    pub fn for_request(
        stage: &Stage,
        item_id: &str,
        item_index: usize,
        status: ItemStatus,
        mode: ExecutionMode,
        prompt: &str,
    ) -> Self {
        Self {
            provider: Some(stage.provider.clone()),
            model: Some(stage.model.clone()),
            temperature: stage.temperature,
            reasoning_effort: stage.reasoning_effort.clone(),
            execution_mode: Some(mode),
            output: Some(stage.output),
            prompt: Some(prompt.to_string()),
            ..Self::new(&stage.id, item_id, item_index, status)
        }
    }
}

/// One entry of a map stage manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub selected: bool,
    pub status: ItemStatus,
    pub item: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_path: Option<String>,
}

impl ManifestEntry {
    pub fn new(id: &str, selected: bool, status: ItemStatus, item: &Map<String, Value>) -> Self {
        Self {
            id: id.to_string(),
            selected,
            status,
            item: item.clone(),
            output_path: None,
            raw_path: None,
            error: None,
            error_path: None,
        }
    }
}

/// `stages/<id>/output.json` for map stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageManifest {
    pub items: Vec<ManifestEntry>,
    pub map_from: Option<String>,
    pub map_from_file: Option<String>,
}

impl StageManifest {
    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|e| e.status == status).count()
    }
}

/// Correlates one batch request line to its item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequestEntry {
    pub custom_id: String,
    pub item_id: String,
    pub item_index: usize,
    pub item: Map<String, Value>,
}

/// `support/stages/<id>/batch.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: String,
    pub input_file_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub requests: Vec<BatchRequestEntry>,
}
