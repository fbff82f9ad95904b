//! Pipeline Model
//!
//! Immutable, validated description of an ordered list of prompt stages. Pipelines are
//! normally produced by [`load_pipeline`]; the runner re-validates whatever it is handed.

use crate::context::template::Template;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

mod loader;

pub use loader::{load_pipeline, parse_pipeline};

/// Format of a stage's final artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Markdown,
    Json,
}

impl OutputFormat {
    pub fn file_name(self) -> &'static str {
        match self {
            OutputFormat::Markdown => "output.md",
            OutputFormat::Json => "output.json",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Json => "json",
        }
    }
}

/// Whether a stage runs once or once per item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    Single,
    Map,
}

impl StageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StageMode::Single => "single",
            StageMode::Map => "map",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Text,
    Json,
}

/// A named input file bound into a stage's template
#[derive(Debug, Clone, PartialEq)]
pub struct InputBinding {
    pub path: PathBuf,
    pub kind: InputKind,
}

/// Where a map stage draws its items from
#[derive(Debug, Clone, PartialEq)]
pub enum MapSource {
    /// Structured output of an upstream stage
    Stage(String),
    /// External file, resolved relative to the pipeline file
    File(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConcurrencySettings {
    pub enabled: bool,
    pub max_in_flight: Option<usize>,
}

/// One unit of work in a pipeline
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: String,
    pub prompt: String,
    pub provider: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub reasoning_effort: Option<String>,
    pub enabled: bool,
    pub output: OutputFormat,
    pub mode: StageMode,
    pub map_source: Option<MapSource>,
    pub concurrency: ConcurrencySettings,
    pub batch: bool,
    pub publish: bool,
    pub inputs: BTreeMap<String, InputBinding>,
}

impl Stage {
    pub fn is_map(&self) -> bool {
        self.mode == StageMode::Map
    }

    pub fn map_from(&self) -> Option<&str> {
        match &self.map_source {
            Some(MapSource::Stage(id)) => Some(id.as_str()),
            _ => None,
        }
    }

    pub fn map_from_file(&self) -> Option<&Path> {
        match &self.map_source {
            Some(MapSource::File(path)) => Some(path.as_path()),
            _ => None,
        }
    }

    /// File name of the stage-level artifact. Map stages always write a JSON manifest.
    pub fn output_file_name(&self) -> &'static str {
        if self.is_map() {
            OutputFormat::Json.file_name()
        } else {
            self.output.file_name()
        }
    }

    pub fn template(&self) -> Result<Template, PipelineError> {
        Template::parse(&self.prompt).map_err(|e| match e {
            PipelineError::Configuration(msg) => {
                PipelineError::Configuration(format!("Stage '{}' prompt: {}", self.id, msg))
            }
            other => other,
        })
    }

    /// Upstream stages this stage reads: template references plus the map source.
    pub fn dependencies(&self) -> Result<BTreeSet<String>, PipelineError> {
        let mut deps = self.template()?.stage_references();
        if self.is_map() {
            if let Some(source) = self.map_from() {
                deps.insert(source.to_string());
            }
        }
        Ok(deps)
    }
}

/// An ordered, validated list of stages plus pipeline-level defaults
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub provider: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub reasoning_effort: Option<String>,
    pub stages: Vec<Stage>,
    /// Path of the pipeline definition; relative input paths resolve against its parent.
    pub path: PathBuf,
}

impl Pipeline {
    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn index_of(&self, stage_id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == stage_id)
    }

    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn base_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Stages whose outputs get published: every enabled `publish` stage, else the
    /// last enabled stage.
    pub fn publish_targets(&self) -> Vec<&Stage> {
        let marked: Vec<&Stage> = self
            .stages
            .iter()
            .filter(|s| s.publish && s.enabled)
            .collect();
        if !marked.is_empty() {
            return marked;
        }
        self.stages
            .iter()
            .rev()
            .find(|s| s.enabled)
            .into_iter()
            .collect()
    }

    /// Structural validation. Malformed definitions are configuration errors; references
    /// to stages that do not run earlier are dependency errors. Backend capability
    /// checks happen at stage-plan time.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "Field 'name' must be a non-empty string.".to_string(),
            ));
        }
        if self.stages.is_empty() {
            return Err(PipelineError::Configuration(
                "Pipeline must include a non-empty 'stages' list.".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if !seen.insert(stage.id.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "Stage ids must be unique; '{}' appears more than once.",
                    stage.id
                )));
            }
            validate_stage(self, index, stage)?;
        }
        Ok(())
    }
}

fn validate_stage(pipeline: &Pipeline, index: usize, stage: &Stage) -> Result<(), PipelineError> {
    let id = &stage.id;
    if id.trim().is_empty() {
        return Err(PipelineError::Configuration(
            "Field 'stages.id' must be a non-empty string.".to_string(),
        ));
    }
    if stage.prompt.trim().is_empty() {
        return Err(PipelineError::Configuration(format!(
            "Field 'stages[{}].prompt' must be a non-empty string.",
            id
        )));
    }
    if stage.model.trim().is_empty() {
        return Err(PipelineError::Configuration(format!(
            "Field 'stages[{}].model' must be a non-empty string.",
            id
        )));
    }
    if stage.provider.trim().is_empty() {
        return Err(PipelineError::Configuration(format!(
            "Field 'stages[{}].provider' must be a non-empty string.",
            id
        )));
    }

    stage.template()?;

    match (stage.mode, &stage.map_source) {
        (StageMode::Map, None) => {
            return Err(PipelineError::Configuration(format!(
                "Map stage '{}' is missing map_from or map_from_file.",
                id
            )));
        }
        (StageMode::Single, Some(_)) => {
            return Err(PipelineError::Configuration(format!(
                "Stage '{}' sets a map source but is not mode 'map'.",
                id
            )));
        }
        (StageMode::Map, Some(MapSource::Stage(source))) => {
            match pipeline.index_of(source) {
                None => {
                    return Err(PipelineError::Dependency(format!(
                        "Map stage '{}' references unknown stage '{}'.",
                        id, source
                    )));
                }
                Some(source_index) if source_index >= index => {
                    return Err(PipelineError::Dependency(format!(
                        "Map stage '{}' must reference an upstream stage.",
                        id
                    )));
                }
                Some(_) => {}
            }
        }
        _ => {}
    }

    if stage.batch && stage.concurrency.enabled {
        return Err(PipelineError::Configuration(format!(
            "Stage '{}' cannot enable both batch and concurrency.",
            id
        )));
    }
    if stage.batch && !stage.is_map() {
        return Err(PipelineError::Configuration(format!(
            "Stage '{}' enables batch but batch mode only applies to map stages.",
            id
        )));
    }
    if stage.concurrency.max_in_flight == Some(0) {
        return Err(PipelineError::Configuration(format!(
            "Stage '{}' concurrency.max_in_flight must be >= 1.",
            id
        )));
    }

    for reference in stage.template()?.stage_references() {
        match pipeline.index_of(&reference) {
            None => {
                return Err(PipelineError::Dependency(format!(
                    "Stage '{}' references unknown stage '{}'.",
                    id, reference
                )));
            }
            Some(ref_index) if ref_index >= index => {
                return Err(PipelineError::Dependency(format!(
                    "Stage '{}' references stage '{}' which does not run before it.",
                    id, reference
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}
