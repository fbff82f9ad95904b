//! YAML pipeline loading: raw serde shapes, defaults, then validation.

use super::{
    ConcurrencySettings, InputBinding, InputKind, MapSource, OutputFormat, Pipeline, Stage,
    StageMode,
};
use crate::error::PipelineError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_PROVIDER: &str = "ollama";

#[derive(Debug, Deserialize)]
struct RawPipeline {
    name: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    temperature: Option<f64>,
    reasoning_effort: Option<String>,
    stages: Option<Vec<serde_yaml::Value>>,
}

#[derive(Debug, Deserialize)]
struct RawStage {
    id: Option<String>,
    prompt: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    temperature: Option<f64>,
    reasoning_effort: Option<String>,
    enabled: Option<bool>,
    output: Option<String>,
    mode: Option<String>,
    map_from: Option<String>,
    map_from_file: Option<String>,
    concurrency: Option<RawConcurrency>,
    batch: Option<bool>,
    publish: Option<bool>,
    #[serde(default)]
    inputs: BTreeMap<String, RawInput>,
}

/// `concurrency: true` or `concurrency: { enabled, max_in_flight }`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawConcurrency {
    Flag(bool),
    Settings {
        enabled: Option<bool>,
        max_in_flight: Option<usize>,
    },
}

/// `name: path` or `name: { path, kind }`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInput {
    Path(String),
    Binding { path: String, kind: Option<String> },
}

/// Load and validate a pipeline definition from a YAML file.
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<Pipeline, PipelineError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(PipelineError::Configuration(format!(
            "Pipeline file not found: {}",
            path.display()
        )));
    }
    let canonical = dunce::canonicalize(path).map_err(|e| {
        PipelineError::Configuration(format!(
            "Failed to resolve pipeline path {}: {}",
            path.display(),
            e
        ))
    })?;
    let source = std::fs::read_to_string(&canonical).map_err(|e| {
        PipelineError::Configuration(format!(
            "Failed to read pipeline file {}: {}",
            canonical.display(),
            e
        ))
    })?;
    let pipeline = parse_pipeline(&source, &canonical)?;
    debug!(
        pipeline = %pipeline.name,
        stages = pipeline.stages.len(),
        path = %canonical.display(),
        "Loaded pipeline"
    );
    Ok(pipeline)
}

/// Parse and validate pipeline YAML. `path` anchors relative input paths and supplies
/// the default pipeline name.
pub fn parse_pipeline(source: &str, path: &Path) -> Result<Pipeline, PipelineError> {
    let document: serde_yaml::Value = serde_yaml::from_str(source)
        .map_err(|e| PipelineError::Configuration(format!("Invalid pipeline YAML: {}", e)))?;
    if !document.is_mapping() {
        return Err(PipelineError::Configuration(
            "Pipeline YAML must be a mapping.".to_string(),
        ));
    }
    let raw: RawPipeline = serde_yaml::from_value(document)
        .map_err(|e| PipelineError::Configuration(format!("Invalid pipeline YAML: {}", e)))?;

    let default_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = require_str(raw.name.unwrap_or(default_name), "name")?;
    let model = require_str(raw.model.unwrap_or_default(), "model")?;
    let provider = require_str(
        raw.provider.unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
        "provider",
    )?;

    let stages_raw = match raw.stages {
        Some(stages) if !stages.is_empty() => stages,
        _ => {
            return Err(PipelineError::Configuration(
                "Pipeline must include a non-empty 'stages' list.".to_string(),
            ))
        }
    };

    let defaults = StageDefaults {
        provider: &provider,
        model: &model,
        temperature: raw.temperature,
        reasoning_effort: raw.reasoning_effort.as_deref(),
    };

    let mut stages = Vec::with_capacity(stages_raw.len());
    for (idx, value) in stages_raw.into_iter().enumerate() {
        let position = idx + 1;
        if !value.is_mapping() {
            return Err(PipelineError::Configuration(format!(
                "Stage {} must be a mapping.",
                position
            )));
        }
        let raw_stage: RawStage = serde_yaml::from_value(value).map_err(|e| {
            PipelineError::Configuration(format!("Stage {} is invalid: {}", position, e))
        })?;
        stages.push(build_stage(raw_stage, position, &defaults)?);
    }

    let pipeline = Pipeline {
        name,
        provider: provider.clone(),
        model: model.clone(),
        temperature: raw.temperature,
        reasoning_effort: raw.reasoning_effort,
        stages,
        path: path.to_path_buf(),
    };
    pipeline.validate()?;
    Ok(pipeline)
}

struct StageDefaults<'a> {
    provider: &'a str,
    model: &'a str,
    temperature: Option<f64>,
    reasoning_effort: Option<&'a str>,
}

fn build_stage(
    raw: RawStage,
    position: usize,
    defaults: &StageDefaults<'_>,
) -> Result<Stage, PipelineError> {
    let id = require_str(
        raw.id.unwrap_or_else(|| format!("stage_{}", position)),
        "stages.id",
    )?;
    let prompt = require_str(
        raw.prompt.unwrap_or_default(),
        &format!("stages[{}].prompt", id),
    )?;
    let model = require_str(
        raw.model.unwrap_or_else(|| defaults.model.to_string()),
        &format!("stages[{}].model", id),
    )?;
    let provider = require_str(
        raw.provider
            .unwrap_or_else(|| defaults.provider.to_string())
            .to_lowercase(),
        &format!("stages[{}].provider", id),
    )?;

    let output = match raw.output.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("markdown") => OutputFormat::Markdown,
        Some("json") => OutputFormat::Json,
        Some(other) => {
            return Err(PipelineError::Configuration(format!(
                "Stage '{}' output must be 'markdown' or 'json', got '{}'.",
                id, other
            )))
        }
    };
    let mode = match raw.mode.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("single") => StageMode::Single,
        Some("map") => StageMode::Map,
        Some(other) => {
            return Err(PipelineError::Configuration(format!(
                "Stage '{}' mode must be 'single' or 'map', got '{}'.",
                id, other
            )))
        }
    };

    let map_source = match (raw.map_from, raw.map_from_file) {
        (Some(_), Some(_)) => {
            return Err(PipelineError::Configuration(format!(
                "Map stage '{}' must set only one of map_from or map_from_file.",
                id
            )))
        }
        (Some(stage), None) => Some(MapSource::Stage(stage)),
        (None, Some(file)) => Some(MapSource::File(PathBuf::from(file))),
        (None, None) => None,
    };

    let concurrency = match raw.concurrency {
        None => ConcurrencySettings::default(),
        Some(RawConcurrency::Flag(enabled)) => ConcurrencySettings {
            enabled,
            max_in_flight: None,
        },
        Some(RawConcurrency::Settings {
            enabled,
            max_in_flight,
        }) => ConcurrencySettings {
            enabled: enabled.unwrap_or(true),
            max_in_flight,
        },
    };

    let mut inputs = BTreeMap::new();
    for (name, input) in raw.inputs {
        let binding = match input {
            RawInput::Path(path) => InputBinding {
                path: PathBuf::from(path),
                kind: InputKind::Text,
            },
            RawInput::Binding { path, kind } => {
                let kind = match kind.as_deref().map(str::to_lowercase).as_deref() {
                    None | Some("text") => InputKind::Text,
                    Some("json") => InputKind::Json,
                    Some(other) => {
                        return Err(PipelineError::Configuration(format!(
                            "Stage '{}' input '{}' kind must be 'text' or 'json', got '{}'.",
                            id, name, other
                        )))
                    }
                };
                InputBinding {
                    path: PathBuf::from(path),
                    kind,
                }
            }
        };
        inputs.insert(name, binding);
    }

    Ok(Stage {
        id,
        prompt,
        provider,
        model,
        temperature: raw.temperature.or(defaults.temperature),
        reasoning_effort: raw
            .reasoning_effort
            .or_else(|| defaults.reasoning_effort.map(str::to_string))
            .filter(|effort| !effort.trim().is_empty()),
        enabled: raw.enabled.unwrap_or(true),
        output,
        mode,
        map_source,
        concurrency,
        batch: raw.batch.unwrap_or(false),
        publish: raw.publish.unwrap_or(false),
        inputs,
    })
}

fn require_str(value: String, field: &str) -> Result<String, PipelineError> {
    if value.trim().is_empty() {
        return Err(PipelineError::Configuration(format!(
            "Field '{}' must be a non-empty string.",
            field
        )));
    }
    Ok(value)
}
