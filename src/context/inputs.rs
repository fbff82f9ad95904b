//! Input files and map source files
//!
//! Both are external, read-only data resolved relative to the pipeline definition.

use crate::error::{PipelineError, StorageError};
use crate::pipeline::{InputKind, Pipeline, Stage};
use crate::recovery::normalize_items;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Where an input came from, recorded in audit artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMeta {
    pub path: String,
    pub kind: String,
}

/// Loaded input files for one stage
#[derive(Debug, Clone, Default)]
pub struct InputSet {
    pub text: BTreeMap<String, String>,
    pub json: BTreeMap<String, Value>,
    pub meta: BTreeMap<String, SourceMeta>,
}

pub fn resolve_path(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn read_text(path: &Path) -> Result<String, StorageError> {
    std::fs::read_to_string(path).map_err(|e| StorageError::io(path, e))
}

fn read_json(path: &Path, label: &str) -> Result<Value, StorageError> {
    let text = read_text(path)?;
    serde_json::from_str(&text).map_err(|e| StorageError::invalid_json(label, path, &e))
}

/// Read every input file bound to `stage`. JSON inputs expose both the parsed value and
/// its pretty-printed text.
pub fn load_inputs(pipeline: &Pipeline, stage: &Stage) -> Result<InputSet, PipelineError> {
    let mut set = InputSet::default();
    for (name, binding) in &stage.inputs {
        let resolved = resolve_path(&binding.path, pipeline.base_dir());
        if !resolved.exists() {
            return Err(PipelineError::Dependency(format!(
                "Input file not found: {}",
                resolved.display()
            )));
        }
        let kind = match binding.kind {
            InputKind::Json => {
                let parsed = read_json(&resolved, &format!("Input file '{}'", name))?;
                let text = serde_json::to_string_pretty(&parsed)
                    .map_err(|e| StorageError::invalid_json(name.as_str(), &resolved, &e))?;
                set.json.insert(name.clone(), parsed);
                set.text.insert(name.clone(), text);
                "json"
            }
            InputKind::Text => {
                set.text.insert(name.clone(), read_text(&resolved)?);
                "text"
            }
        };
        set.meta.insert(
            name.clone(),
            SourceMeta {
                path: resolved.display().to_string(),
                kind: kind.to_string(),
            },
        );
    }
    Ok(set)
}

/// Load map items from an external file. `.json` files are parsed and normalized; any
/// other file yields one `{value: line}` item per non-blank line.
pub fn load_map_source_file(
    pipeline: &Pipeline,
    path: &Path,
) -> Result<(Vec<Map<String, Value>>, SourceMeta), PipelineError> {
    let resolved = resolve_path(path, pipeline.base_dir());
    if !resolved.exists() {
        return Err(PipelineError::Dependency(format!(
            "Map source file not found: {}",
            resolved.display()
        )));
    }

    let is_json = resolved
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let items = if is_json {
        normalize_items(read_json(&resolved, "Map source file")?)?
    } else {
        let lines: Vec<Value> = read_text(&resolved)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::json!({ "value": line }))
            .collect();
        normalize_items(Value::Array(lines))?
    };

    Ok((
        items,
        SourceMeta {
            path: resolved.display().to_string(),
            kind: if is_json { "json" } else { "text" }.to_string(),
        },
    ))
}
