//! Context Resolver
//!
//! Computes the variable bindings a stage's prompt can reference: run parameters,
//! outputs of earlier enabled stages, bound input files and, inside map stages, the
//! current item. Also builds the audit projections written next to every request.

use crate::error::{PipelineError, StorageError};
use crate::pipeline::Pipeline;
use crate::store::{layout, StateStore};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub mod inputs;
pub mod template;

pub use inputs::{InputSet, SourceMeta};
pub use template::{Placeholder, Template};

/// The current map item while rendering a per-item prompt
#[derive(Debug, Clone, Copy)]
pub struct ItemScope<'a> {
    pub item: &'a Map<String, Value>,
    pub index: usize,
    pub id: &'a str,
}

/// Everything a stage template may bind to
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub params: BTreeMap<String, String>,
    pub stage_outputs: BTreeMap<String, String>,
    pub stage_json: BTreeMap<String, Value>,
    pub inputs: InputSet,
}

impl StageContext {
    /// Collect outputs of every enabled stage before `stage_index` plus the stage's
    /// input files. A missing upstream artifact is a dependency error.
    pub fn gather(
        state: &StateStore,
        pipeline: &Pipeline,
        stage_index: usize,
        params: &BTreeMap<String, String>,
    ) -> Result<Self, PipelineError> {
        let mut context = StageContext {
            params: params.clone(),
            ..StageContext::default()
        };

        for prior in pipeline.stages[..stage_index].iter().filter(|s| s.enabled) {
            let path = layout::stage_output(prior);
            let text = state.read_text(&path)?.ok_or_else(|| {
                PipelineError::Dependency(format!(
                    "Missing output for stage '{}' at {}",
                    prior.id,
                    path.display()
                ))
            })?;
            if prior.is_map() || prior.output == crate::pipeline::OutputFormat::Json {
                let parsed: Value = serde_json::from_str(&text).map_err(|e| {
                    StorageError::invalid_json(format!("Stage '{}' output", prior.id), &path, &e)
                })?;
                let rendered = serde_json::to_string_pretty(&parsed).unwrap_or(text);
                context.stage_outputs.insert(prior.id.clone(), rendered);
                context.stage_json.insert(prior.id.clone(), parsed);
            } else {
                context.stage_outputs.insert(prior.id.clone(), text);
            }
        }

        let stage = &pipeline.stages[stage_index];
        context.inputs = inputs::load_inputs(pipeline, stage)?;
        Ok(context)
    }

    /// Plain-name lookup. Input text shadows a parameter of the same name.
    pub fn lookup_param(&self, name: &str) -> Option<&str> {
        self.inputs
            .text
            .get(name)
            .or_else(|| self.params.get(name))
            .map(String::as_str)
    }

    /// The minimal projection of values the template actually referenced.
    pub fn used_projection(&self, template: &Template, item: Option<&ItemScope<'_>>) -> Value {
        let mut params_used = Map::new();
        let mut outputs_used = Map::new();
        let mut json_used = Map::new();
        let mut inputs_used = Map::new();
        let mut inputs_json_used = Map::new();
        let mut item_used = None;
        let mut index_used = None;
        let mut id_used = None;
        let mut value_used = None;

        for (raw, placeholder) in template.placeholders() {
            match placeholder {
                Placeholder::StageOutput(id) => {
                    if let Some(v) = self.stage_outputs.get(id) {
                        outputs_used.insert(id.clone(), Value::String(v.clone()));
                    }
                }
                Placeholder::StageJson(id) => {
                    if let Some(v) = self.stage_json.get(id) {
                        json_used.insert(id.clone(), v.clone());
                    }
                }
                Placeholder::Input(name) => {
                    if let Some(v) = self.inputs.text.get(name) {
                        inputs_used.insert(name.clone(), Value::String(v.clone()));
                    }
                }
                Placeholder::InputJson(name) => {
                    if let Some(v) = self.inputs.json.get(name) {
                        inputs_json_used.insert(name.clone(), v.clone());
                    }
                }
                Placeholder::Item | Placeholder::ItemField(_) if item.is_some() => {
                    item_used = item.map(|scope| Value::Object(scope.item.clone()));
                }
                Placeholder::ItemIndex if item.is_some() => {
                    index_used = item.map(|scope| json!(scope.index));
                }
                Placeholder::ItemId if item.is_some() => {
                    id_used = item.map(|scope| json!(scope.id));
                }
                Placeholder::ItemValue if item.is_some() => {
                    value_used = item.and_then(|scope| scope.item.get("value").cloned());
                }
                Placeholder::ItemField(_) => {}
                _ => {
                    if let Some(v) = self.params.get(raw) {
                        params_used.insert(raw.to_string(), Value::String(v.clone()));
                    } else if let Some(v) = self.inputs.text.get(raw) {
                        inputs_used.insert(raw.to_string(), Value::String(v.clone()));
                    }
                }
            }
        }

        let mut used = Map::new();
        used.insert("params".into(), Value::Object(params_used));
        used.insert("stage_outputs".into(), Value::Object(outputs_used));
        used.insert("stage_json".into(), Value::Object(json_used));
        used.insert(
            "template_fields".into(),
            Value::Array(template.fields().map(|f| json!(f)).collect()),
        );
        if !inputs_used.is_empty() {
            used.insert("inputs".into(), Value::Object(inputs_used));
        }
        if !inputs_json_used.is_empty() {
            used.insert("inputs_json".into(), Value::Object(inputs_json_used));
        }
        if let Some(v) = item_used {
            used.insert("item".into(), v);
        }
        if let Some(v) = index_used {
            used.insert("item_index".into(), v);
        }
        if let Some(v) = id_used {
            used.insert("item_id".into(), v);
        }
        if let Some(v) = value_used {
            used.insert("item_value".into(), v);
        }
        Value::Object(used)
    }

    /// Every binding available to the stage, for `context.json`.
    pub fn full_projection(&self, item: Option<&ItemScope<'_>>) -> Value {
        let mut all = json!({
            "params": self.params,
            "inputs": self.inputs.text,
            "inputs_json": self.inputs.json,
            "inputs_meta": self.inputs.meta,
            "stage_outputs": self.stage_outputs,
            "stage_json": self.stage_json,
        });
        if let (Some(scope), Value::Object(map)) = (item, &mut all) {
            map.insert("item".into(), Value::Object(scope.item.clone()));
            map.insert(
                "item_value".into(),
                scope.item.get("value").cloned().unwrap_or(Value::Null),
            );
            map.insert("item_index".into(), json!(scope.index));
            map.insert("item_id".into(), json!(scope.id));
        }
        all
    }
}
