//! Structured-Output Recovery
//!
//! Extracts JSON from free-form generated text and normalizes it into an item list that
//! map stages can consume. Recovery tries, in order: the whole trimmed text, the body of
//! the first fenced code block, then a prefix parse starting at the first `{` or `[`.

use crate::error::PipelineError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

pub const ID_KEY: &str = "id";
pub const SELECTED_KEY: &str = "selected";

static FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)```(?:json)?\s*(.*?)\s*```").expect("fence pattern is valid")
});

/// Parse the first JSON value recoverable from `text`.
pub fn recover_json(text: &str) -> Result<Value, PipelineError> {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return Ok(value);
        }
    }

    if let Some(body) = FENCE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|body| !body.is_empty())
    {
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            return Ok(value);
        }
    }

    let start = [trimmed.find('{'), trimmed.find('[')]
        .into_iter()
        .flatten()
        .min();
    if let Some(start) = start {
        let mut stream = serde_json::Deserializer::from_str(&trimmed[start..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            return Ok(value);
        }
    }

    Err(PipelineError::OutputFormat(
        "No valid JSON found in response.".to_string(),
    ))
}

/// Strictly normalize a payload into items: it must be a list, or an object whose
/// `items` field is a list.
pub fn normalize_items(payload: Value) -> Result<Vec<Map<String, Value>>, PipelineError> {
    let items = match payload {
        Value::Object(mut map) if map.contains_key("items") => map.remove("items").unwrap_or(Value::Null),
        other => other,
    };
    let Value::Array(items) = items else {
        return Err(PipelineError::OutputFormat(
            "JSON output must be a list or an object with an 'items' list.".to_string(),
        ));
    };
    Ok(items.into_iter().map(normalize_item).collect())
}

/// Normalize a single-stage payload: item lists become `{items: [...]}`, anything else
/// is kept as-is.
pub fn normalize_output(payload: Value) -> Value {
    match payload {
        Value::Array(items) => wrap_items(items),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => wrap_items(items),
            Some(other) => {
                map.insert("items".to_string(), other);
                Value::Object(map)
            }
            None => Value::Object(map),
        },
        other => other,
    }
}

fn wrap_items(items: Vec<Value>) -> Value {
    let items: Vec<Value> = items
        .into_iter()
        .map(|element| Value::Object(normalize_item(element)))
        .collect();
    serde_json::json!({ "items": items })
}

fn normalize_item(element: Value) -> Map<String, Value> {
    let mut item = match element {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    if !item.contains_key(ID_KEY) {
        let id = stable_item_id(&item);
        item.insert(ID_KEY.to_string(), Value::String(id));
    }
    if !item.contains_key(SELECTED_KEY) {
        item.insert(SELECTED_KEY.to_string(), Value::Bool(true));
    }
    item
}

/// Content hash of an item, ignoring its `id` and `selected` fields.
pub fn stable_item_id(item: &Map<String, Value>) -> String {
    let content: Map<String, Value> = item
        .iter()
        .filter(|(key, _)| key.as_str() != ID_KEY && key.as_str() != SELECTED_KEY)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let encoded = canonical_json(&Value::Object(content));
    let digest = blake3::hash(encoded.as_bytes());
    format!("item_{}", hex::encode(&digest.as_bytes()[..5]))
}

/// Compact JSON with object keys sorted at every depth.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{}:{}", Value::String(key.clone()), canonical_json(&map[key])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(values) => {
            let body: Vec<String> = values.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        scalar => scalar.to_string(),
    }
}

/// Item selection flag; missing means selected.
pub fn is_selected(item: &Map<String, Value>) -> bool {
    item.get(SELECTED_KEY).and_then(Value::as_bool).unwrap_or(true)
}
