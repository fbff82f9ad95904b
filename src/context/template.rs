//! Prompt templates
//!
//! A template is tokenized once per stage into literals and typed placeholders, then
//! rendered once per item (or once for a single stage) against a [`StageContext`].
//!
//! Syntax: `{field}` substitutes a value, `{{` and `}}` are literal braces. Field forms:
//! a plain parameter name, `stage_outputs[id]`, `stage_json[id]`, `inputs[name]`,
//! `inputs_json[name]`, and inside map stages `item`, `item[key]`, `item_value`,
//! `item_index`, `item_id`.

use super::{ItemScope, StageContext};
use crate::error::PipelineError;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeSet;

/// A substitution site in a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Param(String),
    StageOutput(String),
    StageJson(String),
    Input(String),
    InputJson(String),
    Item,
    ItemField(String),
    ItemValue,
    ItemIndex,
    ItemId,
}

impl Placeholder {
    fn from_field(field: &str) -> Self {
        if let Some((prefix, key)) = split_indexed(field) {
            match prefix {
                "stage_outputs" => return Placeholder::StageOutput(key.to_string()),
                "stage_json" => return Placeholder::StageJson(key.to_string()),
                "inputs" => return Placeholder::Input(key.to_string()),
                "inputs_json" => return Placeholder::InputJson(key.to_string()),
                "item" => return Placeholder::ItemField(key.to_string()),
                _ => {}
            }
        }
        match field {
            "item" => Placeholder::Item,
            "item_value" => Placeholder::ItemValue,
            "item_index" => Placeholder::ItemIndex,
            "item_id" => Placeholder::ItemId,
            other => Placeholder::Param(other.to_string()),
        }
    }
}

/// `prefix[key]` -> (prefix, key)
fn split_indexed(field: &str) -> Option<(&str, &str)> {
    let open = field.find('[')?;
    if !field.ends_with(']') {
        return None;
    }
    Some((&field[..open], &field[open + 1..field.len() - 1]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Field { raw: String, placeholder: Placeholder },
}

/// A parsed prompt template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    tokens: Vec<Token>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, PipelineError> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, ch)) = chars.next() {
            match ch {
                '{' if chars.peek().map(|(_, c)| *c) == Some('{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().map(|(_, c)| *c) == Some('}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => {
                    return Err(PipelineError::Configuration(format!(
                        "Single '}}' encountered in template at offset {}",
                        pos
                    )));
                }
                '{' => {
                    let mut field = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => break,
                            other => field.push(other),
                        }
                    }
                    if !closed {
                        return Err(PipelineError::Configuration(format!(
                            "Unbalanced '{{' in template at offset {}",
                            pos
                        )));
                    }
                    if field.is_empty() {
                        return Err(PipelineError::Configuration(format!(
                            "Empty placeholder '{{}}' in template at offset {}",
                            pos
                        )));
                    }
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    let placeholder = Placeholder::from_field(&field);
                    tokens.push(Token::Field {
                        raw: field,
                        placeholder,
                    });
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        Ok(Self { tokens })
    }

    /// Raw field names in template order, duplicates included.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().filter_map(|t| match t {
            Token::Field { raw, .. } => Some(raw.as_str()),
            Token::Literal(_) => None,
        })
    }

    pub fn placeholders(&self) -> impl Iterator<Item = (&str, &Placeholder)> {
        self.tokens.iter().filter_map(|t| match t {
            Token::Field { raw, placeholder } => Some((raw.as_str(), placeholder)),
            Token::Literal(_) => None,
        })
    }

    /// Upstream stage ids referenced through `stage_outputs[..]` or `stage_json[..]`.
    pub fn stage_references(&self) -> BTreeSet<String> {
        self.placeholders()
            .filter_map(|(_, p)| match p {
                Placeholder::StageOutput(id) | Placeholder::StageJson(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn render(
        &self,
        context: &StageContext,
        item: Option<&ItemScope<'_>>,
    ) -> Result<String, PipelineError> {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Field { raw, placeholder } => {
                    let value = resolve(placeholder, context, item).ok_or_else(|| {
                        PipelineError::Dependency(format!("Missing required parameter: {}", raw))
                    })?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }
}

fn resolve<'a>(
    placeholder: &Placeholder,
    context: &'a StageContext,
    item: Option<&ItemScope<'a>>,
) -> Option<Cow<'a, str>> {
    match (placeholder, item) {
        (Placeholder::Param(name), _) => context.lookup_param(name).map(Cow::Borrowed),
        (Placeholder::StageOutput(id), _) => {
            context.stage_outputs.get(id).map(|s| Cow::Borrowed(s.as_str()))
        }
        (Placeholder::StageJson(id), _) => context.stage_json.get(id).map(|v| Cow::Owned(pretty(v))),
        (Placeholder::Input(name), _) => {
            context.inputs.text.get(name).map(|s| Cow::Borrowed(s.as_str()))
        }
        (Placeholder::InputJson(name), _) => {
            context.inputs.json.get(name).map(|v| Cow::Owned(pretty(v)))
        }
        (Placeholder::Item, Some(scope)) => Some(Cow::Owned(Value::Object(scope.item.clone()).to_string())),
        (Placeholder::ItemField(key), Some(scope)) => scope.item.get(key).map(inline),
        (Placeholder::ItemValue, Some(scope)) => scope.item.get("value").map(inline),
        (Placeholder::ItemIndex, Some(scope)) => Some(Cow::Owned(scope.index.to_string())),
        (Placeholder::ItemId, Some(scope)) => Some(Cow::Owned(scope.id.to_string())),
        (Placeholder::Item, None) => context.lookup_param("item").map(Cow::Borrowed),
        (Placeholder::ItemValue, None) => context.lookup_param("item_value").map(Cow::Borrowed),
        (Placeholder::ItemIndex, None) => context.lookup_param("item_index").map(Cow::Borrowed),
        (Placeholder::ItemId, None) => context.lookup_param("item_id").map(Cow::Borrowed),
        (Placeholder::ItemField(_), None) => None,
    }
}

fn inline(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        other => Cow::Owned(other.to_string()),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
