//! Map-stage executor
//!
//! Runs a stage once per item. The execution plan is fixed before any item is touched:
//! serial, a bounded concurrent pool, or a provider batch job (see [`super::batch`]).
//! Each item owns its directory end to end, so workers share nothing but the run log.

use super::batch::{self, BatchProgress};
use super::{display_opt, generate_text, now, settings_suffix, with_timeout, StageOutcome, StageRun};
use crate::context::{ItemScope, SourceMeta, StageContext};
use crate::error::PipelineError;
use crate::pipeline::{OutputFormat, Stage};
use crate::provider::{GenerateRequest, GenerationBackend};
use crate::recovery::{is_selected, recover_json, stable_item_id, ID_KEY};
use crate::store::{
    layout, ExecutionMode, ItemRecord, ItemStatus, ManifestEntry, RunRecord, StageManifest,
    StageRecord, StageStatus,
};
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

/// How a map stage issues its generate calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub mode: ExecutionMode,
    /// Worker pool size; `None` in batch mode
    pub max_in_flight: Option<usize>,
}

impl ExecutionPlan {
    pub fn resolve(
        stage: &Stage,
        batch_capable: bool,
        concurrency_override: Option<usize>,
        default_max_in_flight: usize,
    ) -> Result<Self, PipelineError> {
        if concurrency_override == Some(0) {
            return Err(PipelineError::Configuration(
                "Concurrency override must be >= 1.".to_string(),
            ));
        }

        if stage.batch {
            if !batch_capable {
                return Err(PipelineError::Configuration(format!(
                    "Stage '{}' enables batch but provider '{}' does not support batch jobs.",
                    stage.id, stage.provider
                )));
            }
            if stage.concurrency.enabled || concurrency_override.is_some() {
                return Err(PipelineError::Configuration(format!(
                    "Stage '{}' cannot combine batch with concurrency.",
                    stage.id
                )));
            }
            return Ok(Self {
                mode: ExecutionMode::Batch,
                max_in_flight: None,
            });
        }

        let pool = match concurrency_override {
            Some(n) => n,
            None if stage.concurrency.enabled => stage
                .concurrency
                .max_in_flight
                .unwrap_or(default_max_in_flight),
            None => 1,
        }
        .max(1);

        Ok(Self {
            mode: if pool > 1 {
                ExecutionMode::Concurrent
            } else {
                ExecutionMode::Serial
            },
            max_in_flight: Some(pool),
        })
    }
}

/// Prepare a source element as a map item.
///
/// Non-objects become `{value: x}`. An object without `value` gets its sole value when
/// it has exactly one key, else its own compact JSON text.
pub fn prepare_map_item(element: Value) -> Map<String, Value> {
    match element {
        Value::Object(mut map) => {
            if !map.contains_key("value") {
                let value = if map.len() == 1 {
                    map.values().next().cloned().unwrap_or(Value::Null)
                } else {
                    Value::String(Value::Object(map.clone()).to_string())
                };
                map.insert("value".to_string(), value);
            }
            map
        }
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Directory-safe item id: the item's own `id`, else its content hash.
///
/// A declared id that needed rewriting carries a short hash of the declared id, so
/// `a/b`, `a?b` and `a_b` never share a directory.
pub(crate) fn item_id(item: &Map<String, Value>) -> String {
    let declared = match item.get(ID_KEY) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let Some(declared) = declared else {
        return stable_item_id(item);
    };
    let cleaned: String = declared
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        return stable_item_id(item);
    }
    if cleaned == declared {
        return cleaned;
    }
    let digest = blake3::hash(declared.as_bytes());
    format!("{}-{}", cleaned, hex::encode(&digest.as_bytes()[..3]))
}

/// An item that still needs a generation
pub(crate) struct WorkItem {
    pub index: usize,
    pub item_id: String,
    pub item: Map<String, Value>,
    pub prompt: String,
    pub context_all: Value,
    pub context_used: Value,
}

pub(crate) async fn run_map_stage(
    scope: &StageRun<'_>,
    run: &mut RunRecord,
) -> Result<StageOutcome, PipelineError> {
    let StageRun {
        runner,
        state,
        pipeline,
        params,
        index,
        stage,
        concurrency_override,
    } = *scope;

    let output_path = layout::stage_output(stage);
    if state.exists(&output_path)? {
        debug!(stage_id = %stage.id, "Map manifest present; skipping");
        return Ok(StageOutcome::AlreadyComplete);
    }

    let context = StageContext::gather(state, pipeline, index, params)?;
    let template = stage.template()?;
    let backend = runner.registry().get(&stage.provider)?;
    let plan = ExecutionPlan::resolve(
        stage,
        backend.batch().is_some(),
        concurrency_override,
        runner.default_max_in_flight(),
    )?;
    with_timeout(runner.request_timeout(), backend.ensure_model(&stage.model)).await?;

    let (sources, source_meta) = source_items(scope, &context)?;
    let items: Vec<Map<String, Value>> = sources.into_iter().map(prepare_map_item).collect();

    let previous = state.get_stage(&stage.id)?;
    let mut record = StageRecord::for_stage(stage, StageStatus::Started);
    record.execution_mode = Some(plan.mode);
    record.max_in_flight = plan.max_in_flight;
    record.map_source = source_meta.clone();
    record.started_at = Some(
        previous
            .as_ref()
            .and_then(|p| p.started_at)
            .unwrap_or_else(now),
    );
    if let Some(previous) = previous.filter(|p| p.batch_id.is_some()) {
        record.batch_id = previous.batch_id;
        record.batch_status = previous.batch_status;
    }
    state.put_stage(run, record.clone())?;

    state.write_json(
        &layout::stage_support_dir(&stage.id).join("context.json"),
        &json!({
            "map_from": stage.map_from(),
            "map_from_file": stage.map_from_file().map(|p| p.display().to_string()),
            "map_from_meta": source_meta,
            "item_count": items.len(),
            "context_all": context.full_projection(None),
        }),
    )?;
    state.log(&format!(
        "stage:{} status=started mode=map map_from={} {}",
        stage.id,
        display_opt(
            stage
                .map_from()
                .map(str::to_string)
                .or_else(|| stage.map_from_file().map(|p| p.display().to_string()))
        ),
        settings_suffix(stage)
    ))?;
    state.log(&match (plan.mode, plan.max_in_flight) {
        (ExecutionMode::Concurrent, Some(n)) => {
            format!("Stage {} running in CONCURRENT mode (max_in_flight={})", stage.id, n)
        }
        (ExecutionMode::Batch, _) => format!("Stage {} running in BATCH mode (submit/collect)", stage.id),
        _ => format!("Stage {} running in SERIAL mode", stage.id),
    })?;
    info!(
        stage_id = %stage.id,
        items = items.len(),
        mode = %plan.mode,
        "Map stage started"
    );

    let mut slots: Vec<Option<ManifestEntry>> = vec![None; items.len()];
    let mut work = Vec::new();

    for (item_index, item) in items.into_iter().enumerate() {
        let id = item_id(&item);

        if !is_selected(&item) {
            let payload_path = layout::item_payload(&stage.id, &id);
            if !state.exists(&payload_path)? {
                state.write_json(&payload_path, &item)?;
            }
            if !state.exists(&layout::item_record(&stage.id, &id))? {
                let mut skipped = ItemRecord::new(&stage.id, &id, item_index, ItemStatus::Skipped);
                skipped.skipped_at = Some(now());
                state.put_item(&skipped)?;
            }
            slots[item_index] = Some(ManifestEntry::new(&id, false, ItemStatus::Skipped, &item));
            continue;
        }

        if state.item_completed(stage, &id)? {
            slots[item_index] = Some(completed_entry(scope, &id, &item)?);
            continue;
        }

        let item_scope = ItemScope {
            item: &item,
            index: item_index,
            id: &id,
        };
        let prompt = template.render(&context, Some(&item_scope))?;
        let context_used = context.used_projection(&template, Some(&item_scope));
        let context_all = context.full_projection(Some(&item_scope));
        work.push(WorkItem {
            index: item_index,
            item_id: id,
            item,
            prompt,
            context_all,
            context_used,
        });
    }

    match plan.mode {
        ExecutionMode::Batch => {
            let batch_backend = backend.batch().ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "Provider '{}' does not support batch jobs.",
                    stage.provider
                ))
            })?;
            match batch::run_batch(scope, run, &mut record, batch_backend, &work, &mut slots).await? {
                BatchProgress::Pending => return Ok(StageOutcome::Pending),
                BatchProgress::Collected => {}
            }
        }
        ExecutionMode::Serial => {
            for item in &work {
                let entry = process_item(scope, backend.as_ref(), plan, item).await?;
                slots[item.index] = Some(entry);
            }
        }
        ExecutionMode::Concurrent => {
            let pool = plan.max_in_flight.unwrap_or(1);
            let backend: &dyn GenerationBackend = backend.as_ref();
            let results: Vec<(usize, Result<ManifestEntry, PipelineError>)> = stream::iter(&work)
                .map(|item| async move {
                    (item.index, process_item(scope, backend, plan, item).await)
                })
                .buffer_unordered(pool)
                .collect()
                .await;
            for (slot, result) in results {
                slots[slot] = Some(result?);
            }
        }
    }

    finish_map_stage(scope, run, record, slots)
}

/// Items from the upstream stage's structured output, or from the source file.
fn source_items(
    scope: &StageRun<'_>,
    context: &StageContext,
) -> Result<(Vec<Value>, Option<SourceMeta>), PipelineError> {
    let stage = scope.stage;
    if let Some(path) = stage.map_from_file() {
        let (items, meta) = crate::context::inputs::load_map_source_file(scope.pipeline, path)?;
        return Ok((items.into_iter().map(Value::Object).collect(), Some(meta)));
    }

    let source = stage.map_from().ok_or_else(|| {
        PipelineError::Configuration(format!(
            "Map stage '{}' is missing map_from or map_from_file.",
            stage.id
        ))
    })?;
    let items = context
        .stage_json
        .get(source)
        .and_then(|payload| payload.get("items"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            PipelineError::Dependency(format!(
                "Map stage '{}' expects JSON list from '{}'.",
                stage.id, source
            ))
        })?;
    Ok((items.clone(), None))
}

/// Run one item end to end. Generation and output errors fail only this item; the
/// returned error is reserved for storage failures while recording that.
async fn process_item(
    scope: &StageRun<'_>,
    backend: &dyn GenerationBackend,
    plan: ExecutionPlan,
    work: &WorkItem,
) -> Result<ManifestEntry, PipelineError> {
    let stage = scope.stage;
    let state = scope.state;

    let mut record = ItemRecord::for_request(
        stage,
        &work.item_id,
        work.index,
        ItemStatus::Started,
        plan.mode,
        &work.prompt,
    );
    record.max_in_flight = plan.max_in_flight;
    record.started_at = Some(now());

    match attempt_item(scope, backend, plan, work, &mut record).await {
        Ok(entry) => Ok(entry),
        Err(err) => {
            let error_path = layout::item_logs_dir(&stage.id, &work.item_id).join("error.json");
            state.write_json(
                &error_path,
                &json!({
                    "stage_id": stage.id,
                    "item_id": work.item_id,
                    "item_index": work.index,
                    "error": err.to_string(),
                }),
            )?;
            record.status = ItemStatus::Failed;
            record.failed_at = Some(now());
            state.put_item(&record)?;
            state.log(&format!(
                "stage:{} item:{} status=failed error={}",
                stage.id, work.item_id, err
            ))?;
            warn!(stage_id = %stage.id, item_id = %work.item_id, error = %err, "Item failed");

            let mut entry = ManifestEntry::new(&work.item_id, true, ItemStatus::Failed, &work.item);
            entry.error = Some(err.to_string());
            entry.error_path = Some(layout::display(&error_path));
            Ok(entry)
        }
    }
}

async fn attempt_item(
    scope: &StageRun<'_>,
    backend: &dyn GenerationBackend,
    plan: ExecutionPlan,
    work: &WorkItem,
    record: &mut ItemRecord,
) -> Result<ManifestEntry, PipelineError> {
    let stage = scope.stage;
    let state = scope.state;
    let id = work.item_id.as_str();

    state.write_json(&layout::item_payload(&stage.id, id), &work.item)?;
    state.put_item(record)?;
    write_item_support(scope, work)?;
    state.log(&format!(
        "stage:{} item:{} status=started mode={}",
        stage.id, id, plan.mode
    ))?;

    let request = GenerateRequest::for_stage(stage, work.prompt.clone());
    let raw = generate_text(scope, backend, &request).await?;
    let entry = store_item_text(scope, &work.item_id, &work.item, &raw)?;

    record.status = ItemStatus::Completed;
    record.completed_at = Some(now());
    state.put_item(record)?;
    state.log(&format!("stage:{} item:{} status=completed", stage.id, id))?;
    Ok(entry)
}

/// `context.json` and `request.json` for one item.
pub(crate) fn write_item_support(scope: &StageRun<'_>, work: &WorkItem) -> Result<(), PipelineError> {
    let stage = scope.stage;
    let support = layout::item_support_dir(&stage.id, &work.item_id);
    scope.state.write_json(
        &support.join("context.json"),
        &json!({
            "rendered_prompt": work.prompt,
            "context_all": work.context_all,
            "context_used": work.context_used,
        }),
    )?;
    scope.state.write_json(
        &support.join("request.json"),
        &json!({
            "provider": stage.provider,
            "model": stage.model,
            "temperature": stage.temperature,
            "reasoning_effort": stage.reasoning_effort,
            "item_id": work.item_id,
            "item_index": work.index,
            "prompt": work.prompt,
        }),
    )?;
    Ok(())
}

/// Manifest entry for an item whose output already exists.
pub(crate) fn completed_entry(
    scope: &StageRun<'_>,
    id: &str,
    item: &Map<String, Value>,
) -> Result<ManifestEntry, PipelineError> {
    let stage = scope.stage;
    let mut entry = ManifestEntry::new(id, true, ItemStatus::Completed, item);
    entry.output_path = Some(layout::display(&layout::item_output(stage, id)));
    let raw_path = layout::item_logs_dir(&stage.id, id).join("raw.txt");
    if scope.state.exists(&raw_path)? {
        entry.raw_path = Some(layout::display(&raw_path));
    }
    Ok(entry)
}

/// Persist generated text for an item: raw log, response summary, then the output
/// artifact. JSON items are stored as recovered.
pub(crate) fn store_item_text(
    scope: &StageRun<'_>,
    id: &str,
    item: &Map<String, Value>,
    raw: &str,
) -> Result<ManifestEntry, PipelineError> {
    let stage = scope.stage;
    let state = scope.state;

    let raw_path = layout::item_logs_dir(&stage.id, id).join("raw.txt");
    state.write_text(&raw_path, raw)?;
    state.write_json(
        &layout::item_support_dir(&stage.id, id).join("response.json"),
        &json!({
            "provider": stage.provider,
            "model": stage.model,
            "response_chars": raw.chars().count(),
            "raw_path": layout::display(&raw_path),
        }),
    )?;

    let output_path = layout::item_output(stage, id);
    match stage.output {
        OutputFormat::Json => {
            let payload = recover_json(raw).map_err(|_| {
                PipelineError::OutputFormat("Item output was not valid JSON.".to_string())
            })?;
            state.write_json(&output_path, &payload)?;
        }
        OutputFormat::Markdown => state.write_text(&output_path, raw)?,
    }

    let mut entry = ManifestEntry::new(id, true, ItemStatus::Completed, item);
    entry.output_path = Some(layout::display(&output_path));
    entry.raw_path = Some(layout::display(&raw_path));
    Ok(entry)
}

fn finish_map_stage(
    scope: &StageRun<'_>,
    run: &mut RunRecord,
    mut record: StageRecord,
    slots: Vec<Option<ManifestEntry>>,
) -> Result<StageOutcome, PipelineError> {
    let stage = scope.stage;
    let state = scope.state;

    let manifest = StageManifest {
        items: slots.into_iter().flatten().collect(),
        map_from: stage.map_from().map(str::to_string),
        map_from_file: stage.map_from_file().map(|p| p.display().to_string()),
    };
    let completed = manifest.count(ItemStatus::Completed);
    let failed = manifest.count(ItemStatus::Failed);
    let skipped = manifest.count(ItemStatus::Skipped);

    state.write_json(&layout::stage_output(stage), &manifest)?;

    let (status, outcome) = if failed > 0 {
        (StageStatus::CompletedWithErrors, StageOutcome::CompletedWithErrors)
    } else {
        (StageStatus::Completed, StageOutcome::Completed)
    };
    record.status = status;
    record.items_total = Some(manifest.items.len());
    record.items_completed = Some(completed);
    record.items_failed = Some(failed);
    record.items_skipped = Some(skipped);
    record.completed_at = Some(now());
    state.put_stage(run, record)?;
    state.log(&format!(
        "stage:{} status={} items_completed={} items_failed={} items_skipped={} provider={} model={}",
        stage.id, status, completed, failed, skipped, stage.provider, stage.model
    ))?;
    info!(stage_id = %stage.id, status = %status, completed, failed, skipped, "Map stage finished");
    Ok(outcome)
}
