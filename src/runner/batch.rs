//! Batch submit/collect for map stages
//!
//! First invocation: write every pending item's request line, upload, submit and halt.
//! Later invocations poll once; a finished job is downloaded and replayed line by line
//! against the correlation table in `batch.json`.

use super::map::{completed_entry, store_item_text, write_item_support, WorkItem};
use super::{display_opt, now, with_timeout, StageRun};
use crate::error::PipelineError;
use crate::provider::{BatchBackend, GenerateRequest};
use crate::store::{
    layout, BatchRequestEntry, BatchState, ExecutionMode, ItemRecord, ItemStatus, ManifestEntry,
    RunRecord, StageRecord, StageStatus,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{info, warn};

pub(crate) enum BatchProgress {
    /// Submitted or still running remotely
    Pending,
    /// Every item has a manifest entry
    Collected,
}

pub(crate) async fn run_batch(
    scope: &StageRun<'_>,
    run: &mut RunRecord,
    record: &mut StageRecord,
    batch: &dyn BatchBackend,
    work: &[WorkItem],
    slots: &mut Vec<Option<ManifestEntry>>,
) -> Result<BatchProgress, PipelineError> {
    let state_path = layout::batch_state(&scope.stage.id);
    match scope.state.read_json::<BatchState>(&state_path)? {
        Some(batch_state) => collect(scope, run, record, batch, batch_state, work, slots).await,
        None if work.is_empty() => Ok(BatchProgress::Collected),
        None => submit(scope, run, record, batch, work).await,
    }
}

fn custom_id(work: &WorkItem) -> String {
    format!("{}:{}", work.item_id, work.index)
}

async fn submit(
    scope: &StageRun<'_>,
    run: &mut RunRecord,
    record: &mut StageRecord,
    batch: &dyn BatchBackend,
    work: &[WorkItem],
) -> Result<BatchProgress, PipelineError> {
    let stage = scope.stage;
    let state = scope.state;
    let timeout = scope.runner.request_timeout();
    let submitted_at = now();

    let mut lines = String::new();
    let mut requests = Vec::with_capacity(work.len());
    for item in work {
        let custom_id = custom_id(item);
        let request = GenerateRequest::for_stage(stage, item.prompt.clone());
        lines.push_str(&batch.encode_request(&custom_id, &request).to_string());
        lines.push('\n');

        state.write_json(&layout::item_payload(&stage.id, &item.item_id), &item.item)?;
        let mut item_record = ItemRecord::for_request(
            stage,
            &item.item_id,
            item.index,
            ItemStatus::Pending,
            ExecutionMode::Batch,
            &item.prompt,
        );
        item_record.custom_id = Some(custom_id.clone());
        item_record.submitted_at = Some(submitted_at);
        state.put_item(&item_record)?;
        write_item_support(scope, item)?;
        state.log(&format!(
            "stage:{} item:{} status=submitted",
            stage.id, item.item_id
        ))?;

        requests.push(BatchRequestEntry {
            custom_id,
            item_id: item.item_id.clone(),
            item_index: item.index,
            item: item.item.clone(),
        });
    }

    state.write_text(&layout::batch_input(&stage.id), &lines)?;
    let file_name = format!("{}_batch_input.jsonl", stage.id);
    let input_file_id = with_timeout(timeout, batch.upload(&file_name, lines.into_bytes())).await?;

    let metadata = BTreeMap::from([
        ("stage_id".to_string(), stage.id.clone()),
        ("run_id".to_string(), run.run_id.clone()),
    ]);
    let handle = with_timeout(timeout, batch.submit(&input_file_id, &metadata)).await?;

    state.write_json(
        &layout::batch_state(&stage.id),
        &BatchState {
            batch_id: handle.id.clone(),
            input_file_id,
            status: handle.status.clone(),
            output_file_id: None,
            error_file_id: None,
            submitted_at,
            requests,
        },
    )?;

    record.status = StageStatus::BatchSubmitted;
    record.batch_id = Some(handle.id.clone());
    record.batch_status = handle.status;
    record.updated_at = Some(now());
    state.put_stage(run, record.clone())?;
    state.log(&format!(
        "stage:{} status=batch_submitted batch_id={}",
        stage.id, handle.id
    ))?;
    state.log(&format!(
        "To resume batch: re-run with --run-dir {}",
        state.root().display()
    ))?;
    info!(stage_id = %stage.id, batch_id = %handle.id, items = work.len(), "Batch submitted");
    Ok(BatchProgress::Pending)
}

async fn collect(
    scope: &StageRun<'_>,
    run: &mut RunRecord,
    record: &mut StageRecord,
    batch: &dyn BatchBackend,
    mut batch_state: BatchState,
    work: &[WorkItem],
    slots: &mut Vec<Option<ManifestEntry>>,
) -> Result<BatchProgress, PipelineError> {
    let stage = scope.stage;
    let state = scope.state;
    let timeout = scope.runner.request_timeout();
    let batch_id = batch_state.batch_id.clone();

    let poll = with_timeout(timeout, batch.poll(&batch_id)).await?;
    batch_state.status = Some(poll.status.clone());
    batch_state.output_file_id = poll.output_file_id.clone();
    batch_state.error_file_id = poll.error_file_id.clone();
    state.write_json(&layout::batch_state(&stage.id), &batch_state)?;

    record.batch_id = Some(batch_id.clone());
    record.batch_status = Some(poll.status.clone());

    if poll.is_terminal_failure() {
        record.status = StageStatus::Failed;
        record.failed_at = Some(now());
        state.put_stage(run, record.clone())?;
        state.log(&format!(
            "stage:{} status=failed batch_id={} batch_status={}",
            stage.id, batch_id, poll.status
        ))?;
        return Err(PipelineError::BatchTerminal {
            stage_id: stage.id.clone(),
            status: poll.status,
        });
    }

    let output_file_id = match poll.output_file_id.as_deref() {
        Some(id) if poll.is_ready() => id,
        _ => {
            record.status = StageStatus::BatchPending;
            record.updated_at = Some(now());
            state.put_stage(run, record.clone())?;
            state.log(&format!(
                "stage:{} status=batch_pending batch_id={} batch_status={}",
                stage.id, batch_id, poll.status
            ))?;
            info!(stage_id = %stage.id, batch_id = %batch_id, status = %poll.status, "Batch still pending");
            return Ok(BatchProgress::Pending);
        }
    };

    let output = with_timeout(timeout, batch.download(output_file_id)).await?;
    let errors = match poll.error_file_id.as_deref() {
        Some(id) => with_timeout(timeout, batch.download(id)).await?,
        None => String::new(),
    };

    // Results resolve through the persisted table only
    let mut collected: Vec<(usize, ManifestEntry)> = Vec::with_capacity(batch_state.requests.len());
    let mut pending: HashMap<&str, &BatchRequestEntry> = HashMap::new();
    for entry in &batch_state.requests {
        if state.item_completed(stage, &entry.item_id)? {
            collected.push((entry.item_index, completed_entry(scope, &entry.item_id, &entry.item)?));
        } else {
            pending.insert(entry.custom_id.as_str(), entry);
        }
    }

    let lines = output
        .lines()
        .map(|line| (line, false))
        .chain(errors.lines().map(|line| (line, true)));
    for (line, from_error_file) in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let payload: Value = match serde_json::from_str(line) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(stage_id = %stage.id, error = %err, "Skipping unparsable batch result line");
                continue;
            }
        };
        let Some(entry) = payload
            .get("custom_id")
            .and_then(Value::as_str)
            .and_then(|id| pending.remove(id))
        else {
            continue;
        };
        let result = replay_line(scope, batch, entry, &payload, from_error_file)?;
        collected.push((entry.item_index, result));
    }

    let mut missing: Vec<&BatchRequestEntry> = pending.into_values().collect();
    missing.sort_by_key(|entry| entry.item_index);
    for entry in missing {
        let detail = json!({ "error": "missing_batch_result", "custom_id": entry.custom_id });
        collected.push((entry.item_index, fail_item(scope, entry, &detail, "missing_batch_result")?));
    }

    let submitted: HashSet<&str> = batch_state
        .requests
        .iter()
        .map(|entry| entry.item_id.as_str())
        .collect();
    for item in work.iter().filter(|w| !submitted.contains(w.item_id.as_str())) {
        state.log(&format!(
            "stage:{} item:{} status=not_in_batch",
            stage.id, item.item_id
        ))?;
        warn!(stage_id = %stage.id, item_id = %item.item_id, "Item was not part of the submitted batch");
    }

    merge_collected(slots, collected, &submitted);
    Ok(BatchProgress::Collected)
}

/// Rebuild the manifest slots: batch results at their submitted index, then the
/// source's skipped or already-finished items that the batch did not cover.
fn merge_collected(
    slots: &mut Vec<Option<ManifestEntry>>,
    collected: Vec<(usize, ManifestEntry)>,
    submitted: &HashSet<&str>,
) {
    let mut ordered: Vec<(usize, bool, ManifestEntry)> = collected
        .into_iter()
        .map(|(index, entry)| (index, false, entry))
        .collect();
    for (index, slot) in slots.drain(..).enumerate() {
        if let Some(entry) = slot.filter(|e| !submitted.contains(e.id.as_str())) {
            ordered.push((index, true, entry));
        }
    }
    ordered.sort_by_key(|(index, from_source, _)| (*index, *from_source));
    slots.extend(ordered.into_iter().map(|(_, _, entry)| Some(entry)));
}

/// Apply one result line to its table entry. Errors are reserved for storage failures.
fn replay_line(
    scope: &StageRun<'_>,
    batch: &dyn BatchBackend,
    entry: &BatchRequestEntry,
    payload: &Value,
    from_error_file: bool,
) -> Result<ManifestEntry, PipelineError> {
    let custom_id = entry.custom_id.as_str();
    let line_error = payload.get("error").filter(|e| !e.is_null());
    if from_error_file || line_error.is_some() {
        let detail = json!({
            "error": line_error.cloned().unwrap_or_else(|| payload.clone()),
            "custom_id": custom_id,
        });
        return fail_item(scope, entry, &detail, "batch_error");
    }

    let response = payload.get("response");
    let status_code = response
        .and_then(|r| r.get("status_code"))
        .and_then(Value::as_u64);
    let body = response.and_then(|r| r.get("body")).filter(|b| b.is_object());
    let body = match (status_code, body) {
        (Some(200), Some(body)) => body,
        _ => {
            let detail = json!({
                "error": "batch_response_error",
                "status_code": status_code,
                "custom_id": custom_id,
            });
            let reason = format!("batch_response_error status_code={}", display_opt(status_code));
            return fail_item(scope, entry, &detail, &reason);
        }
    };

    let stored = batch
        .extract_text(body)
        .map_err(PipelineError::from)
        .and_then(|text| store_item_text(scope, &entry.item_id, &entry.item, &text));
    match stored {
        Ok(manifest_entry) => {
            let stage = scope.stage;
            let mut record = item_record(scope, entry)?;
            record.status = ItemStatus::Completed;
            record.completed_at = Some(now());
            scope.state.put_item(&record)?;
            scope.state.log(&format!(
                "stage:{} item:{} status=completed",
                stage.id, entry.item_id
            ))?;
            Ok(manifest_entry)
        }
        Err(PipelineError::Storage(err)) => Err(err.into()),
        Err(err) => {
            let detail = json!({ "error": err.to_string(), "custom_id": custom_id });
            fail_item(scope, entry, &detail, &err.to_string())
        }
    }
}

fn item_record(scope: &StageRun<'_>, entry: &BatchRequestEntry) -> Result<ItemRecord, PipelineError> {
    let existing = scope.state.get_item(&scope.stage.id, &entry.item_id)?;
    Ok(existing.unwrap_or_else(|| {
        let mut record = ItemRecord::new(
            &scope.stage.id,
            &entry.item_id,
            entry.item_index,
            ItemStatus::Pending,
        );
        record.execution_mode = Some(ExecutionMode::Batch);
        record.custom_id = Some(entry.custom_id.clone());
        record
    }))
}

fn fail_item(
    scope: &StageRun<'_>,
    entry: &BatchRequestEntry,
    detail: &Value,
    reason: &str,
) -> Result<ManifestEntry, PipelineError> {
    let stage = scope.stage;
    let state = scope.state;

    let error_path = layout::item_logs_dir(&stage.id, &entry.item_id).join("error.json");
    state.write_json(&error_path, detail)?;

    let mut record = item_record(scope, entry)?;
    record.status = ItemStatus::Failed;
    record.failed_at = Some(now());
    state.put_item(&record)?;
    state.log(&format!(
        "stage:{} item:{} status=failed error={}",
        stage.id, entry.item_id, reason
    ))?;
    warn!(stage_id = %stage.id, item_id = %entry.item_id, reason, "Batch item failed");

    let mut manifest_entry = ManifestEntry::new(&entry.item_id, true, ItemStatus::Failed, &entry.item);
    manifest_entry.error = Some(reason.to_string());
    manifest_entry.error_path = Some(layout::display(&error_path));
    Ok(manifest_entry)
}
