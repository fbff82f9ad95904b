//! CLI presentation: text and json formatters for run status and pipeline validation.

use crate::pipeline::{Pipeline, Stage};
use crate::store::{RunRecord, RunStatus, StageRecord};
use anyhow::Context;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;

/// Format a section heading with bold/underline.
pub fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

fn colored_status(status: RunStatus) -> String {
    let label = status.to_string();
    match status {
        RunStatus::Completed => label.green().to_string(),
        RunStatus::CompletedWithErrors | RunStatus::Stopped | RunStatus::BatchPending => {
            label.yellow().to_string()
        }
        RunStatus::Failed => label.red().to_string(),
        RunStatus::Started => label.cyan().to_string(),
    }
}

fn items_cell(record: &StageRecord) -> String {
    match record.items_total {
        Some(total) => format!(
            "{}/{} ok, {} failed, {} skipped",
            record.items_completed.unwrap_or(0),
            total,
            record.items_failed.unwrap_or(0),
            record.items_skipped.unwrap_or(0)
        ),
        None => "-".to_string(),
    }
}

fn mode_cell(record: &StageRecord) -> String {
    match record.execution_mode {
        Some(mode) => format!("{} ({})", record.mode.as_str(), mode),
        None => record.mode.as_str().to_string(),
    }
}

fn error_cell(record: &StageRecord) -> String {
    match (&record.error, &record.batch_status) {
        (Some(error), _) => error.clone(),
        (None, Some(batch_status)) => format!("batch {}", batch_status),
        (None, None) => record
            .skip_reason
            .clone()
            .unwrap_or_else(|| "-".to_string()),
    }
}

/// Human-readable run status: summary, stage table, published artifacts.
pub fn format_run_status_text(run: &RunRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Run Status")));
    out.push_str(&format!("  Run: {}\n", run.run_id));
    out.push_str(&format!("  Pipeline: {}\n", run.pipeline));
    out.push_str(&format!("  Status: {}\n", colored_status(run.status)));
    out.push_str(&format!("  Started: {}\n", run.started_at.to_rfc3339()));
    if let Some(ref error) = run.error {
        out.push_str(&format!("  Error: {}\n", error));
    }
    if !run.params.is_empty() {
        let params: Vec<String> = run
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        out.push_str(&format!("  Params: {}\n", params.join(", ")));
    }
    out.push('\n');

    out.push_str(&format!("{}\n\n", format_section_heading("Stages")));
    if run.stages.is_empty() {
        out.push_str("No stages recorded.\n");
    } else {
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["Stage", "Status", "Mode", "Items", "Note"]);
        for (stage_id, record) in &run.stages {
            table.add_row(vec![
                stage_id.clone(),
                record.status.to_string(),
                mode_cell(record),
                items_cell(record),
                error_cell(record),
            ]);
        }
        out.push_str(&format!("{}\n", table));
    }

    if let Some(ref published) = run.output {
        out.push_str(&format!("\n{}\n\n", format_section_heading("Published")));
        if published.artifacts.is_empty() {
            out.push_str("No artifacts published.\n");
        } else {
            let mut table = Table::new();
            table.load_preset(UTF8_BORDERS_ONLY);
            table.set_header(vec!["Stage", "Item", "Path"]);
            for artifact in &published.artifacts {
                table.add_row(vec![
                    artifact.stage_id.clone(),
                    artifact.item_id.clone().unwrap_or_else(|| "-".to_string()),
                    artifact.output_path.clone(),
                ]);
            }
            out.push_str(&format!("{}\n", table));
        }
    }
    out
}

pub fn format_run_status_json(run: &RunRecord) -> anyhow::Result<String> {
    serde_json::to_string_pretty(run).context("Failed to serialize run record")
}

fn source_cell(stage: &Stage) -> String {
    match (stage.map_from(), stage.map_from_file()) {
        (Some(id), _) => format!("stage {}", id),
        (None, Some(path)) => format!("file {}", path.display()),
        (None, None) => "-".to_string(),
    }
}

fn flags_cell(stage: &Stage) -> String {
    let mut flags = Vec::new();
    if !stage.enabled {
        flags.push("disabled".to_string());
    }
    if stage.publish {
        flags.push("publish".to_string());
    }
    if stage.batch {
        flags.push("batch".to_string());
    }
    if stage.concurrency.enabled {
        flags.push(match stage.concurrency.max_in_flight {
            Some(n) => format!("concurrent({})", n),
            None => "concurrent".to_string(),
        });
    }
    if flags.is_empty() {
        "-".to_string()
    } else {
        flags.join(", ")
    }
}

/// Stage summary of a validated pipeline.
pub fn format_validate_text(pipeline: &Pipeline) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{}\n\n",
        format_section_heading(&format!("Pipeline {}", pipeline.name))
    ));
    out.push_str(&format!("  Path: {}\n", pipeline.path.display()));
    out.push_str(&format!("  Stages: {}\n\n", pipeline.stages.len()));

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Stage", "Mode", "Output", "Provider/Model", "Source", "Flags"]);
    for stage in &pipeline.stages {
        table.add_row(vec![
            stage.id.clone(),
            stage.mode.as_str().to_string(),
            stage.output.as_str().to_string(),
            format!("{}/{}", stage.provider, stage.model),
            source_cell(stage),
            flags_cell(stage),
        ]);
    }
    out.push_str(&format!("{}\n", table));
    out.push_str("Pipeline is valid.");
    out
}

pub fn format_validate_json(pipeline: &Pipeline) -> anyhow::Result<String> {
    let stages: Vec<serde_json::Value> = pipeline
        .stages
        .iter()
        .map(|stage| {
            serde_json::json!({
                "id": stage.id,
                "mode": stage.mode,
                "output": stage.output,
                "provider": stage.provider,
                "model": stage.model,
                "enabled": stage.enabled,
                "publish": stage.publish,
                "batch": stage.batch,
                "concurrency": {
                    "enabled": stage.concurrency.enabled,
                    "max_in_flight": stage.concurrency.max_in_flight,
                },
                "map_from": stage.map_from(),
                "map_from_file": stage.map_from_file().map(|p| p.display().to_string()),
            })
        })
        .collect();
    let summary = serde_json::json!({
        "name": pipeline.name,
        "path": pipeline.path.display().to_string(),
        "valid": true,
        "stages": stages,
    });
    serde_json::to_string_pretty(&summary).context("Failed to serialize pipeline summary")
}
