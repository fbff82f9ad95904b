//! Single-stage executor: one prompt, one generation, one artifact.

use super::{generate_text, now, settings_suffix, with_timeout, StageOutcome, StageRun};
use crate::context::StageContext;
use crate::error::PipelineError;
use crate::pipeline::OutputFormat;
use crate::provider::GenerateRequest;
use crate::recovery::{normalize_output, recover_json};
use crate::store::{layout, RunRecord, StageRecord, StageStatus};
use serde_json::json;
use tracing::{debug, info};

pub(crate) async fn run_single_stage(
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
        ..
    } = *scope;

    let output_path = layout::stage_output(stage);
    if state.exists(&output_path)? {
        debug!(stage_id = %stage.id, "Stage output present; skipping");
        return Ok(StageOutcome::AlreadyComplete);
    }

    let context = StageContext::gather(state, pipeline, index, params)?;
    let template = stage.template()?;
    let backend = runner.registry().get(&stage.provider)?;
    with_timeout(runner.request_timeout(), backend.ensure_model(&stage.model)).await?;

    let used = context.used_projection(&template, None);
    let prompt = template.render(&context, None)?;

    let mut record = StageRecord::for_stage(stage, StageStatus::Started);
    record.started_at = Some(now());
    state.put_stage(run, record.clone())?;

    let support = layout::stage_support_dir(&stage.id);
    state.write_json(
        &support.join("context.json"),
        &json!({
            "rendered_prompt": prompt,
            "context_all": context.full_projection(None),
            "context_used": used,
        }),
    )?;
    state.write_json(
        &support.join("request.json"),
        &json!({
            "provider": stage.provider,
            "model": stage.model,
            "temperature": stage.temperature,
            "reasoning_effort": stage.reasoning_effort,
            "prompt": prompt,
        }),
    )?;
    state.log(&format!(
        "stage:{} status=started mode=single {}",
        stage.id,
        settings_suffix(stage)
    ))?;
    info!(stage_id = %stage.id, provider = %stage.provider, model = %stage.model, "Stage started");

    let request = GenerateRequest::for_stage(stage, prompt);
    let raw = generate_text(scope, backend.as_ref(), &request).await?;

    let logs = layout::stage_logs_dir(&stage.id);
    let raw_path = logs.join("raw.txt");
    state.write_text(&raw_path, &raw)?;
    state.write_json(
        &support.join("response.json"),
        &json!({
            "provider": stage.provider,
            "model": stage.model,
            "response_chars": raw.chars().count(),
            "raw_path": layout::display(&raw_path),
        }),
    )?;

    match stage.output {
        OutputFormat::Json => match recover_json(&raw) {
            Ok(payload) => state.write_json(&output_path, &normalize_output(payload))?,
            Err(err) => {
                let error_path = logs.join("error.json");
                state.write_json(
                    &error_path,
                    &json!({
                        "stage_id": stage.id,
                        "error": "Invalid JSON output format.",
                        "detail": err.to_string(),
                    }),
                )?;
                record.status = StageStatus::Failed;
                record.error = Some("Stage output was not valid JSON list.".to_string());
                record.error_path = Some(layout::display(&error_path));
                record.failed_at = Some(now());
                state.put_stage(run, record)?;
                state.log(&format!(
                    "stage:{} status=failed error=invalid_json_output",
                    stage.id
                ))?;
                return Err(PipelineError::OutputFormat(format!(
                    "Stage '{}' output was not valid JSON list.",
                    stage.id
                )));
            }
        },
        OutputFormat::Markdown => state.write_text(&output_path, &raw)?,
    }

    record.status = StageStatus::Completed;
    record.completed_at = Some(now());
    state.put_stage(run, record)?;
    state.log(&format!(
        "stage:{} status=completed {}",
        stage.id,
        settings_suffix(stage)
    ))?;
    info!(stage_id = %stage.id, "Stage completed");
    Ok(StageOutcome::Completed)
}
