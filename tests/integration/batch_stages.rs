//! Batch map stages: submit, halt, poll and collect across invocations

use crate::integration::test_utils::*;
use promptline::error::PipelineError;
use promptline::pipeline::Pipeline;
use promptline::runner::RunOptions;
use promptline::store::{BatchState, ItemStatus, RunStatus, StageManifest, StageStatus};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

const BATCHED: &str = r#"
name: bulk
provider: fake
model: m1
stages:
  - id: topics
    output: json
    prompt: "List topics"
  - id: expand
    mode: map
    map_from: topics
    provider: fakebatch
    batch: true
    prompt: "Expand {item[topic]}"
"#;

struct Harness {
    sync: Arc<FakeBackend>,
    batch: Arc<FakeBatchBackend>,
    run: MemoryRun,
    pipeline: Pipeline,
}

impl Harness {
    fn new() -> Self {
        Self {
            sync: Arc::new(
                FakeBackend::new("fake")
                    .respond("List topics", r#"[{"topic":"alpha"},{"topic":"beta"}]"#),
            ),
            batch: Arc::new(FakeBatchBackend::new("fakebatch")),
            run: MemoryRun::new(),
            pipeline: pipeline(BATCHED),
        }
    }

    async fn invoke(&self, options: RunOptions) -> Result<std::path::PathBuf, PipelineError> {
        let runner = runner_with(
            Path::new("/unused"),
            vec![dynamic(&self.sync), dynamic(&self.batch)],
        );
        self.run.run(&runner, &self.pipeline, &[], options).await
    }

    fn batch_state(&self) -> BatchState {
        serde_json::from_value(self.run.json("support/stages/expand/batch.json").unwrap()).unwrap()
    }

    fn manifest(&self) -> StageManifest {
        serde_json::from_value(self.run.json("stages/expand/output.json").unwrap()).unwrap()
    }

    /// Answer every submitted request with `"<prompt> done"`.
    fn complete_all(&self) {
        for (custom_id, prompt) in self.batch.uploaded_prompts() {
            self.batch
                .push_output(batch_result_line(&custom_id, &format!("{} done", prompt)));
        }
        self.batch.set_status("completed");
    }
}

#[tokio::test]
async fn first_invocation_submits_and_halts() {
    let h = Harness::new();
    h.invoke(RunOptions::default()).await.unwrap();

    assert_eq!(h.batch.submissions(), 1);
    assert_eq!(h.batch.generate_calls(), 0);
    assert!(!h.run.exists("stages/expand/output.json"));

    let uploaded = h.batch.uploaded_prompts();
    assert_eq!(uploaded.len(), 2);
    assert_eq!(uploaded[0].1, "Expand alpha");
    assert!(uploaded[0].0.ends_with(":0"));
    assert!(uploaded[1].0.ends_with(":1"));
    assert_eq!(
        h.run
            .text("support/stages/expand/batch_input.jsonl")
            .unwrap()
            .lines()
            .count(),
        2
    );

    let state = h.batch_state();
    assert_eq!(state.batch_id, "batch_1_file_in_1");
    assert_eq!(state.input_file_id, "file_in_1");
    assert_eq!(state.requests.len(), 2);
    assert_eq!(state.requests[1].custom_id, uploaded[1].0);

    let record = h.run.run_record();
    assert_eq!(record.status, RunStatus::BatchPending);
    assert!(record.batch_pending_at.is_some());
    let stage = &record.stages["expand"];
    assert_eq!(stage.status, StageStatus::BatchSubmitted);
    assert_eq!(stage.batch_id.as_deref(), Some("batch_1_file_in_1"));

    let item_id = &state.requests[0].item_id;
    let item = h
        .run
        .json(&format!("stages/expand/items/{}/stage.json", item_id))
        .unwrap();
    assert_eq!(item["status"], "pending");
    assert_eq!(item["custom_id"], state.requests[0].custom_id.as_str());

    let log = h.run.log_lines();
    assert!(log.iter().any(|l| l == "Stage expand running in BATCH mode (submit/collect)"));
    assert!(log
        .iter()
        .any(|l| l == "stage:expand status=batch_submitted batch_id=batch_1_file_in_1"));
    assert!(log.iter().any(|l| l.starts_with("To resume batch: re-run with --run-dir")));
    assert!(log.iter().any(|l| l == "run status=batch_pending"));

    // Nothing is published while the batch is outstanding
    assert!(!h.run.paths().iter().any(|p| p.starts_with("output/")));
    assert!(!log.iter().any(|l| l.starts_with("publish ")));
    assert!(record.output.is_none());
}

#[tokio::test]
async fn pending_batch_is_polled_not_resubmitted() {
    let h = Harness::new();
    h.invoke(RunOptions::default()).await.unwrap();
    h.invoke(RunOptions::default()).await.unwrap();

    assert_eq!(h.batch.submissions(), 1);
    assert_eq!(h.batch_state().batch_id, "batch_1_file_in_1");
    assert_eq!(h.batch_state().status.as_deref(), Some("in_progress"));

    let record = h.run.run_record();
    assert_eq!(record.status, RunStatus::BatchPending);
    let stage = &record.stages["expand"];
    assert_eq!(stage.status, StageStatus::BatchPending);
    assert_eq!(stage.batch_id.as_deref(), Some("batch_1_file_in_1"));
    assert_eq!(stage.batch_status.as_deref(), Some("in_progress"));
    assert_eq!(h.sync.call_count(), 1);
}

#[tokio::test]
async fn finished_batch_is_collected_into_item_outputs() {
    let h = Harness::new();
    h.invoke(RunOptions::default()).await.unwrap();
    h.complete_all();
    h.invoke(RunOptions::default()).await.unwrap();

    assert_eq!(h.batch.submissions(), 1);
    let manifest = h.manifest();
    assert_eq!(manifest.count(ItemStatus::Completed), 2);
    for entry in &manifest.items {
        let output = h
            .run
            .text(&format!("stages/expand/items/{}/output.md", entry.id))
            .unwrap();
        assert_eq!(
            output,
            format!("Expand {} done", entry.item["topic"].as_str().unwrap())
        );
        assert!(h
            .run
            .exists(&format!("logs/stages/expand/items/{}/raw.txt", entry.id)));
    }

    let record = h.run.run_record();
    assert_eq!(record.status, RunStatus::Completed);
    let stage = &record.stages["expand"];
    assert_eq!(stage.status, StageStatus::Completed);
    assert_eq!(stage.batch_id.as_deref(), Some("batch_1_file_in_1"));
    assert_eq!(stage.batch_status.as_deref(), Some("completed"));

    // A further invocation finds the manifest and does nothing
    let before = h.run.text("run.json").unwrap();
    h.invoke(RunOptions::default()).await.unwrap();
    assert_eq!(h.run.text("run.json").unwrap(), before);
}

#[tokio::test]
async fn bad_result_lines_fail_only_their_items() {
    let h = Harness::new();
    h.invoke(RunOptions::default()).await.unwrap();

    let uploaded = h.batch.uploaded_prompts();
    h.batch.push_output(batch_result_line(&uploaded[0].0, "alpha done"));
    h.batch.push_output(
        json!({
            "custom_id": uploaded[1].0,
            "response": { "status_code": 500, "body": { "error": "overloaded" } },
        })
        .to_string(),
    );
    h.batch.push_output("this is not json".to_string());
    h.batch.set_status("completed");
    h.invoke(RunOptions::default()).await.unwrap();

    let manifest = h.manifest();
    assert_eq!(manifest.items[0].status, ItemStatus::Completed);
    let failed = &manifest.items[1];
    assert_eq!(failed.status, ItemStatus::Failed);
    assert_eq!(
        failed.error.as_deref(),
        Some("batch_response_error status_code=500")
    );
    let error = h
        .run
        .json(&format!("logs/stages/expand/items/{}/error.json", failed.id))
        .unwrap();
    assert_eq!(error["status_code"], 500);

    let record = h.run.run_record();
    assert_eq!(record.status, RunStatus::CompletedWithErrors);
    assert_eq!(record.stages["expand"].items_failed, Some(1));
}

#[tokio::test]
async fn error_file_lines_and_missing_results_fail_items() {
    let h = Harness::new();
    h.invoke(RunOptions::default()).await.unwrap();

    let uploaded = h.batch.uploaded_prompts();
    h.batch.push_error(
        json!({
            "custom_id": uploaded[0].0,
            "error": { "code": "invalid_prompt", "message": "rejected" },
        })
        .to_string(),
    );
    h.batch.set_status("completed");
    h.invoke(RunOptions::default()).await.unwrap();

    let manifest = h.manifest();
    assert_eq!(manifest.items[0].error.as_deref(), Some("batch_error"));
    assert_eq!(manifest.items[1].error.as_deref(), Some("missing_batch_result"));
    assert_eq!(manifest.count(ItemStatus::Failed), 2);

    let error = h
        .run
        .json(&format!("logs/stages/expand/items/{}/error.json", manifest.items[0].id))
        .unwrap();
    assert_eq!(error["error"]["code"], "invalid_prompt");
    assert_eq!(h.run.run_record().status, RunStatus::CompletedWithErrors);
}

#[tokio::test]
async fn terminal_batch_status_fails_the_run() {
    let h = Harness::new();
    h.invoke(RunOptions::default()).await.unwrap();
    h.batch.set_status("expired");

    let err = h.invoke(RunOptions::default()).await.unwrap_err();
    match &err {
        PipelineError::BatchTerminal { stage_id, status } => {
            assert_eq!(stage_id, "expand");
            assert_eq!(status, "expired");
        }
        other => panic!("unexpected error: {other}"),
    }

    let record = h.run.run_record();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(
        record.error.as_deref(),
        Some("Batch for stage 'expand' failed with status 'expired'.")
    );
    let stage = &record.stages["expand"];
    assert_eq!(stage.status, StageStatus::Failed);
    assert_eq!(stage.batch_status.as_deref(), Some("expired"));
}

#[tokio::test]
async fn batch_cannot_be_combined_with_concurrency() {
    let h = Harness::new();
    let err = h.invoke(with_concurrency(4)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
    assert!(err.to_string().contains("cannot combine batch with concurrency"));
    assert_eq!(h.batch.submissions(), 0);
}

#[tokio::test]
async fn batch_requires_a_capable_provider() {
    let sync = Arc::new(
        FakeBackend::new("fake").respond("List topics", r#"[{"topic":"alpha"}]"#),
    );
    let yaml = BATCHED.replace("    provider: fakebatch\n", "");
    let runner = runner_with(Path::new("/unused"), vec![dynamic(&sync)]);
    let run = MemoryRun::new();

    let err = run
        .run(&runner, &pipeline(&yaml), &[], RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
    assert!(err.to_string().contains("does not support batch jobs"));
    assert_eq!(sync.call_count(), 1);
}

#[tokio::test]
async fn collection_follows_the_submitted_table_when_the_source_changes() {
    let workspace = tempfile::TempDir::new().unwrap();
    std::fs::write(workspace.path().join("topics.txt"), "alpha\nbeta\n").unwrap();
    let (_, pipeline) = pipeline_file(
        workspace.path(),
        r#"
name: filebatch
provider: fakebatch
model: m1
stages:
  - id: expand
    mode: map
    map_from_file: topics.txt
    batch: true
    prompt: "Expand {item_value}"
"#,
    );
    let batch = Arc::new(FakeBatchBackend::new("fakebatch"));
    let runner = runner_with(Path::new("/unused"), vec![dynamic(&batch)]);
    let run = MemoryRun::new();

    run.run(&runner, &pipeline, &[], RunOptions::default())
        .await
        .unwrap();
    let table: BatchState =
        serde_json::from_value(run.json("support/stages/expand/batch.json").unwrap()).unwrap();
    assert_eq!(table.requests.len(), 2);

    for (custom_id, prompt) in batch.uploaded_prompts() {
        batch.push_output(batch_result_line(&custom_id, &format!("{} done", prompt)));
    }
    batch.set_status("completed");

    // alpha disappears and gamma takes its place before collection
    std::fs::write(workspace.path().join("topics.txt"), "gamma\nbeta\n").unwrap();
    run.run(&runner, &pipeline, &[], RunOptions::default())
        .await
        .unwrap();

    assert_eq!(batch.submissions(), 1);
    assert_eq!(batch.generate_calls(), 0);

    let manifest: StageManifest =
        serde_json::from_value(run.json("stages/expand/output.json").unwrap()).unwrap();
    let ids: Vec<&str> = manifest.items.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![table.requests[0].item_id.as_str(), table.requests[1].item_id.as_str()]
    );
    assert_eq!(manifest.count(ItemStatus::Completed), 2);
    assert_eq!(manifest.count(ItemStatus::Failed), 0);
    assert_eq!(manifest.items[0].item["value"], "alpha");
    assert_eq!(
        run.text(&format!("stages/expand/items/{}/output.md", table.requests[0].item_id))
            .as_deref(),
        Some("Expand alpha done")
    );

    assert!(run
        .log_lines()
        .iter()
        .any(|l| l.starts_with("stage:expand item:") && l.ends_with("status=not_in_batch")));
    assert_eq!(run.run_record().status, RunStatus::Completed);
}
