//! Disabled stages and the stages that depend on them

use crate::integration::test_utils::*;
use promptline::error::PipelineError;
use promptline::runner::RunOptions;
use promptline::store::{RunStatus, StageStatus};
use std::path::Path;
use std::sync::Arc;

#[tokio::test]
async fn disabled_stage_is_recorded_as_skipped() {
    let yaml = r#"
name: optional
provider: fake
model: m1
stages:
  - id: outline
    prompt: "Outline"
  - id: critique
    enabled: false
    prompt: "Critique {stage_outputs[outline]}"
  - id: draft
    prompt: "Draft {stage_outputs[outline]}"
"#;
    let fake = Arc::new(FakeBackend::new("fake"));
    let runner = runner_with(Path::new("/unused"), vec![dynamic(&fake)]);
    let run = MemoryRun::new();
    let pipeline = pipeline(yaml);

    run.run(&runner, &pipeline, &[], RunOptions::default())
        .await
        .unwrap();

    assert!(!fake.calls().iter().any(|p| p.starts_with("Critique")));
    let record = run.run_record();
    assert_eq!(record.status, RunStatus::Completed);
    let critique = &record.stages["critique"];
    assert_eq!(critique.status, StageStatus::Skipped);
    assert_eq!(critique.skip_reason.as_deref(), Some("disabled_in_yaml"));
    assert!(!critique.enabled);
    assert!(run
        .log_lines()
        .iter()
        .any(|l| l == "Stage critique SKIPPED (disabled in pipeline yaml)"));

    // The skip is recorded once
    let before = run.text("run.json").unwrap();
    run.run(&runner, &pipeline, &[], RunOptions::default())
        .await
        .unwrap();
    assert_eq!(run.text("run.json").unwrap(), before);
}

#[tokio::test]
async fn referencing_a_disabled_stage_fails_before_generation() {
    let yaml = r#"
name: broken
provider: fake
model: m1
stages:
  - id: a
    prompt: "First"
  - id: b
    enabled: false
    prompt: "Second"
  - id: c
    prompt: "Third {stage_outputs[b]}"
"#;
    let fake = Arc::new(FakeBackend::new("fake"));
    let runner = runner_with(Path::new("/unused"), vec![dynamic(&fake)]);
    let run = MemoryRun::new();

    let err = run
        .run(&runner, &pipeline(yaml), &[], RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Dependency(_)));
    assert!(err
        .to_string()
        .contains("Cannot run stage 'c': dependency 'b' is disabled"));
    assert_eq!(fake.calls(), vec!["First".to_string()]);

    let record = run.run_record();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.stages["b"].status, StageStatus::Skipped);
    let c = &record.stages["c"];
    assert_eq!(c.status, StageStatus::Failed);
    assert_eq!(c.error.as_deref(), Some("disabled_dependency"));
    assert_eq!(c.dependency.as_deref(), Some("b"));
    assert!(run
        .log_lines()
        .iter()
        .any(|l| l == "stage:c status=failed error=disabled_dependency dependency=b"));
}

#[tokio::test]
async fn map_source_counts_as_a_dependency() {
    let yaml = r#"
name: broken_map
provider: fake
model: m1
stages:
  - id: topics
    enabled: false
    output: json
    prompt: "List topics"
  - id: expand
    mode: map
    map_from: topics
    prompt: "Expand {item_value}"
"#;
    let fake = Arc::new(FakeBackend::new("fake"));
    let runner = runner_with(Path::new("/unused"), vec![dynamic(&fake)]);
    let run = MemoryRun::new();

    let err = run
        .run(&runner, &pipeline(yaml), &[], RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Dependency(_)));
    assert_eq!(fake.call_count(), 0);
    assert_eq!(
        run.run_record().stages["expand"].dependency.as_deref(),
        Some("topics")
    );
}
