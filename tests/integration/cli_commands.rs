//! CLI routing and configuration against real run directories

use crate::integration::test_utils::*;
use promptline::cli::{Commands, RunContext};
use promptline::config::ConfigLoader;
use promptline::runner::{RunOptions, Runner};
use promptline::store::ExecutionMode;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const PIPELINE: &str = r#"
name: notes
provider: fake
model: m1
stages:
  - id: topics
    output: json
    prompt: "List topics"
  - id: expand
    mode: map
    map_from: topics
    concurrency: true
    prompt: "Expand {item[topic]}"
"#;

#[tokio::test]
async fn status_reports_a_finished_run() {
    let workspace = TempDir::new().unwrap();
    let (_, pipeline) = pipeline_file(workspace.path(), PIPELINE);
    let fake = Arc::new(
        FakeBackend::new("fake").respond("List topics", r#"[{"topic":"alpha"},{"topic":"beta"}]"#),
    );
    let runner = runner_with(&workspace.path().join("runs"), vec![dynamic(&fake)]);
    let run_dir = runner
        .run(&pipeline, Default::default(), RunOptions::default())
        .await
        .unwrap();

    let context = RunContext::new(workspace.path().to_path_buf(), None).unwrap();

    let text = context
        .execute(&Commands::Status {
            run_dir: run_dir.clone(),
            format: "text".to_string(),
        })
        .unwrap();
    assert!(text.contains("notes"));
    assert!(text.contains("expand"));
    assert!(text.contains("2/2 ok, 0 failed, 0 skipped"));
    assert!(text.contains("output/expand/"));

    let json: serde_json::Value = serde_json::from_str(
        &context
            .execute(&Commands::Status {
                run_dir,
                format: "json".to_string(),
            })
            .unwrap(),
    )
    .unwrap();
    assert_eq!(json["pipeline"], "notes");
    assert_eq!(json["status"], "completed");
    assert_eq!(json["stages"]["expand"]["items_completed"], 2);
}

#[test]
fn validate_rejects_broken_pipelines() {
    let workspace = TempDir::new().unwrap();
    let path = workspace.path().join("broken.yml");
    fs::write(
        &path,
        "model: m\nstages:\n  - id: a\n    prompt: '{stage_outputs[zzz]}'\n",
    )
    .unwrap();

    let context = RunContext::new(workspace.path().to_path_buf(), None).unwrap();
    let err = context
        .execute(&Commands::Validate {
            pipeline: path,
            format: "text".to_string(),
        })
        .unwrap_err();
    assert!(err.to_string().contains("references unknown stage 'zzz'"));
}

#[test]
fn validate_json_describes_each_stage() {
    let workspace = TempDir::new().unwrap();
    let (path, _) = pipeline_file(workspace.path(), PIPELINE);

    let context = RunContext::new(workspace.path().to_path_buf(), None).unwrap();
    let json: serde_json::Value = serde_json::from_str(
        &context
            .execute(&Commands::Validate {
                pipeline: path,
                format: "json".to_string(),
            })
            .unwrap(),
    )
    .unwrap();
    assert_eq!(json["name"], "notes");
    assert_eq!(json["stages"][0]["output"], "json");
    assert_eq!(json["stages"][1]["concurrency"]["enabled"], true);
}

#[tokio::test]
async fn workspace_config_shapes_the_runner() {
    let workspace = TempDir::new().unwrap();
    let config_dir = workspace.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("config.toml"),
        "[runner]\nruns_root = \"var/runs\"\ndefault_max_in_flight = 5\n",
    )
    .unwrap();

    let config = ConfigLoader::load(workspace.path()).unwrap();
    let runner = Runner::from_config(&config, workspace.path());
    assert_eq!(runner.runs_root(), workspace.path().join("var/runs"));
    assert_eq!(runner.default_max_in_flight(), 5);

    let fake = Arc::new(
        FakeBackend::new("fake").respond("List topics", r#"[{"topic":"alpha"}]"#),
    );
    runner.registry().register("fake", dynamic(&fake));
    let (_, pipeline) = pipeline_file(workspace.path(), PIPELINE);
    let run_dir = runner
        .run(&pipeline, Default::default(), RunOptions::default())
        .await
        .unwrap();
    assert!(run_dir.starts_with(fs::canonicalize(workspace.path().join("var/runs")).unwrap()));

    let run = promptline::store::StateStore::new(Arc::new(
        promptline::store::FsArtifactStore::open(&run_dir).unwrap(),
    ))
    .get_run()
    .unwrap()
    .unwrap();
    let expand = &run.stages["expand"];
    // A single item still gets the configured pool size
    assert_eq!(expand.max_in_flight, Some(5));
    assert_eq!(expand.execution_mode, Some(ExecutionMode::Concurrent));
}
