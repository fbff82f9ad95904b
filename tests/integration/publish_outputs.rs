//! Publishing final artifacts into `output/`

use crate::integration::test_utils::*;
use promptline::runner::RunOptions;
use std::path::Path;
use std::sync::Arc;

const REPORT: &str = r#"
name: report
provider: fake
model: m1
stages:
  - id: topics
    output: json
    prompt: "List topics"
  - id: sections
    mode: map
    map_from: topics
    prompt: "Write {item[topic]}"
  - id: summary
    prompt: "Summarize {stage_outputs[sections]}"
"#;

fn fake() -> Arc<FakeBackend> {
    Arc::new(FakeBackend::new("fake").respond("List topics", r#"[{"topic":"alpha"},{"topic":"beta"}]"#))
}

fn published(run: &MemoryRun) -> Vec<String> {
    run.paths()
        .into_iter()
        .filter(|p| p.starts_with("output/"))
        .collect()
}

#[tokio::test]
async fn last_stage_is_published_by_default() {
    let fake = fake();
    let runner = runner_with(Path::new("/unused"), vec![dynamic(&fake)]);
    let run = MemoryRun::new();

    run.run(&runner, &pipeline(REPORT), &[], RunOptions::default())
        .await
        .unwrap();

    assert_eq!(published(&run), vec!["output/summary/output.md".to_string()]);
    assert_eq!(
        run.text("output/summary/output.md"),
        run.text("stages/summary/output.md")
    );

    let record = run.run_record();
    let output = record.output.unwrap();
    assert_eq!(output.path, "output");
    assert_eq!(output.artifacts.len(), 1);
    assert_eq!(output.artifacts[0].stage_id, "summary");
    assert_eq!(output.artifacts[0].output_path, "output/summary/output.md");
    assert!(run.log_lines().iter().any(|l| l == "publish artifacts=1 path=output"));
}

#[tokio::test]
async fn publish_flags_select_map_items_and_stages() {
    let yaml = REPORT
        .replace(
            "    map_from: topics\n",
            "    map_from: topics\n    publish: true\n",
        )
        .replace(
            "    output: json\n",
            "    output: json\n    publish: true\n",
        );
    let fake = fake();
    let runner = runner_with(Path::new("/unused"), vec![dynamic(&fake)]);
    let run = MemoryRun::new();

    run.run(&runner, &pipeline(&yaml), &[], RunOptions::default())
        .await
        .unwrap();

    let paths = published(&run);
    assert_eq!(paths.len(), 3);
    assert!(paths.contains(&"output/topics/output.json".to_string()));
    assert_eq!(
        paths
            .iter()
            .filter(|p| p.starts_with("output/sections/") && p.ends_with("/output.md"))
            .count(),
        2
    );
    assert!(!paths.iter().any(|p| p.starts_with("output/summary")));

    let record = run.run_record();
    let artifacts = record.output.unwrap().artifacts;
    assert_eq!(artifacts.iter().filter(|a| a.item_id.is_some()).count(), 2);
}

#[tokio::test]
async fn audit_artifacts_never_reach_the_output_tree() {
    let yaml = REPORT.replace(
        "    map_from: topics\n",
        "    map_from: topics\n    publish: true\n",
    );
    let fake = Arc::new(
        FakeBackend::new("fake")
            .respond("List topics", r#"[{"topic":"alpha"},{"topic":"beta"}]"#)
            .fail("Write beta", "nope"),
    );
    let runner = runner_with(Path::new("/unused"), vec![dynamic(&fake)]);
    let run = MemoryRun::new();

    run.run(&runner, &pipeline(&yaml), &[], RunOptions::default())
        .await
        .unwrap();

    let paths = published(&run);
    assert_eq!(paths.len(), 1);
    for path in &paths {
        let file = path.rsplit('/').next().unwrap();
        assert!(file == "output.md" || file == "output.json", "unexpected {}", path);
    }
}

#[tokio::test]
async fn output_tree_is_rebuilt_on_every_invocation() {
    let fake = fake();
    let runner = runner_with(Path::new("/unused"), vec![dynamic(&fake)]);
    let run = MemoryRun::new();
    let pipeline = pipeline(REPORT);

    run.run(&runner, &pipeline, &[], RunOptions::default())
        .await
        .unwrap();
    run.state()
        .write_text(Path::new("output/stray.txt"), "left behind")
        .unwrap();

    run.run(&runner, &pipeline, &[], RunOptions::default())
        .await
        .unwrap();
    assert_eq!(published(&run), vec!["output/summary/output.md".to_string()]);
}

#[tokio::test]
async fn stopped_runs_publish_what_exists() {
    let fake = fake();
    let runner = runner_with(Path::new("/unused"), vec![dynamic(&fake)]);
    let run = MemoryRun::new();

    run.run(&runner, &pipeline(REPORT), &[], stop_after("sections"))
        .await
        .unwrap();

    assert!(published(&run).is_empty());
    let record = run.run_record();
    assert!(record.output.unwrap().artifacts.is_empty());
    assert!(run.log_lines().iter().any(|l| l == "publish artifacts=0 path=output"));
}
