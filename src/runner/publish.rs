//! Publisher: copy final artifacts into `output/`.

use super::now;
use crate::error::PipelineError;
use crate::pipeline::Pipeline;
use crate::store::{layout, PublishRecord, PublishedArtifact, RunRecord, StateStore};
use tracing::info;

/// Rebuild `output/` from the publish targets. The run's publish record is only
/// replaced when the artifact list changed or the run made progress.
pub(crate) fn publish_outputs(
    state: &StateStore,
    pipeline: &Pipeline,
    run: &mut RunRecord,
    progressed: bool,
) -> Result<(), PipelineError> {
    let store = state.artifacts();
    let output_root = layout::output_dir();
    store.remove_tree(&output_root)?;

    let mut artifacts = Vec::new();
    for stage in pipeline.publish_targets() {
        if stage.is_map() {
            for item_id in store.list_children(&layout::items_dir(&stage.id))? {
                let source = layout::item_output(stage, &item_id);
                if !store.exists(&source)? {
                    continue;
                }
                let target = output_root
                    .join(&stage.id)
                    .join(&item_id)
                    .join(stage.output.file_name());
                store.copy(&source, &target)?;
                artifacts.push(PublishedArtifact {
                    stage_id: stage.id.clone(),
                    item_id: Some(item_id),
                    output_path: layout::display(&target),
                });
            }
        } else {
            let source = layout::stage_output(stage);
            if !store.exists(&source)? {
                continue;
            }
            let target = output_root.join(&stage.id).join(stage.output_file_name());
            store.copy(&source, &target)?;
            artifacts.push(PublishedArtifact {
                stage_id: stage.id.clone(),
                item_id: None,
                output_path: layout::display(&target),
            });
        }
    }

    let count = artifacts.len();
    let unchanged = run
        .output
        .as_ref()
        .map(|published| published.artifacts == artifacts)
        .unwrap_or(false);
    if progressed || !unchanged {
        run.output = Some(PublishRecord {
            published_at: now(),
            path: layout::display(&output_root),
            artifacts,
        });
        state.put_run(run)?;
    }
    state.log(&format!(
        "publish artifacts={} path={}",
        count,
        layout::display(&output_root)
    ))?;
    info!(artifacts = count, "Published outputs");
    Ok(())
}
