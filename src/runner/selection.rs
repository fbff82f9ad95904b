//! Stage range selection

use crate::error::PipelineError;
use crate::pipeline::Pipeline;
use crate::runner::RunOptions;

/// Inclusive range of stage indices one invocation executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRange {
    pub start: usize,
    pub stop: usize,
}

impl StageRange {
    /// Resolve `--stage`, `--start-stage` and `--stop-after` against the pipeline.
    pub fn resolve(pipeline: &Pipeline, options: &RunOptions) -> Result<Self, PipelineError> {
        let last = pipeline.stages.len().saturating_sub(1);

        if let Some(only) = options.stage_only.as_deref() {
            if options.start_stage.is_some() || options.stop_after.is_some() {
                return Err(PipelineError::Configuration(
                    "Use --stage by itself, not with --start-stage or --stop-after.".to_string(),
                ));
            }
            let index = index_of(pipeline, only)?;
            return Ok(Self {
                start: index,
                stop: index,
            });
        }

        let start = match options.start_stage.as_deref() {
            Some(id) => index_of(pipeline, id)?,
            None => 0,
        };
        let stop = match options.stop_after.as_deref() {
            Some(id) => index_of(pipeline, id)?,
            None => last,
        };
        if start > stop {
            return Err(PipelineError::Configuration(format!(
                "Start stage '{}' comes after stop stage '{}'.",
                pipeline.stages[start].id, pipeline.stages[stop].id
            )));
        }
        Ok(Self { start, stop })
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.start..=self.stop).contains(&index)
    }

    /// A new run has no upstream outputs, so it must begin at the first stage.
    pub fn require_fresh_start(&self) -> Result<(), PipelineError> {
        if self.start > 0 {
            return Err(PipelineError::Configuration(
                "Starting after the first stage requires --run-dir to resume an existing run."
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn index_of(pipeline: &Pipeline, stage_id: &str) -> Result<usize, PipelineError> {
    pipeline.index_of(stage_id).ok_or_else(|| {
        PipelineError::Configuration(format!(
            "Unknown stage '{}'. Available: {}",
            stage_id,
            pipeline.stage_ids().join(", ")
        ))
    })
}
