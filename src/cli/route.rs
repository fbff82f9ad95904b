//! CLI route: single route table and run context. Dispatches to the runner and presentation.

use crate::cli::parse::{parse_params, Commands};
use crate::cli::presentation::{
    format_run_status_json, format_run_status_text, format_validate_json, format_validate_text,
};
use crate::config::{ConfigLoader, RunnerConfig};
use crate::pipeline::load_pipeline;
use crate::runner::{RunOptions, Runner};
use crate::store::{FsArtifactStore, RunRecord, StateStore};
use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Runtime context for CLI execution: workspace and loaded configuration.
pub struct RunContext {
    workspace_root: PathBuf,
    config: RunnerConfig,
}

impl RunContext {
    /// Create run context from workspace root and optional config path.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(ref path) => ConfigLoader::load_from_file(path),
            None => ConfigLoader::load(&workspace_root),
        }
        .context("Failed to load configuration")?;
        Ok(Self {
            workspace_root,
            config,
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Execute a CLI command via the single route table.
    pub fn execute(&self, command: &Commands) -> anyhow::Result<String> {
        match command {
            Commands::Run {
                pipeline,
                run_dir,
                from_stage,
                stop_after,
                stage,
                concurrency,
                runs_root,
                params,
            } => {
                let options = RunOptions {
                    run_dir: run_dir.clone(),
                    start_stage: from_stage.clone(),
                    stop_after: stop_after.clone(),
                    stage_only: stage.clone(),
                    concurrency_override: *concurrency,
                };
                self.handle_run(pipeline, runs_root.as_deref(), params, options)
            }
            Commands::Status { run_dir, format } => self.handle_status(run_dir, format),
            Commands::Validate { pipeline, format } => self.handle_validate(pipeline, format),
        }
    }

    fn handle_run(
        &self,
        pipeline_path: &Path,
        runs_root: Option<&Path>,
        raw_params: &[String],
        options: RunOptions,
    ) -> anyhow::Result<String> {
        let params = parse_params(raw_params)?;
        let pipeline = load_pipeline(pipeline_path)?;

        let mut runner = Runner::from_config(&self.config, &self.workspace_root);
        if let Some(root) = runs_root {
            runner = runner.with_runs_root(root);
        }

        let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
        let run_dir = runtime.block_on(runner.run(&pipeline, params, options))?;
        info!(run_dir = %run_dir.display(), "Run invocation finished");

        let status = read_run(&run_dir)?.status;
        Ok(format!("run_dir: {}\nstatus: {}", run_dir.display(), status))
    }

    fn handle_status(&self, run_dir: &Path, format: &str) -> anyhow::Result<String> {
        let run = read_run(run_dir)?;
        if format == "json" {
            format_run_status_json(&run)
        } else {
            Ok(format_run_status_text(&run))
        }
    }

    fn handle_validate(&self, pipeline_path: &Path, format: &str) -> anyhow::Result<String> {
        let pipeline = load_pipeline(pipeline_path)?;
        if format == "json" {
            format_validate_json(&pipeline)
        } else {
            Ok(format_validate_text(&pipeline))
        }
    }
}

fn read_run(run_dir: &Path) -> anyhow::Result<RunRecord> {
    let store = FsArtifactStore::open(run_dir)
        .with_context(|| format!("Run directory not found: {}", run_dir.display()))?;
    StateStore::new(Arc::new(store))
        .get_run()?
        .ok_or_else(|| anyhow!("Run metadata not found in {}", run_dir.display()))
}
