//! Runner Orchestrator
//!
//! Walks a pipeline's stages in declared order against one run directory. Every state
//! transition is persisted before the next step starts, and "already done" is derived
//! from artifact presence, so an interrupted run resumes exactly where it stopped.
//!
//! Single stages go to [`single`], fan-out stages to [`map`] (which hands batch mode to
//! [`batch`]). The [`publish`] step copies designated outputs into `output/` once the
//! selected range finishes.

mod batch;
mod map;
mod publish;
pub mod selection;
mod single;

pub use map::{prepare_map_item, ExecutionPlan};
pub use selection::StageRange;

use crate::config::RunnerConfig;
use crate::error::{BackendError, PipelineError};
use crate::pipeline::{Pipeline, Stage};
use crate::provider::{BackendRegistry, GenerateRequest, GenerationBackend};
use crate::store::{
    layout, ArtifactStore, FsArtifactStore, RunRecord, RunStatus, StageRecord, StageStatus,
    StateStore,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_MAX_IN_FLIGHT: usize = 4;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Range selection and overrides for one invocation
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Resume this run directory instead of creating a new one
    pub run_dir: Option<PathBuf>,
    pub start_stage: Option<String>,
    pub stop_after: Option<String>,
    /// Run exactly one stage
    pub stage_only: Option<String>,
    /// Worker pool size for every map stage in range
    pub concurrency_override: Option<usize>,
}

/// What a stage executor did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Output artifact already existed; nothing was touched
    AlreadyComplete,
    Completed,
    CompletedWithErrors,
    /// Batch submitted or still running remotely; the run must halt
    Pending,
}

/// One stage's execution scope
pub(crate) struct StageRun<'a> {
    pub runner: &'a Runner,
    pub state: &'a StateStore,
    pub pipeline: &'a Pipeline,
    pub params: &'a BTreeMap<String, String>,
    pub index: usize,
    pub stage: &'a Stage,
    pub concurrency_override: Option<usize>,
}

pub struct Runner {
    runs_root: PathBuf,
    registry: Arc<BackendRegistry>,
    default_max_in_flight: usize,
    request_timeout: Duration,
}

impl Runner {
    pub fn new(runs_root: impl Into<PathBuf>, registry: Arc<BackendRegistry>) -> Self {
        Self {
            runs_root: runs_root.into(),
            registry,
            default_max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn from_config(config: &RunnerConfig, workspace_root: &Path) -> Self {
        let timeout = config.runner.request_timeout();
        let registry = BackendRegistry::new(config.providers.clone(), timeout);
        Self::new(config.runs_root(workspace_root), Arc::new(registry))
            .with_default_max_in_flight(config.runner.default_max_in_flight)
            .with_request_timeout(timeout)
    }

    pub fn with_runs_root(mut self, runs_root: impl Into<PathBuf>) -> Self {
        self.runs_root = runs_root.into();
        self
    }

    pub fn with_default_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.default_max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn runs_root(&self) -> &Path {
        &self.runs_root
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn default_max_in_flight(&self) -> usize {
        self.default_max_in_flight
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Run (or resume) `pipeline` on disk and return the run directory.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        params: BTreeMap<String, String>,
        options: RunOptions,
    ) -> Result<PathBuf, PipelineError> {
        let store: Arc<dyn ArtifactStore> = match &options.run_dir {
            Some(dir) => {
                let missing = || {
                    PipelineError::Dependency(format!("Run metadata not found in {}", dir.display()))
                };
                let store = FsArtifactStore::open(dir).map_err(|_| missing())?;
                if !store.exists(Path::new(layout::RUN_RECORD))? {
                    return Err(missing());
                }
                Arc::new(store)
            }
            None => {
                // Reject bad selectors before a run directory is created
                pipeline.validate()?;
                StageRange::resolve(pipeline, &options)?.require_fresh_start()?;
                Arc::new(FsArtifactStore::create(self.runs_root.join(new_run_id()))?)
            }
        };
        self.run_in_store(store, pipeline, params, options).await
    }

    /// Run against any artifact store. Resumes when a run record already exists.
    pub async fn run_in_store(
        &self,
        store: Arc<dyn ArtifactStore>,
        pipeline: &Pipeline,
        params: BTreeMap<String, String>,
        options: RunOptions,
    ) -> Result<PathBuf, PipelineError> {
        pipeline.validate()?;
        let range = StageRange::resolve(pipeline, &options)?;
        let state = StateStore::new(store);

        let existing = state.get_run()?;
        let fresh = existing.is_none();
        let mut run = match existing {
            Some(run) => {
                if run.pipeline != pipeline.name {
                    return Err(PipelineError::Dependency(
                        "Pipeline name does not match existing run.".to_string(),
                    ));
                }
                state.log(&format!("run status=resumed pipeline={}", pipeline.name))?;
                run
            }
            None => {
                range.require_fresh_start()?;
                new_run_record(&state, pipeline, params)
            }
        };
        // Resumed runs keep the parameters they were started with
        let params = run.params.clone();

        for upstream in pipeline.stages[..range.start].iter().filter(|s| s.enabled) {
            if !state.stage_completed(upstream)? {
                return Err(PipelineError::Dependency(format!(
                    "Cannot start at '{}': upstream stage '{}' is incomplete.",
                    pipeline.stages[range.start].id, upstream.id
                )));
            }
        }

        if fresh {
            state.put_run(&run)?;
            state.log(&format!("run status=started pipeline={}", pipeline.name))?;
            info!(run_id = %run.run_id, pipeline = %pipeline.name, "Run started");
        }

        match self
            .traverse(&state, pipeline, &params, &options, range, &mut run)
            .await
        {
            Ok(()) => Ok(state.root().to_path_buf()),
            Err(err) => {
                if let Err(record_err) = record_run_failure(&state, &mut run, &err) {
                    error!(error = %record_err, "Failed to record run failure");
                }
                Err(err)
            }
        }
    }

    async fn traverse(
        &self,
        state: &StateStore,
        pipeline: &Pipeline,
        params: &BTreeMap<String, String>,
        options: &RunOptions,
        range: StageRange,
        run: &mut RunRecord,
    ) -> Result<(), PipelineError> {
        let disabled: BTreeSet<&str> = pipeline
            .stages
            .iter()
            .filter(|s| !s.enabled)
            .map(|s| s.id.as_str())
            .collect();
        let mut progressed = false;

        for (index, stage) in pipeline.stages.iter().enumerate() {
            if !range.contains(index) {
                continue;
            }

            if !stage.enabled {
                progressed |= record_skipped(state, run, stage)?;
                if index == range.stop {
                    break;
                }
                continue;
            }

            if let Some(dependency) = stage
                .dependencies()?
                .into_iter()
                .find(|dep| disabled.contains(dep.as_str()))
            {
                return Err(record_disabled_dependency(state, run, stage, &dependency)?);
            }

            let scope = StageRun {
                runner: self,
                state,
                pipeline,
                params,
                index,
                stage,
                concurrency_override: options.concurrency_override,
            };
            let outcome = if stage.is_map() {
                map::run_map_stage(&scope, run).await?
            } else {
                single::run_single_stage(&scope, run).await?
            };

            match outcome {
                StageOutcome::AlreadyComplete => {}
                StageOutcome::Pending => {
                    run.status = RunStatus::BatchPending;
                    run.batch_pending_at = Some(now());
                    state.put_run(run)?;
                    state.log("run status=batch_pending")?;
                    info!(stage_id = %stage.id, "Run halted awaiting batch completion");
                    return Ok(());
                }
                StageOutcome::Completed | StageOutcome::CompletedWithErrors => progressed = true,
            }

            if index == range.stop {
                break;
            }
        }

        self.finish(state, pipeline, range, run, progressed)
    }

    fn finish(
        &self,
        state: &StateStore,
        pipeline: &Pipeline,
        range: StageRange,
        run: &mut RunRecord,
        progressed: bool,
    ) -> Result<(), PipelineError> {
        let status = if range.stop + 1 == pipeline.stages.len() {
            if run
                .stages
                .values()
                .any(|s| s.status == StageStatus::CompletedWithErrors)
            {
                RunStatus::CompletedWithErrors
            } else {
                RunStatus::Completed
            }
        } else {
            RunStatus::Stopped
        };

        if progressed || run.status != status {
            let at = now();
            run.status = status;
            run.error = None;
            run.failed_at = None;
            if status == RunStatus::Stopped {
                run.stopped_at = Some(at);
            } else {
                run.completed_at = Some(at);
            }
            state.put_run(run)?;
        }
        state.log(&format!("run status={}", status))?;
        info!(run_id = %run.run_id, status = %status, "Run finished");

        publish::publish_outputs(state, pipeline, run, progressed)
    }
}

fn new_run_record(
    state: &StateStore,
    pipeline: &Pipeline,
    params: BTreeMap<String, String>,
) -> RunRecord {
    let run_id = state
        .root()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(new_run_id);
    RunRecord {
        run_id,
        pipeline: pipeline.name.clone(),
        pipeline_provider: pipeline.provider.clone(),
        pipeline_model: pipeline.model.clone(),
        pipeline_temperature: pipeline.temperature,
        pipeline_reasoning_effort: pipeline.reasoning_effort.clone(),
        pipeline_path: pipeline.path.display().to_string(),
        params,
        status: RunStatus::Started,
        stages: BTreeMap::new(),
        started_at: now(),
        completed_at: None,
        stopped_at: None,
        batch_pending_at: None,
        failed_at: None,
        error: None,
        output: None,
    }
}

/// Record a disabled stage as skipped. Returns whether anything was written.
fn record_skipped(
    state: &StateStore,
    run: &mut RunRecord,
    stage: &Stage,
) -> Result<bool, PipelineError> {
    let already = run
        .stages
        .get(&stage.id)
        .map(|s| s.status == StageStatus::Skipped)
        .unwrap_or(false);
    if already {
        return Ok(false);
    }
    let mut record = StageRecord::for_stage(stage, StageStatus::Skipped);
    record.skip_reason = Some("disabled_in_yaml".to_string());
    record.skipped_at = Some(now());
    state.put_stage(run, record)?;
    state.log(&format!("Stage {} SKIPPED (disabled in pipeline yaml)", stage.id))?;
    Ok(true)
}

fn record_disabled_dependency(
    state: &StateStore,
    run: &mut RunRecord,
    stage: &Stage,
    dependency: &str,
) -> Result<PipelineError, PipelineError> {
    let mut record = StageRecord::for_stage(stage, StageStatus::Failed);
    record.error = Some("disabled_dependency".to_string());
    record.dependency = Some(dependency.to_string());
    record.failed_at = Some(now());
    state.put_stage(run, record)?;
    state.log(&format!(
        "stage:{} status=failed error=disabled_dependency dependency={}",
        stage.id, dependency
    ))?;
    Ok(PipelineError::Dependency(format!(
        "Cannot run stage '{}': dependency '{}' is disabled in pipeline yaml (enabled=false).",
        stage.id, dependency
    )))
}

fn record_run_failure(
    state: &StateStore,
    run: &mut RunRecord,
    err: &PipelineError,
) -> Result<(), PipelineError> {
    let at = now();
    let interrupted: Vec<String> = run
        .stages
        .values()
        .filter(|s| s.status == StageStatus::Started)
        .map(|s| s.stage_id.clone())
        .collect();
    for stage_id in interrupted {
        if let Some(mut record) = run.stages.get(&stage_id).cloned() {
            record.status = StageStatus::Failed;
            record.error.get_or_insert_with(|| err.to_string());
            record.failed_at = Some(at);
            state.put_stage(run, record)?;
        }
    }

    run.status = RunStatus::Failed;
    run.error = Some(err.to_string());
    run.failed_at = Some(at);
    state.put_run(run)?;
    state.log(&format!("run status=failed error={}", err))?;
    warn!(run_id = %run.run_id, kind = err.kind(), error = %err, "Run failed");
    Ok(())
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

/// `<UTC timestamp>_<8 hex chars>`
pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

/// Bound a backend call by the configured timeout.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(timeout.as_secs())),
    }
}

/// Call `generate`, rewriting rejections of the stage's reasoning effort.
pub(crate) async fn generate_text(
    scope: &StageRun<'_>,
    backend: &dyn GenerationBackend,
    request: &GenerateRequest,
) -> Result<String, PipelineError> {
    let stage = scope.stage;
    match with_timeout(scope.runner.request_timeout, backend.generate(request)).await {
        Ok(text) => Ok(text),
        Err(err) => match stage.reasoning_effort.as_deref() {
            Some(effort) if err.to_string().contains("reasoning.effort") => {
                Err(PipelineError::Backend(BackendError::RequestFailed(format!(
                    "Stage '{}' rejected reasoning_effort '{}'. Remove reasoning_effort or use a reasoning-capable model.",
                    stage.id, effort
                ))))
            }
            _ => Err(err.into()),
        },
    }
}

/// Render an optional setting for run log lines.
pub(crate) fn display_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())
}

/// The `provider=.. model=.. temperature=.. reasoning_effort=..` suffix of stage log lines.
pub(crate) fn settings_suffix(stage: &Stage) -> String {
    format!(
        "provider={} model={} temperature={} reasoning_effort={}",
        stage.provider,
        stage.model,
        display_opt(stage.temperature),
        display_opt(stage.reasoning_effort.as_deref())
    )
}
