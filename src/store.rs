//! Run State Store
//!
//! The run directory is the database. Stage and item status is derived from which
//! artifacts exist, so a run can be resumed from whatever it left on disk.
//! [`ArtifactStore`] is the byte-level seam over run-relative paths and [`StateStore`]
//! layers the typed records on top of it.

pub mod fs;
pub mod layout;
pub mod memory;
pub mod records;

pub use fs::FsArtifactStore;
pub use memory::MemoryArtifactStore;
pub use records::{
    BatchRequestEntry, BatchState, ExecutionMode, ItemRecord, ItemStatus, ManifestEntry,
    PublishRecord, PublishedArtifact, RunRecord, RunStatus, StageManifest, StageRecord,
    StageStatus,
};

use crate::error::StorageError;
use crate::pipeline::Stage;
use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::info;

/// Byte storage addressed by paths relative to a run root.
pub trait ArtifactStore: Send + Sync {
    /// Absolute location of the run, used for display and `--run-dir`.
    fn root(&self) -> &Path;

    /// `None` when the artifact does not exist.
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the artifact. Readers never observe a partial write.
    fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError>;

    fn exists(&self, path: &Path) -> Result<bool, StorageError>;

    /// Append one line to a log artifact, creating it if needed.
    fn append_log(&self, path: &Path, line: &str) -> Result<(), StorageError>;

    /// Names of the direct children of a directory, sorted. Missing directories are empty.
    fn list_children(&self, path: &Path) -> Result<Vec<String>, StorageError>;

    fn copy(&self, from: &Path, to: &Path) -> Result<(), StorageError>;

    /// Remove a directory tree. Missing trees are ignored.
    fn remove_tree(&self, path: &Path) -> Result<(), StorageError>;
}

/// Reject absolute paths and parent traversal so artifacts stay inside the run.
pub(crate) fn check_relative(path: &Path) -> Result<(), StorageError> {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || path.as_os_str().is_empty() {
        return Err(StorageError::InvalidPath(path.display().to_string()));
    }
    Ok(())
}

/// Typed access to run, stage and item records
#[derive(Clone)]
pub struct StateStore {
    artifacts: Arc<dyn ArtifactStore>,
}

impl StateStore {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { artifacts }
    }

    pub fn root(&self) -> &Path {
        self.artifacts.root()
    }

    pub fn artifacts(&self) -> &dyn ArtifactStore {
        self.artifacts.as_ref()
    }

    pub fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        self.artifacts.exists(path)
    }

    pub fn read_text(&self, path: &Path) -> Result<Option<String>, StorageError> {
        match self.artifacts.read(path)? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    pub fn write_text(&self, path: &Path, text: &str) -> Result<(), StorageError> {
        self.artifacts.write(path, text.as_bytes())
    }

    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StorageError> {
        let Some(bytes) = self.artifacts.read(path)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::invalid_json("Artifact", self.root().join(path), &e))
    }

    /// Pretty-printed JSON with a trailing newline.
    pub fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        let mut text = serde_json::to_string_pretty(value)
            .map_err(|e| StorageError::invalid_json("Artifact", self.root().join(path), &e))?;
        text.push('\n');
        self.artifacts.write(path, text.as_bytes())
    }

    pub fn get_run(&self) -> Result<Option<RunRecord>, StorageError> {
        self.read_json(&layout::run_record())
    }

    pub fn put_run(&self, run: &RunRecord) -> Result<(), StorageError> {
        self.write_json(&layout::run_record(), run)
    }

    pub fn get_stage(&self, stage_id: &str) -> Result<Option<StageRecord>, StorageError> {
        self.read_json(&layout::stage_record(stage_id))
    }

    /// Write the stage record and mirror it into the run record.
    pub fn put_stage(&self, run: &mut RunRecord, record: StageRecord) -> Result<(), StorageError> {
        self.write_json(&layout::stage_record(&record.stage_id), &record)?;
        run.stages.insert(record.stage_id.clone(), record);
        self.put_run(run)
    }

    pub fn stage_completed(&self, stage: &Stage) -> Result<bool, StorageError> {
        self.exists(&layout::stage_output(stage))
    }

    pub fn item_completed(&self, stage: &Stage, item_id: &str) -> Result<bool, StorageError> {
        self.exists(&layout::item_output(stage, item_id))
    }

    pub fn get_item(&self, stage_id: &str, item_id: &str) -> Result<Option<ItemRecord>, StorageError> {
        self.read_json(&layout::item_record(stage_id, item_id))
    }

    pub fn put_item(&self, record: &ItemRecord) -> Result<(), StorageError> {
        self.write_json(&layout::item_record(&record.stage_id, &record.item_id), record)
    }

    /// Append a timestamped line to `run.log` and mirror it to tracing.
    pub fn log(&self, message: &str) -> Result<(), StorageError> {
        info!(run_dir = %self.root().display(), "{}", message);
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.artifacts
            .append_log(&layout::run_log(), &format!("[{}] {}", stamp, message))
    }
}
