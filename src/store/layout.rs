//! Run directory layout. Every path here is relative to the run root.
//!
//! ```text
//! run.json, run.log
//! stages/<stage>/{stage.json, output.md|output.json}
//! stages/<stage>/items/<item>/{item.json, stage.json, output.*}
//! logs/stages/<stage>/{raw.txt, error.json, items/<item>/...}
//! support/stages/<stage>/{context.json, request.json, response.json, batch.json, batch_input.jsonl, items/<item>/...}
//! output/<stage>/...
//! ```

use crate::pipeline::Stage;
use std::path::{Path, PathBuf};

pub const RUN_RECORD: &str = "run.json";
pub const RUN_LOG: &str = "run.log";
pub const OUTPUT_DIR: &str = "output";

const STAGES: &str = "stages";
const ITEMS: &str = "items";
const LOGS: &str = "logs";
const SUPPORT: &str = "support";

pub fn run_record() -> PathBuf {
    PathBuf::from(RUN_RECORD)
}

pub fn run_log() -> PathBuf {
    PathBuf::from(RUN_LOG)
}

pub fn stage_dir(stage_id: &str) -> PathBuf {
    Path::new(STAGES).join(stage_id)
}

pub fn stage_record(stage_id: &str) -> PathBuf {
    stage_dir(stage_id).join("stage.json")
}

/// The artifact whose presence marks a stage complete.
pub fn stage_output(stage: &Stage) -> PathBuf {
    stage_dir(&stage.id).join(stage.output_file_name())
}

pub fn items_dir(stage_id: &str) -> PathBuf {
    stage_dir(stage_id).join(ITEMS)
}

pub fn item_dir(stage_id: &str, item_id: &str) -> PathBuf {
    items_dir(stage_id).join(item_id)
}

pub fn item_payload(stage_id: &str, item_id: &str) -> PathBuf {
    item_dir(stage_id, item_id).join("item.json")
}

pub fn item_record(stage_id: &str, item_id: &str) -> PathBuf {
    item_dir(stage_id, item_id).join("stage.json")
}

pub fn item_output(stage: &Stage, item_id: &str) -> PathBuf {
    item_dir(&stage.id, item_id).join(stage.output.file_name())
}

pub fn stage_logs_dir(stage_id: &str) -> PathBuf {
    Path::new(LOGS).join(STAGES).join(stage_id)
}

pub fn item_logs_dir(stage_id: &str, item_id: &str) -> PathBuf {
    stage_logs_dir(stage_id).join(ITEMS).join(item_id)
}

pub fn stage_support_dir(stage_id: &str) -> PathBuf {
    Path::new(SUPPORT).join(STAGES).join(stage_id)
}

pub fn item_support_dir(stage_id: &str, item_id: &str) -> PathBuf {
    stage_support_dir(stage_id).join(ITEMS).join(item_id)
}

pub fn batch_state(stage_id: &str) -> PathBuf {
    stage_support_dir(stage_id).join("batch.json")
}

pub fn batch_input(stage_id: &str) -> PathBuf {
    stage_support_dir(stage_id).join("batch_input.jsonl")
}

pub fn output_dir() -> PathBuf {
    PathBuf::from(OUTPUT_DIR)
}

/// Run-relative path rendered with forward slashes for records.
pub fn display(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
