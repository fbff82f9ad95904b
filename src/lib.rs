//! Promptline: Resumable Prompt Pipelines
//!
//! Runs an ordered list of LLM prompt stages against a run directory. Every artifact,
//! record and log line lives on disk, so an interrupted or partially-failed run resumes
//! from exactly where it stopped. Stages run once (single) or once per item (map),
//! serially, through a bounded worker pool, or as a provider batch job.

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod provider;
pub mod recovery;
pub mod runner;
pub mod store;
