//! Integration tests for resumable prompt pipeline runs

mod batch_stages;
mod cli_commands;
mod disabled_stages;
mod publish_outputs;
pub mod test_utils;
