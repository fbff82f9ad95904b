//! CLI parse: clap types for promptline, plus run parameter parsing.

use crate::error::PipelineError;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Promptline - resumable multi-stage prompt pipelines
#[derive(Parser)]
#[command(name = "promptline")]
#[command(about = "Run multi-stage LLM prompt pipelines with resumable, on-disk run state")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline, or resume an existing run
    Run {
        /// Path to the pipeline YAML
        pipeline: PathBuf,

        /// Resume this run directory
        #[arg(long)]
        run_dir: Option<PathBuf>,

        /// First stage to execute (requires --run-dir)
        #[arg(long = "from-stage")]
        from_stage: Option<String>,

        /// Last stage to execute
        #[arg(long)]
        stop_after: Option<String>,

        /// Execute exactly one stage
        #[arg(long)]
        stage: Option<String>,

        /// Worker pool size for map stages
        #[arg(long)]
        concurrency: Option<usize>,

        /// Directory new runs are created under (overrides config)
        #[arg(long)]
        runs_root: Option<PathBuf>,

        /// Pipeline parameters as `--name value` or `--name=value`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        params: Vec<String>,
    },
    /// Show a run's status
    Status {
        /// Run directory to inspect
        #[arg(long)]
        run_dir: PathBuf,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Load and validate a pipeline definition
    Validate {
        /// Path to the pipeline YAML
        pipeline: PathBuf,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
}

/// Parse trailing `--name value` / `--name=value` pairs into run parameters.
pub fn parse_params(args: &[String]) -> Result<BTreeMap<String, String>, PipelineError> {
    let mut params = BTreeMap::new();
    let mut tokens = args.iter();
    while let Some(token) = tokens.next() {
        let Some(key) = token.strip_prefix("--") else {
            return Err(PipelineError::Configuration(format!(
                "Unexpected argument: {}",
                token
            )));
        };
        let (name, value) = match key.split_once('=') {
            Some((name, value)) => (name, value.to_string()),
            None => match tokens.next() {
                Some(value) => (key, value.clone()),
                None => {
                    return Err(PipelineError::Configuration(format!(
                        "Missing value for parameter: {}",
                        key
                    )))
                }
            },
        };
        if name.is_empty() {
            return Err(PipelineError::Configuration(
                "Parameter name cannot be empty.".to_string(),
            ));
        }
        params.insert(name.to_string(), value);
    }
    Ok(params)
}
