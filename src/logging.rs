//! Process diagnostics
//!
//! Events emitted through `tracing` while a pipeline executes go to the subscriber
//! installed here. The durable `run.log` inside a run directory is written by the
//! state store and is independent of this setup.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const ENV_FILTER: &str = "PROMPTLINE_LOG";
const ENV_FORMAT: &str = "PROMPTLINE_LOG_FORMAT";
const ENV_OUTPUT: &str = "PROMPTLINE_LOG_OUTPUT";
const ENV_MODULES: &str = "PROMPTLINE_LOG_MODULES";

/// `[logging]` table of the layered configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level directive: trace, debug, info, warn, error or off
    pub level: String,
    /// `text` or `json`
    pub format: String,
    /// `stdout`, `stderr` or `file`
    pub output: String,
    /// Destination when `output = "file"`
    pub file: PathBuf,
    /// ANSI colors for terminal output
    pub color: bool,
    /// Per-target overrides, e.g. `promptline::runner = "debug"`
    pub modules: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            output: "stderr".to_string(),
            file: PathBuf::from("promptline.log"),
            color: true,
            modules: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Result<Self, PipelineError> {
        match value {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(PipelineError::Configuration(format!(
                "Invalid log format: {} (expected text or json)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogTarget {
    Stdout,
    Stderr,
    File,
}

impl LogTarget {
    fn parse(value: &str) -> Result<Self, PipelineError> {
        match value {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "file" => Ok(Self::File),
            other => Err(PipelineError::Configuration(format!(
                "Invalid log output: {} (expected stdout, stderr or file)",
                other
            ))),
        }
    }
}

/// Install the global subscriber.
///
/// `PROMPTLINE_LOG*` variables override the supplied configuration. A second call
/// keeps whichever subscriber was installed first.
pub fn init_logging(config: Option<&LoggingConfig>) -> Result<(), PipelineError> {
    let defaults = LoggingConfig::default();
    let config = config.unwrap_or(&defaults);

    let format = match std::env::var(ENV_FORMAT) {
        Ok(value) => LogFormat::parse(value.trim())?,
        Err(_) => LogFormat::parse(&config.format)?,
    };
    let target = match std::env::var(ENV_OUTPUT) {
        Ok(value) => LogTarget::parse(value.trim())?,
        Err(_) => LogTarget::parse(&config.output)?,
    };
    let filter = env_filter(config)?;
    let ansi = config.color && target != LogTarget::File;
    let writer = make_writer(target, &config.file)?;

    let registry = Registry::default().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

fn make_writer(target: LogTarget, file: &Path) -> Result<BoxMakeWriter, PipelineError> {
    Ok(match target {
        LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogTarget::File => {
            if let Some(dir) = file.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).map_err(|e| {
                    PipelineError::Configuration(format!(
                        "Cannot create log directory {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
            }
            let handle = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .map_err(|e| {
                    PipelineError::Configuration(format!(
                        "Cannot open log file {}: {}",
                        file.display(),
                        e
                    ))
                })?;
            BoxMakeWriter::new(std::sync::Mutex::new(handle))
        }
    })
}

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, PipelineError> {
    if let Ok(filter) = EnvFilter::try_from_env(ENV_FILTER) {
        return Ok(filter);
    }
    if config.level == "off" {
        return Ok(EnvFilter::new("off"));
    }

    let mut directives: Vec<String> = config
        .modules
        .iter()
        .map(|(target, level)| format!("{}={}", target, level))
        .collect();
    if let Ok(extra) = std::env::var(ENV_MODULES) {
        directives.extend(module_directives(&extra));
    }

    let mut filter = EnvFilter::new(&config.level);
    for directive in directives {
        let parsed = directive.parse().map_err(|e| {
            PipelineError::Configuration(format!("Invalid log directive '{}': {}", directive, e))
        })?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}

/// `a=debug, b = warn` into `["a=debug", "b=warn"]`; malformed pairs are dropped.
fn module_directives(spec: &str) -> Vec<String> {
    spec.split(',')
        .filter_map(|pair| {
            let (target, level) = pair.split_once('=')?;
            let (target, level) = (target.trim(), level.trim());
            (!target.is_empty() && !level.is_empty()).then(|| format!("{}={}", target, level))
        })
        .collect()
}
