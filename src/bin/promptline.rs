//! Promptline CLI Binary
//!
//! Command-line interface for running resumable prompt pipelines.

use clap::Parser;
use promptline::cli::{Cli, RunContext};
use promptline::config::ConfigLoader;
use promptline::logging::{init_logging, LoggingConfig};
use std::process;
use tracing::{error, info};

/// Exit status for pipeline and run failures
const EXIT_RUN_ERROR: i32 = 2;
/// Exit status for startup failures (logging, configuration)
const EXIT_INIT_ERROR: i32 = 1;

fn main() {
    let cli = Cli::parse();

    // Build logging config from CLI args, env vars, and config file
    let logging_config = build_logging_config(&cli);

    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(EXIT_INIT_ERROR);
    }

    info!("Promptline CLI starting");

    let context = match RunContext::new(cli.workspace.clone(), cli.config.clone()) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Error initializing CLI context: {:#}", e);
            eprintln!("{}", promptline::cli::map_error(&e));
            process::exit(EXIT_INIT_ERROR);
        }
    };

    match context.execute(&cli.command) {
        Ok(output) => {
            info!("Command completed successfully");
            println!("{}", output);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("{}", promptline::cli::map_error(&e));
            process::exit(EXIT_RUN_ERROR);
        }
    }
}

/// Build logging configuration from CLI args and config file.
/// Precedence: CLI flags override config file override defaults.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    let mut config = if let Some(ref config_path) = cli.config {
        ConfigLoader::load_from_file(config_path)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default()
    } else {
        ConfigLoader::load(&cli.workspace)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default()
    };

    if cli.verbose {
        config.level = "debug".to_string();
    }
    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    if let Some(ref output) = cli.log_output {
        config.output = output.clone();
    }
    if let Some(ref file) = cli.log_file {
        config.file = if file.is_absolute() {
            file.clone()
        } else {
            cli.workspace.join(file)
        };
    }

    config
}
