//! CLI domain: parse, route, and presentation only.
//! No orchestration here; the route table dispatches to the runner and formatters.

mod parse;
mod presentation;
mod route;

pub use parse::{parse_params, Cli, Commands};
pub use presentation::{
    format_run_status_json, format_run_status_text, format_section_heading,
    format_validate_json, format_validate_text,
};
pub use route::RunContext;

/// Render an error chain for stderr.
pub fn map_error(e: &anyhow::Error) -> String {
    format!("Error: {:#}", e)
}
