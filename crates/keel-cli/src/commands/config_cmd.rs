//! `keel config` command implementation

use crate::output::{OutputFormat, emit};
use anyhow::Context;
use colored::Colorize;
use keel_orchestrator::OrchestratorConfig;
use std::path::Path;

/// Execute `keel config show`
pub fn show(config: &OrchestratorConfig, output: OutputFormat) -> anyhow::Result<()> {
    emit(config, output, |config| {
        // serde_json output doubles as the text form
        match serde_json::to_string_pretty(config) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("{} {e}", "error:".red()),
        }
    })
}

/// Execute `keel config validate`
pub fn validate(path: &Path) -> anyhow::Result<()> {
    OrchestratorConfig::load(path)
        .with_context(|| format!("{} is not a valid configuration", path.display()))?;
    println!("{} {}", "Valid".green(), path.display());
    Ok(())
}
