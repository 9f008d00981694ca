//! Command implementations

pub mod config_cmd;
pub mod detect;
pub mod estimate;
pub mod hardware;
pub mod models;

use anyhow::Context;
use keel_orchestrator::OrchestratorConfig;
use std::path::{Path, PathBuf};

/// Effective configuration: file (or environment) plus CLI overrides.
pub fn load_config(path: Option<&Path>, models_dir: Option<PathBuf>) -> anyhow::Result<OrchestratorConfig> {
    let mut config = match path {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => OrchestratorConfig::from_env().context("invalid KEEL_* environment configuration")?,
    };
    if let Some(dir) = models_dir {
        config.models_dir = Some(dir);
    }
    tracing::debug!(
        source = path.map_or("environment".to_string(), |p| p.display().to_string()),
        models_dir = ?config.models_dir,
        "configuration loaded"
    );
    Ok(config)
}
