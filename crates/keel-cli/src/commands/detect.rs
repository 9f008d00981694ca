//! `keel detect` command implementation

use crate::output::{OutputFormat, emit};
use colored::Colorize;
use keel_orchestrator::{FormatDetector, ModelFormat};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Serialize)]
pub struct Detection {
    pub path: String,
    pub format: ModelFormat,
    pub backend: &'static str,
}

pub fn classify(paths: &[PathBuf]) -> Vec<Detection> {
    let detector = FormatDetector::new();
    paths
        .iter()
        .map(|path| {
            let format = detector.detect(path);
            let backend = if format.is_graph() {
                "graph"
            } else if format.is_transformer() {
                "transformer"
            } else {
                "unsupported"
            };
            Detection {
                path: path.display().to_string(),
                format,
                backend,
            }
        })
        .collect()
}

/// Execute the `keel detect` command
pub fn run(paths: &[PathBuf], output: OutputFormat) -> anyhow::Result<()> {
    let detections = classify(paths);
    emit(&detections, output, |detections| {
        for d in detections {
            let format = if d.format.is_known() {
                d.format.to_string().green()
            } else {
                d.format.to_string().red()
            };
            println!("{:<8} {:<12} {}", format, d.backend, d.path);
        }
    })
}
