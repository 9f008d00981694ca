//! `keel models` command implementation

use crate::output::{OutputFormat, emit};
use anyhow::bail;
use colored::Colorize;
use keel_orchestrator::storage::format_bytes;
use keel_orchestrator::{DownloadSource, ModelOrchestrator, OrchestratorConfig, ProgressReporter};
use serde::Serialize;

fn orchestrator(config: OrchestratorConfig) -> anyhow::Result<ModelOrchestrator> {
    Ok(ModelOrchestrator::builder(config).build()?)
}

/// Execute `keel models list`
pub async fn list(config: OrchestratorConfig, output: OutputFormat) -> anyhow::Result<()> {
    if config.models_dir.is_none() && config.catalog.is_empty() {
        bail!("no models directory or catalog configured (use --models-dir or KEEL_MODELS_DIR)");
    }
    let models = orchestrator(config)?.list_available_models().await;
    emit(&models, output, |models| {
        if models.is_empty() {
            println!("No models found");
            return;
        }
        for m in models {
            let size = m.memory_bytes.map(format_bytes).unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<24} {:<12} {:<14} {}",
                m.id.cyan(),
                m.provider,
                m.model_type.to_string(),
                size
            );
        }
    })
}

#[derive(Debug, Serialize)]
struct Downloaded {
    id: String,
    size_bytes: u64,
}

/// Execute `keel models download`
pub async fn download(
    config: OrchestratorConfig,
    id: &str,
    source: &str,
    sha256: Option<String>,
    filename: Option<String>,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config)?;
    let mut source = DownloadSource::new(source);
    if let Some(sha256) = sha256 {
        source = source.with_sha256(sha256);
    }
    if let Some(filename) = filename {
        source = source.with_filename(filename);
    }

    let (progress, mut rx) = ProgressReporter::channel();
    let show_progress = output == OutputFormat::Text;
    let printer = tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            if show_progress {
                eprint!("\r  {:>5.1}%  {:<40}", p.fraction * 100.0, p.message);
            }
        }
        if show_progress {
            eprintln!();
        }
    });

    let result = orchestrator.download_model(id, source, &progress).await;
    drop(progress);
    let _ = printer.await;
    result?;

    let size_bytes = orchestrator.get_model_size(id).await?;
    emit(&Downloaded { id: id.to_string(), size_bytes }, output, |d| {
        println!("{} {} ({})", "Stored".green(), d.id, format_bytes(d.size_bytes));
    })
}

#[derive(Debug, Serialize)]
struct Size {
    id: String,
    size_bytes: u64,
    size: String,
}

/// Execute `keel models size`
pub async fn size(config: OrchestratorConfig, id: &str, output: OutputFormat) -> anyhow::Result<()> {
    let size_bytes = orchestrator(config)?.get_model_size(id).await?;
    let report = Size {
        id: id.to_string(),
        size_bytes,
        size: format_bytes(size_bytes),
    };
    emit(&report, output, |s| println!("{}: {}", s.id, s.size))
}

/// Execute `keel models delete`
pub async fn delete(config: OrchestratorConfig, id: &str, output: OutputFormat) -> anyhow::Result<()> {
    let deleted = orchestrator(config)?.delete_model(id).await?;
    emit(&serde_json::json!({ "id": id, "deleted": deleted }), output, |_| {
        if deleted {
            println!("{} {}", "Deleted".green(), id);
        } else {
            println!("{} {} is not stored", "Skipped".yellow(), id);
        }
    })
}
