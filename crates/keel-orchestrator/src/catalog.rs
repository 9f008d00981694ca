//! Discovery of models that can be loaded.
//!
//! Catalogs feed `list_available_models`. A [`DirectoryCatalog`] scans a
//! models directory (flat files or one sub-directory per model); a
//! [`StaticCatalog`] serves the templates from configuration.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::config::CatalogTemplate;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::format::{FormatDetector, ModelFormat};
use crate::types::{ModelConfiguration, ModelStatus, ModelType};

/// Source of loadable model descriptions.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Catalog name used in logs
    fn name(&self) -> &str;

    /// Models this catalog knows about, with status `Available`.
    async fn list(&self) -> OrchestratorResult<Vec<ModelConfiguration>>;
}

/// Guess a model type from its file name.
pub fn infer_model_type(name: &str, format: ModelFormat) -> ModelType {
    let name = name.to_ascii_lowercase();
    if name.contains("embed") || name.contains("minilm") || name.contains("bge") {
        ModelType::Embedding
    } else if name.contains("whisper") || name.contains("asr") || name.contains("stt") {
        ModelType::Transcription
    } else if name.contains("clip") || name.contains("vit") || name.contains("vision") {
        ModelType::Vision
    } else if name.contains("classif") || name.contains("sentiment") {
        ModelType::Classification
    } else if format.is_transformer() {
        ModelType::Llm
    } else {
        ModelType::Other
    }
}

fn available(id: String, path: PathBuf, format: ModelFormat, model_type: ModelType) -> ModelConfiguration {
    let memory_bytes = std::fs::metadata(&path).map(|m| m.len()).ok();
    ModelConfiguration {
        id,
        provider: format.to_string(),
        model_type,
        status: ModelStatus::Available,
        path: Some(path),
        format: Some(format),
        memory_bytes,
        priority: None,
        context_size: None,
    }
}

// ============================================================================
// Directory scan
// ============================================================================

/// Scans a directory for model files.
///
/// `<dir>/name.gguf` is listed as `name`; `<dir>/name/` holding a model file
/// is listed as `name`, matching the filesystem store layout.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
    detector: FormatDetector,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            detector: FormatDetector::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan(&self) -> OrchestratorResult<Vec<ModelConfiguration>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(OrchestratorError::Storage(format!(
                    "failed to read models directory {}: {e}",
                    self.root.display()
                )));
            }
        };

        let mut models = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Some((file, format)) = self.first_model_in(&path) {
                    models.push(available(
                        id.to_string(),
                        file,
                        format,
                        infer_model_type(id, format),
                    ));
                }
                continue;
            }

            let format = self.detector.detect(&path);
            if !format.is_known() {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|n| n.to_str()) {
                let model_type = infer_model_type(id, format);
                models.push(available(id.to_string(), path.clone(), format, model_type));
            }
        }
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models.dedup_by(|a, b| a.id == b.id);
        Ok(models)
    }

    fn first_model_in(&self, dir: &Path) -> Option<(PathBuf, ModelFormat)> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        files.into_iter().find_map(|p| {
            let format = self.detector.detect(&p);
            format.is_known().then_some((p, format))
        })
    }
}

#[async_trait]
impl ModelCatalog for DirectoryCatalog {
    fn name(&self) -> &str {
        "directory"
    }

    async fn list(&self) -> OrchestratorResult<Vec<ModelConfiguration>> {
        let catalog = self.clone();
        tokio::task::spawn_blocking(move || catalog.scan())
            .await
            .map_err(|e| OrchestratorError::Storage(e.to_string()))?
    }
}

// ============================================================================
// Configured templates
// ============================================================================

/// Models declared in configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    templates: Vec<CatalogTemplate>,
}

impl StaticCatalog {
    pub fn new(templates: Vec<CatalogTemplate>) -> Self {
        Self { templates }
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[async_trait]
impl ModelCatalog for StaticCatalog {
    fn name(&self) -> &str {
        "static"
    }

    async fn list(&self) -> OrchestratorResult<Vec<ModelConfiguration>> {
        let detector = FormatDetector::new();
        Ok(self
            .templates
            .iter()
            .map(|t| {
                let format = detector.detect(&t.path);
                let mut config = available(t.id.clone(), t.path.clone(), format, t.model_type);
                if let Some(provider) = &t.provider {
                    config.provider = provider.clone();
                }
                config
            })
            .collect())
    }
}
