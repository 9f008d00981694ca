//! Orchestrator configuration
//!
//! [`OrchestratorConfig`] holds the process-wide resource budget and the
//! defaults applied to load/inference requests. It can be built in code or
//! loaded from a TOML, YAML or JSON file:
//!
//! - Format is detected from the file extension
//! - `${VAR}` and `$VAR` references are substituted from the environment
//! - `KEEL_<FIELD>` environment variables override file values
//!   (nested keys use `__`, e.g. `KEEL_MAX_MEMORY_BYTES`)
//!
//! ```toml
//! max_memory_bytes = 68719476736
//! memory_warning_threshold = 60129542144
//! min_memory_buffer = 2147483648
//! models_dir = "${HOME}/models"
//!
//! [[catalog]]
//! id = "whisper-large"
//! path = "/srv/models/whisper-large.onnx"
//! model_type = "transcription"
//! ```

use config::{Config as Cfg, Environment, File, FileFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::ModelType;

pub const GIB: u64 = 1024 * 1024 * 1024;

const DEFAULT_MAX_MEMORY_BYTES: u64 = 120 * GIB;
const DEFAULT_MEMORY_WARNING_THRESHOLD: u64 = 100 * GIB;
const DEFAULT_MIN_MEMORY_BUFFER: u64 = 2 * GIB;
const DEFAULT_CONTEXT_SIZE: u32 = 4096;
const DEFAULT_MAX_TOKENS: u32 = 512;
const DEFAULT_OPTIMIZE_FRACTION: f64 = 1.0 / 3.0;
const DEFAULT_EVENT_CAPACITY: usize = 256;
const DEFAULT_DOWNLOAD_RETRIES: u32 = 3;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 600;

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "KEEL";

/// Configuration loading/validation error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// A model advertised by configuration rather than discovered on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogTemplate {
    pub id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub model_type: ModelType,
    /// Provider label shown in listings; derived from the format when absent
    #[serde(default)]
    pub provider: Option<String>,
}

/// Process-wide orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Hard ceiling on bytes committed to resident models
    pub max_memory_bytes: u64,

    /// Committed bytes above which a resource-threshold event fires
    pub memory_warning_threshold: u64,

    /// Headroom that must stay free after every admitted load
    pub min_memory_buffer: u64,

    /// Context window for transformer models when the request has none
    pub default_context_size: u32,

    /// Token limit for a single transformer generation
    pub default_max_tokens: u32,

    /// Maximum inferences admitted at once across all models.
    /// `None` derives the value from the detected CPU cores; `Some(1)`
    /// serializes every inference.
    pub inference_concurrency: Option<usize>,

    /// Fraction of resident models evicted by `optimize_memory`
    pub optimize_fraction: f64,

    /// Buffered lifecycle events per subscriber before it starts lagging
    pub event_capacity: usize,

    /// Directory scanned for model files and used by the filesystem store
    pub models_dir: Option<PathBuf>,

    /// Retry attempts for a model download
    pub download_retries: u32,

    /// Overall time budget for one model download, in seconds
    pub download_timeout_secs: u64,

    /// Statically advertised models
    pub catalog: Vec<CatalogTemplate>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            memory_warning_threshold: DEFAULT_MEMORY_WARNING_THRESHOLD,
            min_memory_buffer: DEFAULT_MIN_MEMORY_BUFFER,
            default_context_size: DEFAULT_CONTEXT_SIZE,
            default_max_tokens: DEFAULT_MAX_TOKENS,
            inference_concurrency: None,
            optimize_fraction: DEFAULT_OPTIMIZE_FRACTION,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            models_dir: None,
            download_retries: DEFAULT_DOWNLOAD_RETRIES,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            catalog: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Set the memory budget (ceiling, warning threshold, free buffer)
    pub fn with_budget(mut self, max_bytes: u64, warning_bytes: u64, buffer_bytes: u64) -> Self {
        self.max_memory_bytes = max_bytes;
        self.memory_warning_threshold = warning_bytes;
        self.min_memory_buffer = buffer_bytes;
        self
    }

    pub fn with_inference_concurrency(mut self, permits: usize) -> Self {
        self.inference_concurrency = Some(permits);
        self
    }

    pub fn with_models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.models_dir = Some(dir.into());
        self
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_memory_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_memory_bytes",
                reason: "must be > 0".into(),
            });
        }
        if self.min_memory_buffer >= self.max_memory_bytes {
            return Err(ConfigError::Invalid {
                field: "min_memory_buffer",
                reason: format!(
                    "{} must be smaller than max_memory_bytes {}",
                    self.min_memory_buffer, self.max_memory_bytes
                ),
            });
        }
        if self.memory_warning_threshold > self.max_memory_bytes {
            return Err(ConfigError::Invalid {
                field: "memory_warning_threshold",
                reason: format!(
                    "{} exceeds max_memory_bytes {}",
                    self.memory_warning_threshold, self.max_memory_bytes
                ),
            });
        }
        if !(self.optimize_fraction > 0.0 && self.optimize_fraction <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "optimize_fraction",
                reason: "must be in (0, 1]".into(),
            });
        }
        if self.inference_concurrency == Some(0) {
            return Err(ConfigError::Invalid {
                field: "inference_concurrency",
                reason: "must be > 0".into(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "event_capacity",
                reason: "must be > 0".into(),
            });
        }
        if self.default_context_size == 0 {
            return Err(ConfigError::Invalid {
                field: "default_context_size",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Load from a file, apply `KEEL_*` overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_source(&content, format, true)?;
        tracing::debug!(path = %path.display(), "loaded orchestrator config");
        Ok(config)
    }

    /// Parse from a string in the given format (no environment overrides).
    pub fn from_str(content: &str, format: FileFormat) -> ConfigResult<Self> {
        Self::from_source(content, format, false)
    }

    /// Defaults overridden by `KEEL_*` environment variables only.
    pub fn from_env() -> ConfigResult<Self> {
        let config: Self = Cfg::builder()
            .add_source(env_source())
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn from_source(content: &str, format: FileFormat, with_env: bool) -> ConfigResult<Self> {
        let substituted = substitute_env_vars(content);

        let mut builder = Cfg::builder().add_source(File::from_str(&substituted, format));
        if with_env {
            builder = builder.add_source(env_source());
        }

        let config: Self = builder
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

static BRACED_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid braced pattern"));
static BARE_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("valid bare pattern"));

/// Substitute `${VAR}` and `$VAR` references. Unset variables are left as-is.
pub fn substitute_env_vars(content: &str) -> String {
    let braced = BRACED_VAR.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });
    BARE_VAR
        .replace_all(&braced, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
