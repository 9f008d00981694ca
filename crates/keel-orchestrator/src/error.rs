//! Error types for the orchestrator.
//!
//! Two layers:
//! - [`EngineError`] is what a native engine (graph runtime or transformer
//!   runtime) reports. It never leaves the crate unwrapped.
//! - [`OrchestratorError`] is the public taxonomy. Engine failures reach
//!   callers wrapped in [`OrchestratorError::ModelLoadFailure`] or
//!   [`OrchestratorError::InferenceFailure`] with the engine error as source.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

// ============================================================================
// Engine errors
// ============================================================================

/// Errors reported by native engines and backend sessions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// No engine is linked for this backend family.
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// Session, weight block or context construction failed.
    #[error("construction failed: {0}")]
    Construction(String),

    /// The engine failed while executing a request.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The input could not be shaped for this session.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Reading model data failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation observed a cancellation request.
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

// ============================================================================
// Orchestrator errors
// ============================================================================

/// Coarse classification of an [`OrchestratorError`], carried on error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InsufficientMemory,
    UnsupportedFormat,
    ModelLoadFailure,
    ModelNotLoaded,
    InferenceFailure,
    Cancelled,
    InvalidRequest,
    Storage,
    Config,
}

/// Public error taxonomy of the orchestrator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// The model does not fit in the budget even after eviction.
    /// Recoverable: unload models and retry.
    #[error(
        "insufficient memory for '{model_id}': need {required} bytes, {available} bytes available"
    )]
    InsufficientMemory {
        model_id: String,
        required: u64,
        available: u64,
    },

    /// The file is not a recognized model format.
    #[error("unsupported model format for '{model_id}': {}", path.display())]
    UnsupportedFormat { model_id: String, path: PathBuf },

    /// A native session could not be constructed.
    #[error("failed to load model '{model_id}': {source}")]
    ModelLoadFailure {
        model_id: String,
        #[source]
        source: EngineError,
    },

    /// Inference or a parameter update targeted an identifier that is not resident.
    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),

    /// The backend failed while running inference.
    #[error("inference failed on '{model_id}': {source}")]
    InferenceFailure {
        model_id: String,
        #[source]
        source: EngineError,
    },

    /// The caller cancelled the operation. No partial state remains.
    #[error("operation cancelled")]
    Cancelled,

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientMemory { .. } => ErrorKind::InsufficientMemory,
            Self::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            Self::ModelLoadFailure { .. } => ErrorKind::ModelLoadFailure,
            Self::ModelNotLoaded(_) => ErrorKind::ModelNotLoaded,
            Self::InferenceFailure { .. } => ErrorKind::InferenceFailure,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether retrying after freeing resources can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InsufficientMemory { .. })
    }

    /// Errors that describe a system failure rather than caller misuse or
    /// cancellation. Only these are published as `ModelError` events.
    pub fn is_reportable(&self) -> bool {
        !matches!(
            self,
            Self::ModelNotLoaded(_) | Self::InvalidRequest(_) | Self::Cancelled
        )
    }

    pub(crate) fn load_failure(model_id: &str, source: EngineError) -> Self {
        if source.is_cancelled() {
            return Self::Cancelled;
        }
        Self::ModelLoadFailure {
            model_id: model_id.to_string(),
            source,
        }
    }

    pub(crate) fn inference_failure(model_id: &str, source: EngineError) -> Self {
        if source.is_cancelled() {
            return Self::Cancelled;
        }
        Self::InferenceFailure {
            model_id: model_id.to_string(),
            source,
        }
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
