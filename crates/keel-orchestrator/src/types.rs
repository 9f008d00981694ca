//! Shared request/response types for the orchestrator.
//!
//! These define the caller-visible contract: what a load request carries,
//! what a successful load returns, how inference input and output look,
//! and the shapes of the resource/stats reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::engine::{GenerationParams, Tensor};
use crate::backend::BackendKind;
use crate::format::ModelFormat;
use crate::hardware::Accelerator;

// ============================================================================
// Request side
// ============================================================================

/// Declared purpose of a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    #[default]
    Llm,
    Embedding,
    Transcription,
    Vision,
    Classification,
    Other,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llm => write!(f, "llm"),
            Self::Embedding => write!(f, "embedding"),
            Self::Transcription => write!(f, "transcription"),
            Self::Vision => write!(f, "vision"),
            Self::Classification => write!(f, "classification"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Latency/throughput trade-off requested for a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Lowest latency per call, minimal optimization passes
    Realtime,
    #[default]
    Balanced,
    /// Maximum optimization and parallel execution
    Throughput,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Realtime => write!(f, "realtime"),
            Self::Balanced => write!(f, "balanced"),
            Self::Throughput => write!(f, "throughput"),
        }
    }
}

/// Input to a load operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Unique registry key
    pub id: String,
    pub model_type: ModelType,
    pub path: PathBuf,
    /// Size tag such as `"7b"`, `"large"`, `"tiny"`
    pub size: Option<String>,
    /// Quantization tag such as `"q4_k_m"`, `"q8_0"`, `"f16"`
    pub quantization: Option<String>,
    /// Explicit accelerator preference, tried first
    pub accelerator: Option<Accelerator>,
    pub device_id: Option<u32>,
    pub context_size: Option<u32>,
    /// Explicit GPU layer offload count for transformer models
    pub gpu_layers: Option<u32>,
    pub priority: Priority,
    pub custom_options: HashMap<String, Value>,
}

impl ModelRequest {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            model_type: ModelType::default(),
            path: path.into(),
            size: None,
            quantization: None,
            accelerator: None,
            device_id: None,
            context_size: None,
            gpu_layers: None,
            priority: Priority::default(),
            custom_options: HashMap::new(),
        }
    }

    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = model_type;
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_quantization(mut self, quantization: impl Into<String>) -> Self {
        self.quantization = Some(quantization.into());
        self
    }

    pub fn with_accelerator(mut self, accelerator: Accelerator) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    pub fn with_device(mut self, device_id: u32) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn with_context_size(mut self, tokens: u32) -> Self {
        self.context_size = Some(tokens);
        self
    }

    pub fn with_gpu_layers(mut self, layers: u32) -> Self {
        self.gpu_layers = Some(layers);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom_options.insert(key.into(), value.into());
        self
    }

    /// Read an unsigned integer custom option, accepting numbers or numeric strings.
    pub fn option_u64(&self, key: &str) -> Option<u64> {
        match self.custom_options.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a model.
///
/// `Unloaded → Loading → Ready → Unloading → Unloaded`, with `Failed`
/// terminal from `Loading`. An unload abandoned before the model leaves the
/// registry returns it to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Unloading,
    Failed,
}

impl ModelState {
    pub fn can_transition_to(self, next: ModelState) -> bool {
        use ModelState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Ready)
                | (Loading, Failed)
                | (Ready, Ready)
                | (Ready, Unloading)
                | (Unloading, Ready)
                | (Unloading, Unloaded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ModelState::Failed)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Unloaded => 0,
            Self::Loading => 1,
            Self::Ready => 2,
            Self::Unloading => 3,
            Self::Failed => 4,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Loading,
            2 => Self::Ready,
            3 => Self::Unloading,
            4 => Self::Failed,
            _ => Self::Unloaded,
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Unloading => "unloading",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Caller-visible result of a successful load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub id: String,
    /// Unique per load; a reload after unload gets a new token
    pub session_id: String,
    /// Resolved provider, e.g. `"graph:cuda"` or `"transformer:cpu"`
    pub provider: String,
    pub model_type: ModelType,
    pub format: ModelFormat,
    pub backend: BackendKind,
    pub accelerator: Accelerator,
    pub memory_bytes: u64,
    pub loaded_at: DateTime<Utc>,
    pub state: ModelState,
    pub metadata: HashMap<String, Value>,
}

// ============================================================================
// Listings
// ============================================================================

/// Availability of a model in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Loaded,
    Available,
}

/// Summary of a loaded or discoverable model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfiguration {
    pub id: String,
    pub provider: String,
    pub model_type: ModelType,
    pub status: ModelStatus,
    pub path: Option<PathBuf>,
    pub format: Option<ModelFormat>,
    pub memory_bytes: Option<u64>,
    pub priority: Option<Priority>,
    pub context_size: Option<u32>,
}

/// Runtime parameters that may change while a model stays resident.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub priority: Option<Priority>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// Merged into the entry's custom options; `null` removes a key
    pub custom_options: HashMap<String, Value>,
}

impl ModelParameters {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err("temperature must be between 0.0 and 2.0".into());
            }
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err("top_p must be in (0, 1]".into());
            }
        }
        if self.max_tokens == Some(0) {
            return Err("max_tokens must be > 0".into());
        }
        Ok(())
    }
}

/// Options an entry runs with, resolved at load and adjustable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    pub accelerator: Accelerator,
    pub device_id: Option<u32>,
    pub priority: Priority,
    pub context_size: u32,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub custom_options: HashMap<String, Value>,
}

impl RuntimeOptions {
    pub fn apply(&mut self, params: &ModelParameters) {
        if let Some(priority) = params.priority {
            self.priority = priority;
        }
        if let Some(max_tokens) = params.max_tokens {
            self.max_tokens = max_tokens;
        }
        if params.temperature.is_some() {
            self.temperature = params.temperature;
        }
        if params.top_p.is_some() {
            self.top_p = params.top_p;
        }
        for (key, value) in &params.custom_options {
            if value.is_null() {
                self.custom_options.remove(key);
            } else {
                self.custom_options.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }
}

// ============================================================================
// Inference
// ============================================================================

/// Input to an inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceInput {
    Text(String),
    /// Pre-tokenized ids
    Tokens(Vec<i64>),
    /// Dense features (audio frames, pixels, embeddings); shape inferred when absent
    Features {
        data: Vec<f32>,
        shape: Option<Vec<i64>>,
    },
    /// Fully prepared named tensors, passed through
    Tensors(Vec<Tensor>),
    Json(Value),
}

impl From<&str> for InferenceInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for InferenceInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Backend-specific output of an inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceOutput {
    Text(String),
    Tensors(Vec<Tensor>),
}

impl InferenceOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Tensors(_) => None,
        }
    }
}

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Completed,
    MaxTokens,
}

/// Result of a successful inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub model_id: String,
    pub backend: BackendKind,
    pub output: InferenceOutput,
    pub tokens_generated: u64,
    pub finish_reason: FinishReason,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    pub tokens_per_second: f64,
}

// ============================================================================
// Resource reports
// ============================================================================

/// Accelerator availability flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorFlags {
    pub cuda: bool,
    pub rocm: bool,
    pub coreml: bool,
    pub directml: bool,
    pub vulkan: bool,
}

/// Budget-level resource report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub device_name: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub utilization_percent: f64,
    pub accelerators: AcceleratorFlags,
    pub system_total_bytes: u64,
    pub system_available_bytes: u64,
}

/// Per-model resource report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResourceUsage {
    pub model_id: String,
    pub memory_bytes: u64,
    pub accelerator_memory_bytes: u64,
    #[serde(with = "duration_millis")]
    pub uptime: Duration,
}

/// Per-model entry in [`OrchestratorStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub id: String,
    pub model_type: ModelType,
    pub memory_bytes: u64,
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
}

/// Snapshot of the whole registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub loaded_count: usize,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub models: Vec<ModelStats>,
    pub timestamp: DateTime<Utc>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
