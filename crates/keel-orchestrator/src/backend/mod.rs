//! Backend sessions
//!
//! Every registry entry owns exactly one [`InferenceBackend`]. The concrete
//! kind (graph or transformer) is chosen by the [`factory`] from the detected
//! file format; nothing outside the factory inspects the concrete type.

pub mod engine;
pub mod factory;
pub mod graph;
pub mod transformer;
pub mod weights;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::hardware::Accelerator;
use crate::types::{FinishReason, InferenceInput, InferenceOutput, RuntimeOptions};

pub use engine::{EngineSet, GraphEngine, TransformerEngine, UnavailableEngine};
pub use factory::{BackendFactory, BuiltSession};
pub use graph::GraphExecutionBackend;
pub use transformer::TransformerBackend;
pub use weights::{WeightArena, WeightLease};

/// Backend family of a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Graph-execution session (ONNX)
    Graph,
    /// Quantized transformer context (GGUF/GGML)
    Transformer,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graph => write!(f, "graph"),
            Self::Transformer => write!(f, "transformer"),
        }
    }
}

/// What a backend produced for one call; timing is added by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutcome {
    pub output: InferenceOutput,
    pub tokens_generated: u64,
    pub finish_reason: FinishReason,
}

/// A constructed backend session owned by one registry entry.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Accelerator the session actually runs on.
    fn accelerator(&self) -> Accelerator;

    /// Provider name shown to callers, e.g. `graph:cuda`.
    fn provider(&self) -> String {
        format!("{}:{}", self.kind(), self.accelerator().as_str())
    }

    /// Bytes charged against the budget for this session.
    fn footprint_bytes(&self) -> u64;

    /// Estimated share of the footprint living in accelerator memory.
    fn accelerator_bytes(&self) -> u64;

    /// Metadata extracted from the native session.
    fn metadata(&self) -> HashMap<String, Value>;

    /// Whether several inferences may run on this session at once.
    fn concurrent_safe(&self) -> bool;

    /// Run one inference.
    async fn infer(
        &self,
        input: InferenceInput,
        options: &RuntimeOptions,
        ct: &CancellationToken,
    ) -> Result<InferenceOutcome, EngineError>;

    /// Release native resources. Called once, with no inference in flight.
    async fn unload(&self);
}
