//! Native engine traits
//!
//! This module defines the narrow seam between the orchestrator and the two
//! native engine families:
//! - `GraphEngine` / `GraphSession`: an ONNX-style graph runtime that runs a
//!   session on an execution provider
//! - `TransformerEngine` / `WeightBlock` / `TransformerContext`: a
//!   llama.cpp-style runtime that maps quantized weights once and builds
//!   generation contexts on top of them
//!
//! All methods are synchronous and may block; the orchestrator calls them
//! from the blocking pool. Dropping a session, context or weight block
//! releases its native resources.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::EngineError;
use crate::hardware::Accelerator;

// ============================================================================
// Tensors
// ============================================================================

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    I64,
    I32,
    U8,
    /// String tensors, used by graphs with built-in tokenizers
    Str,
}

/// Declared input or output of a graph session. `-1` marks a dynamic dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub element: ElementType,
    pub shape: Vec<i64>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, element: ElementType, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            element,
            shape,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.shape.iter().any(|d| *d < 0)
    }
}

/// Flat tensor storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
    I32(Vec<i32>),
    U8(Vec<u8>),
    Str(Vec<String>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::U8(v) => v.len(),
            Self::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element(&self) -> ElementType {
        match self {
            Self::F32(_) => ElementType::F32,
            Self::I64(_) => ElementType::I64,
            Self::I32(_) => ElementType::I32,
            Self::U8(_) => ElementType::U8,
            Self::Str(_) => ElementType::Str,
        }
    }
}

/// A named, shaped tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub data: TensorData,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Vec<i64>, data: TensorData) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }

    /// Shape and data length agree.
    pub fn is_consistent(&self) -> bool {
        let expected: i64 = self.shape.iter().product();
        self.shape.iter().all(|d| *d >= 0) && expected as usize == self.data.len()
    }
}

// ============================================================================
// Graph engine
// ============================================================================

/// Graph optimization passes applied at session construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    Basic,
    Extended,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

/// Options passed to [`GraphEngine::create_session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSessionOptions {
    pub accelerator: Accelerator,
    pub device_id: Option<u32>,
    pub optimization: OptimizationLevel,
    pub execution_mode: ExecutionMode,
    pub intra_op_threads: usize,
    pub inter_op_threads: usize,
}

/// Graph runtime able to build sessions on an execution provider.
pub trait GraphEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Build a session for the model at `path`.
    ///
    /// # Errors
    /// - `Unavailable`: the requested accelerator or the engine itself is missing
    /// - `Construction` / `Io`: the model could not be read or compiled
    fn create_session(
        &self,
        path: &Path,
        options: &GraphSessionOptions,
    ) -> Result<Box<dyn GraphSession>, EngineError>;
}

/// A constructed graph session.
pub trait GraphSession: Send + Sync {
    fn inputs(&self) -> &[TensorSpec];

    fn outputs(&self) -> &[TensorSpec];

    fn run(&self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, EngineError>;

    /// Whether `run` may be entered from several threads at once.
    fn concurrent_safe(&self) -> bool {
        false
    }
}

// ============================================================================
// Transformer engine
// ============================================================================

/// Parameters for mapping a weight file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightParams {
    pub gpu_layers: u32,
    pub device_id: Option<u32>,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

/// Loaded transformer weights, shareable between contexts.
pub trait WeightBlock: Send + Sync {
    /// Bytes occupied by the mapped weights, when the engine knows it.
    fn size_bytes(&self) -> Option<u64> {
        None
    }

    /// Number of transformer blocks (layers), when known.
    fn block_count(&self) -> Option<u32> {
        None
    }

    /// Header metadata such as architecture or vocabulary size.
    fn metadata(&self) -> HashMap<String, Value> {
        HashMap::new()
    }
}

/// Parameters for building a generation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextParams {
    pub context_size: u32,
    pub threads: usize,
}

/// Sampling parameters for one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

/// Quantized-transformer runtime.
pub trait TransformerEngine: Send + Sync {
    fn name(&self) -> &str;

    fn load_weights(
        &self,
        path: &Path,
        params: &WeightParams,
    ) -> Result<Arc<dyn WeightBlock>, EngineError>;

    fn create_context(
        &self,
        weights: Arc<dyn WeightBlock>,
        params: &ContextParams,
    ) -> Result<Box<dyn TransformerContext>, EngineError>;
}

/// Stateful generation context. Never entered concurrently.
pub trait TransformerContext: Send {
    /// Reset state, tokenize and evaluate `prompt`.
    fn begin(&mut self, prompt: &str, params: &GenerationParams) -> Result<(), EngineError>;

    /// Sample the next piece of text; `None` at end of generation.
    fn next_token(&mut self) -> Result<Option<String>, EngineError>;
}

// ============================================================================
// Engine set
// ============================================================================

/// Engine used when no native runtime is linked.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableEngine;

impl GraphEngine for UnavailableEngine {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn create_session(
        &self,
        _path: &Path,
        _options: &GraphSessionOptions,
    ) -> Result<Box<dyn GraphSession>, EngineError> {
        Err(EngineError::Unavailable(
            "no graph runtime linked into this process".to_string(),
        ))
    }
}

impl TransformerEngine for UnavailableEngine {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn load_weights(
        &self,
        _path: &Path,
        _params: &WeightParams,
    ) -> Result<Arc<dyn WeightBlock>, EngineError> {
        Err(EngineError::Unavailable(
            "no transformer runtime linked into this process".to_string(),
        ))
    }

    fn create_context(
        &self,
        _weights: Arc<dyn WeightBlock>,
        _params: &ContextParams,
    ) -> Result<Box<dyn TransformerContext>, EngineError> {
        Err(EngineError::Unavailable(
            "no transformer runtime linked into this process".to_string(),
        ))
    }
}

/// The pair of engines the session factory dispatches to.
#[derive(Clone)]
pub struct EngineSet {
    pub graph: Arc<dyn GraphEngine>,
    pub transformer: Arc<dyn TransformerEngine>,
}

impl EngineSet {
    pub fn new(graph: Arc<dyn GraphEngine>, transformer: Arc<dyn TransformerEngine>) -> Self {
        Self { graph, transformer }
    }

    pub fn unavailable() -> Self {
        Self {
            graph: Arc::new(UnavailableEngine),
            transformer: Arc::new(UnavailableEngine),
        }
    }

    pub fn with_graph(mut self, graph: Arc<dyn GraphEngine>) -> Self {
        self.graph = graph;
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn TransformerEngine>) -> Self {
        self.transformer = transformer;
        self
    }
}

impl Default for EngineSet {
    fn default() -> Self {
        Self::unavailable()
    }
}

impl std::fmt::Debug for EngineSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSet")
            .field("graph", &self.graph.name())
            .field("transformer", &self.transformer.name())
            .finish()
    }
}
