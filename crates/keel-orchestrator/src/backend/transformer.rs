//! Quantized-transformer backend (GGUF/GGML family).
//!
//! One generation context per entry, built on a weight block leased from the
//! shared [`WeightArena`](super::WeightArena). Generation runs on the
//! blocking pool and checks the cancellation token between tokens.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::hardware::Accelerator;
use crate::types::{FinishReason, InferenceInput, InferenceOutput, RuntimeOptions};

use super::engine::{GenerationParams, TransformerContext};
use super::weights::WeightLease;
use super::{BackendKind, InferenceBackend, InferenceOutcome};

/// Layer count assumed when the weights do not report one.
pub const DEFAULT_BLOCK_COUNT: u32 = 32;

type SharedContext = Arc<Mutex<Option<Box<dyn TransformerContext>>>>;

/// Backend wrapping a transformer context and its weight lease.
pub struct TransformerBackend {
    context: SharedContext,
    lease: Mutex<Option<WeightLease>>,
    weights_metadata: HashMap<String, Value>,
    block_count: u32,
    accelerator: Accelerator,
    gpu_layers: u32,
    context_size: u32,
    footprint: u64,
}

impl TransformerBackend {
    pub fn new(
        context: Box<dyn TransformerContext>,
        lease: WeightLease,
        accelerator: Accelerator,
        gpu_layers: u32,
        context_size: u32,
        footprint: u64,
    ) -> Self {
        let block = lease.block();
        Self {
            weights_metadata: block.metadata(),
            block_count: block.block_count().unwrap_or(DEFAULT_BLOCK_COUNT).max(1),
            context: Arc::new(Mutex::new(Some(context))),
            lease: Mutex::new(Some(lease)),
            accelerator,
            gpu_layers,
            context_size,
            footprint,
        }
    }

    pub fn gpu_layers(&self) -> u32 {
        self.gpu_layers
    }

    pub fn context_size(&self) -> u32 {
        self.context_size
    }
}

#[async_trait]
impl InferenceBackend for TransformerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Transformer
    }

    fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    fn footprint_bytes(&self) -> u64 {
        self.footprint
    }

    fn accelerator_bytes(&self) -> u64 {
        if !self.accelerator.is_gpu() || self.gpu_layers == 0 {
            return 0;
        }
        let offloaded = u64::from(self.gpu_layers.min(self.block_count));
        self.footprint / u64::from(self.block_count) * offloaded
    }

    fn metadata(&self) -> HashMap<String, Value> {
        let mut metadata = self.weights_metadata.clone();
        metadata.insert("gpu_layers".to_string(), json!(self.gpu_layers));
        metadata.insert("context_size".to_string(), json!(self.context_size));
        metadata.insert("block_count".to_string(), json!(self.block_count));
        if let Some(lease) = self.lease.lock().as_ref() {
            metadata.insert("weights".to_string(), json!(lease.path()));
        }
        metadata
    }

    fn concurrent_safe(&self) -> bool {
        false
    }

    async fn infer(
        &self,
        input: InferenceInput,
        options: &RuntimeOptions,
        ct: &CancellationToken,
    ) -> Result<InferenceOutcome, EngineError> {
        let prompt = coerce_prompt(input)?;
        let params = options.generation_params();
        let context = Arc::clone(&self.context);
        let ct = ct.clone();

        let (text, tokens, finish_reason) =
            tokio::task::spawn_blocking(move || generate(&context, &prompt, &params, &ct))
                .await
                .map_err(|e| EngineError::Execution(format!("generation task failed: {e}")))??;

        Ok(InferenceOutcome {
            output: InferenceOutput::Text(text),
            tokens_generated: tokens,
            finish_reason,
        })
    }

    async fn unload(&self) {
        // Context first: it may hold its own reference to the weights
        self.context.lock().take();
        self.lease.lock().take();
    }
}

fn generate(
    context: &SharedContext,
    prompt: &str,
    params: &GenerationParams,
    ct: &CancellationToken,
) -> Result<(String, u64, FinishReason), EngineError> {
    let mut guard = context.lock();
    let context = guard
        .as_mut()
        .ok_or_else(|| EngineError::Execution("context already released".to_string()))?;

    if ct.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    context.begin(prompt, params)?;

    let mut text = String::new();
    let mut tokens = 0u64;
    loop {
        if ct.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if tokens >= u64::from(params.max_tokens) {
            return Ok((text, tokens, FinishReason::MaxTokens));
        }
        match context.next_token()? {
            Some(piece) => {
                text.push_str(&piece);
                tokens += 1;
            }
            None => return Ok((text, tokens, FinishReason::Completed)),
        }
    }
}

/// Turn any input into a prompt string.
///
/// JSON objects may carry `prompt`, `text`, or chat-style `messages`
/// (`[{"role": ..., "content": ...}]`).
pub fn coerce_prompt(input: InferenceInput) -> Result<String, EngineError> {
    match input {
        InferenceInput::Text(text) => Ok(text),
        InferenceInput::Json(value) => Ok(json_prompt(value)),
        InferenceInput::Tokens(_) => Err(EngineError::InvalidInput(
            "transformer contexts take text prompts, not token ids".to_string(),
        )),
        InferenceInput::Features { .. } | InferenceInput::Tensors(_) => Err(
            EngineError::InvalidInput("transformer contexts take text prompts".to_string()),
        ),
    }
}

fn json_prompt(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Object(map) => {
            for key in ["prompt", "text"] {
                if let Some(Value::String(s)) = map.get(key) {
                    return s.clone();
                }
            }
            if let Some(Value::Array(messages)) = map.get("messages") {
                let mut prompt = String::new();
                for message in messages {
                    let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
                    let content = message.get("content").and_then(Value::as_str).unwrap_or("");
                    prompt.push_str(role);
                    prompt.push_str(": ");
                    prompt.push_str(content);
                    prompt.push('\n');
                }
                prompt.push_str("assistant: ");
                return prompt;
            }
            Value::Object(map).to_string()
        }
        other => other.to_string(),
    }
}
