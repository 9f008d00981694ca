//! Graph-execution backend (ONNX family).
//!
//! Holds one constructed [`GraphSession`] and turns [`InferenceInput`] into
//! named tensors matching the session's declared inputs.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::hardware::Accelerator;
use crate::types::{FinishReason, InferenceInput, InferenceOutput, ModelType, RuntimeOptions};

use super::engine::{ElementType, GraphSession, Tensor, TensorData, TensorSpec};
use super::{BackendKind, InferenceBackend, InferenceOutcome};

/// Backend wrapping a graph session.
pub struct GraphExecutionBackend {
    session: Mutex<Option<Arc<dyn GraphSession>>>,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    model_type: ModelType,
    accelerator: Accelerator,
    footprint: u64,
    concurrent_safe: bool,
}

impl GraphExecutionBackend {
    pub fn new(
        session: Box<dyn GraphSession>,
        model_type: ModelType,
        accelerator: Accelerator,
        footprint: u64,
    ) -> Self {
        let session: Arc<dyn GraphSession> = Arc::from(session);
        Self {
            inputs: session.inputs().to_vec(),
            outputs: session.outputs().to_vec(),
            concurrent_safe: session.concurrent_safe(),
            session: Mutex::new(Some(session)),
            model_type,
            accelerator,
            footprint,
        }
    }

    pub fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }
}

#[async_trait]
impl InferenceBackend for GraphExecutionBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Graph
    }

    fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    fn footprint_bytes(&self) -> u64 {
        self.footprint
    }

    fn accelerator_bytes(&self) -> u64 {
        if self.accelerator.is_gpu() {
            self.footprint
        } else {
            0
        }
    }

    fn metadata(&self) -> HashMap<String, Value> {
        let describe = |specs: &[TensorSpec]| -> Value {
            specs
                .iter()
                .map(|s| json!({ "name": s.name, "element": s.element, "shape": s.shape }))
                .collect()
        };
        HashMap::from([
            ("inputs".to_string(), describe(&self.inputs)),
            ("outputs".to_string(), describe(&self.outputs)),
            ("model_type".to_string(), json!(self.model_type)),
        ])
    }

    fn concurrent_safe(&self) -> bool {
        self.concurrent_safe
    }

    async fn infer(
        &self,
        input: InferenceInput,
        _options: &RuntimeOptions,
        ct: &CancellationToken,
    ) -> Result<InferenceOutcome, EngineError> {
        let session = self
            .session
            .lock()
            .clone()
            .ok_or_else(|| EngineError::Execution("session already released".to_string()))?;

        let tensors = prepare_inputs(input, &self.inputs, self.model_type)?;
        if ct.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let outputs = tokio::task::spawn_blocking(move || session.run(tensors))
            .await
            .map_err(|e| EngineError::Execution(format!("graph run task failed: {e}")))??;

        if ct.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        Ok(InferenceOutcome {
            output: InferenceOutput::Tensors(outputs),
            tokens_generated: 0,
            finish_reason: FinishReason::Completed,
        })
    }

    async fn unload(&self) {
        // Dropping the last Arc releases the native session
        self.session.lock().take();
    }
}

// ============================================================================
// Input preparation
// ============================================================================

/// Shape `input` into tensors for `specs`.
pub fn prepare_inputs(
    input: InferenceInput,
    specs: &[TensorSpec],
    model_type: ModelType,
) -> Result<Vec<Tensor>, EngineError> {
    let primary = specs
        .first()
        .ok_or_else(|| EngineError::InvalidInput("session declares no inputs".to_string()))?;

    match input {
        InferenceInput::Tensors(tensors) => {
            for t in &tensors {
                if !specs.iter().any(|s| s.name == t.name) {
                    return Err(EngineError::InvalidInput(format!(
                        "unknown input tensor '{}'",
                        t.name
                    )));
                }
            }
            Ok(tensors)
        }
        InferenceInput::Features { data, shape } => {
            let shape = match shape {
                Some(shape) => shape,
                None => default_shape(model_type, &primary.shape, data.len())?,
            };
            let tensor = Tensor::new(&primary.name, shape, cast_f32(data, primary.element)?);
            if !tensor.is_consistent() {
                return Err(EngineError::InvalidInput(format!(
                    "shape {:?} does not match {} values",
                    tensor.shape,
                    tensor.data.len()
                )));
            }
            Ok(vec![tensor])
        }
        InferenceInput::Tokens(ids) => token_inputs(ids, specs),
        InferenceInput::Text(text) => {
            if primary.element == ElementType::Str {
                return Ok(vec![Tensor::new(
                    &primary.name,
                    vec![1],
                    TensorData::Str(vec![text]),
                )]);
            }
            let expected = match model_type {
                ModelType::Transcription => "audio features",
                ModelType::Vision => "pixel features",
                _ => "tokens or features",
            };
            Err(EngineError::InvalidInput(format!(
                "{model_type} graph input '{}' is {:?}; provide {expected} instead of text",
                primary.name, primary.element
            )))
        }
        InferenceInput::Json(value) => prepare_inputs(json_to_input(value)?, specs, model_type),
    }
}

/// Token ids plus the auxiliary inputs transformer encoders declare.
fn token_inputs(ids: Vec<i64>, specs: &[TensorSpec]) -> Result<Vec<Tensor>, EngineError> {
    if ids.is_empty() {
        return Err(EngineError::InvalidInput("empty token sequence".to_string()));
    }
    let len = ids.len();
    let shape = if specs[0].shape.len() == 1 {
        vec![len as i64]
    } else {
        vec![1, len as i64]
    };

    let mut tensors = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        let values = if i == 0 {
            ids.clone()
        } else if spec.name.contains("attention_mask") {
            vec![1; len]
        } else if spec.name.contains("position") {
            (0..len as i64).collect()
        } else if spec.name.contains("token_type_ids") {
            vec![0; len]
        } else {
            // inputs we cannot synthesize are left for the session to default
            continue;
        };
        tensors.push(Tensor::new(&spec.name, shape.clone(), cast_i64(values, spec.element)?));
    }
    Ok(tensors)
}

/// Mel bins of a log-mel spectrogram when the encoder leaves them dynamic.
const MEL_BINS: i64 = 80;

/// Layout for flat features, following the model family's input convention.
///
/// Vision graphs take `[.., C, H, W]` pixels and get a square image when both
/// spatial dimensions are dynamic. Transcription encoders with a rank-3 input
/// take `[batch, mel, frames]`. Everything else goes through [`resolve_shape`].
fn default_shape(
    model_type: ModelType,
    declared: &[i64],
    len: usize,
) -> Result<Vec<i64>, EngineError> {
    let rank = declared.len();
    match model_type {
        ModelType::Vision if rank >= 3 && declared[rank - 1] < 0 && declared[rank - 2] < 0 => {
            let mut shape = declared.to_vec();
            if shape[rank - 3] < 0 {
                shape[rank - 3] = 3;
            }
            for dim in &mut shape[..rank - 3] {
                if *dim < 0 {
                    *dim = 1;
                }
            }
            let per_pixel: i64 = shape[..rank - 2].iter().product();
            let plane = len as i64 / per_pixel.max(1);
            let side = (plane as f64).sqrt().round() as i64;
            if side == 0 || side * side * per_pixel != len as i64 {
                return Err(EngineError::InvalidInput(format!(
                    "{len} values are not a square image for shape {declared:?}"
                )));
            }
            shape[rank - 2] = side;
            shape[rank - 1] = side;
            Ok(shape)
        }
        ModelType::Transcription if rank == 3 && declared[1] < 0 => {
            let mut shape = declared.to_vec();
            shape[1] = MEL_BINS;
            resolve_shape(&shape, len)
        }
        _ => resolve_shape(declared, len),
    }
}

/// Fill dynamic dimensions so the shape holds `len` values. Leading dynamic
/// dimensions are batch (1); the last dynamic one absorbs the remainder.
fn resolve_shape(declared: &[i64], len: usize) -> Result<Vec<i64>, EngineError> {
    if declared.is_empty() {
        return Ok(vec![len as i64]);
    }
    let known: i64 = declared.iter().filter(|d| **d > 0).product();
    let dynamic: Vec<usize> = declared
        .iter()
        .enumerate()
        .filter(|(_, d)| **d < 0)
        .map(|(i, _)| i)
        .collect();

    let mut shape = declared.to_vec();
    match dynamic.last() {
        None => {}
        Some(&last) => {
            for &i in &dynamic[..dynamic.len() - 1] {
                shape[i] = 1;
            }
            if known == 0 || len as i64 % known != 0 {
                return Err(EngineError::InvalidInput(format!(
                    "{len} values cannot fill shape {declared:?}"
                )));
            }
            shape[last] = len as i64 / known;
        }
    }
    Ok(shape)
}

fn cast_f32(data: Vec<f32>, element: ElementType) -> Result<TensorData, EngineError> {
    Ok(match element {
        ElementType::F32 => TensorData::F32(data),
        ElementType::I64 => TensorData::I64(data.into_iter().map(|v| v as i64).collect()),
        ElementType::I32 => TensorData::I32(data.into_iter().map(|v| v as i32).collect()),
        ElementType::U8 => TensorData::U8(data.into_iter().map(|v| v.clamp(0.0, 255.0) as u8).collect()),
        ElementType::Str => {
            return Err(EngineError::InvalidInput(
                "numeric features for a string input".to_string(),
            ));
        }
    })
}

fn cast_i64(data: Vec<i64>, element: ElementType) -> Result<TensorData, EngineError> {
    Ok(match element {
        ElementType::I64 => TensorData::I64(data),
        ElementType::I32 => TensorData::I32(data.into_iter().map(|v| v as i32).collect()),
        ElementType::F32 => TensorData::F32(data.into_iter().map(|v| v as f32).collect()),
        ElementType::U8 | ElementType::Str => {
            return Err(EngineError::InvalidInput(format!(
                "token ids for a {element:?} input"
            )));
        }
    })
}

/// Accepts `{"tokens": [...]}`, `{"features": [...], "shape": [...]}`,
/// `{"text": ...}`/`{"prompt": ...}`, or a bare string or number array.
fn json_to_input(value: Value) -> Result<InferenceInput, EngineError> {
    let invalid = |what: &str| EngineError::InvalidInput(format!("json input: {what}"));
    match value {
        Value::String(s) => Ok(InferenceInput::Text(s)),
        Value::Array(items) => {
            let data = items
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| invalid("array must contain numbers"))?;
            Ok(InferenceInput::Features { data, shape: None })
        }
        Value::Object(map) => {
            if let Some(tokens) = map.get("tokens") {
                let ids = serde_json::from_value::<Vec<i64>>(tokens.clone())
                    .map_err(|_| invalid("tokens must be integers"))?;
                return Ok(InferenceInput::Tokens(ids));
            }
            if let Some(features) = map.get("features") {
                let data = serde_json::from_value::<Vec<f32>>(features.clone())
                    .map_err(|_| invalid("features must be numbers"))?;
                let shape = match map.get("shape") {
                    Some(shape) => Some(
                        serde_json::from_value::<Vec<i64>>(shape.clone())
                            .map_err(|_| invalid("shape must be integers"))?,
                    ),
                    None => None,
                };
                return Ok(InferenceInput::Features { data, shape });
            }
            for key in ["text", "prompt"] {
                if let Some(Value::String(s)) = map.get(key) {
                    return Ok(InferenceInput::Text(s.clone()));
                }
            }
            Err(invalid("expected tokens, features, text or prompt"))
        }
        _ => Err(invalid("unsupported value")),
    }
}
