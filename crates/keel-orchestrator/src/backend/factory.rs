//! Backend session factory
//!
//! The only place that branches on the detected format. ONNX files get a
//! [`GraphExecutionBackend`] on the first accelerator that constructs
//! successfully; GGUF/GGML files get a [`TransformerBackend`] whose weights
//! come from the shared arena.
//!
//! Native construction runs on the blocking pool. Cancellation is checked
//! between stages, and anything built before the check is dropped before
//! `Cancelled` is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, OrchestratorError, OrchestratorResult};
use crate::format::ModelFormat;
use crate::hardware::{Accelerator, HardwareInfo};
use crate::progress::{ProgressReporter, stage};
use crate::resources::SizeClass;
use crate::types::{ModelRequest, Priority};

use super::engine::{
    ContextParams, EngineSet, ExecutionMode, GraphSession, GraphSessionOptions,
    OptimizationLevel, TransformerContext, WeightParams,
};
use super::graph::GraphExecutionBackend;
use super::transformer::TransformerBackend;
use super::weights::{WeightArena, WeightLease};
use super::InferenceBackend;

/// Custom options consulted for a GPU-layer override, in order.
const GPU_LAYER_OPTIONS: [&str; 2] = ["gpu_layers", "n_gpu_layers"];

/// A constructed backend plus what the factory resolved for it.
pub struct BuiltSession {
    pub backend: Arc<dyn InferenceBackend>,
    pub accelerator: Accelerator,
    pub context_size: u32,
}

impl std::fmt::Debug for BuiltSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltSession")
            .field("kind", &self.backend.kind())
            .field("accelerator", &self.accelerator)
            .field("context_size", &self.context_size)
            .finish()
    }
}

/// Builds backend sessions for detected formats.
#[derive(Debug, Clone)]
pub struct BackendFactory {
    engines: EngineSet,
    hardware: Arc<HardwareInfo>,
    arena: WeightArena,
    default_context_size: u32,
}

impl BackendFactory {
    pub fn new(engines: EngineSet, hardware: Arc<HardwareInfo>, default_context_size: u32) -> Self {
        Self {
            engines,
            hardware,
            arena: WeightArena::new(),
            default_context_size,
        }
    }

    pub fn arena(&self) -> &WeightArena {
        &self.arena
    }

    pub fn hardware(&self) -> &HardwareInfo {
        &self.hardware
    }

    /// Build the session for `request`, charging `footprint` bytes.
    pub async fn build_session(
        &self,
        format: ModelFormat,
        request: &ModelRequest,
        footprint: u64,
        progress: &ProgressReporter,
        ct: &CancellationToken,
    ) -> OrchestratorResult<BuiltSession> {
        if ct.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        progress.report(stage::DETECTED, format!("detected {format} model"));

        match format {
            ModelFormat::Onnx => self.build_graph(request, footprint, progress, ct).await,
            ModelFormat::Gguf | ModelFormat::Ggml => {
                self.build_transformer(request, footprint, progress, ct).await
            }
            ModelFormat::Unknown => Err(OrchestratorError::UnsupportedFormat {
                model_id: request.id.clone(),
                path: request.path.clone(),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Graph sessions
    // ------------------------------------------------------------------------

    /// Session options for `accelerator` tuned to `priority`.
    pub fn graph_options(
        &self,
        accelerator: Accelerator,
        device_id: Option<u32>,
        priority: Priority,
    ) -> GraphSessionOptions {
        let cores = self.hardware.cpu_cores.max(1);
        let (optimization, execution_mode, intra_op_threads, inter_op_threads) = match priority {
            Priority::Realtime => (
                OptimizationLevel::Basic,
                ExecutionMode::Sequential,
                (cores / 2).max(1),
                1,
            ),
            Priority::Balanced => (OptimizationLevel::Extended, ExecutionMode::Sequential, cores, 1),
            Priority::Throughput => (OptimizationLevel::All, ExecutionMode::Parallel, cores, cores),
        };
        GraphSessionOptions {
            accelerator,
            device_id,
            optimization,
            execution_mode,
            intra_op_threads,
            inter_op_threads,
        }
    }

    async fn build_graph(
        &self,
        request: &ModelRequest,
        footprint: u64,
        progress: &ProgressReporter,
        ct: &CancellationToken,
    ) -> OrchestratorResult<BuiltSession> {
        let attempts: Vec<GraphSessionOptions> = self
            .hardware
            .graph_preference(request.accelerator)
            .into_iter()
            .map(|acc| self.graph_options(acc, request.device_id, request.priority))
            .collect();
        progress.report(
            stage::PREPARED,
            format!("trying {} execution provider(s)", attempts.len()),
        );

        let engine = Arc::clone(&self.engines.graph);
        let path = request.path.clone();
        let model_id = request.id.clone();
        let task_ct = ct.clone();
        let built = tokio::task::spawn_blocking(move || {
            construct_graph(engine.as_ref(), &model_id, &path, &attempts, &task_ct)
        })
        .await
        .map_err(|e| join_failure(&request.id, e))?;

        let (session, accelerator) =
            built.map_err(|e| OrchestratorError::load_failure(&request.id, e))?;
        if ct.is_cancelled() {
            drop(session);
            tracing::debug!(model_id = %request.id, "graph session dropped after cancellation");
            return Err(OrchestratorError::Cancelled);
        }
        progress.report(stage::CONSTRUCTED, format!("session built on {accelerator}"));

        if session.inputs().is_empty() || session.outputs().is_empty() {
            return Err(OrchestratorError::load_failure(
                &request.id,
                EngineError::Construction(format!(
                    "session declares {} input(s) and {} output(s)",
                    session.inputs().len(),
                    session.outputs().len()
                )),
            ));
        }
        progress.report(stage::VALIDATED, "session inputs and outputs validated");

        let backend =
            GraphExecutionBackend::new(session, request.model_type, accelerator, footprint);
        progress.report(stage::DONE, "graph session ready");

        Ok(BuiltSession {
            backend: Arc::new(backend),
            accelerator,
            context_size: request.context_size.unwrap_or(self.default_context_size),
        })
    }

    // ------------------------------------------------------------------------
    // Transformer sessions
    // ------------------------------------------------------------------------

    /// GPU layers for `request`: explicit value, then custom option, then the
    /// size heuristic when any accelerator is present, else zero.
    pub fn resolve_gpu_layers(&self, request: &ModelRequest) -> u32 {
        if let Some(layers) = request.gpu_layers {
            return layers;
        }
        for key in GPU_LAYER_OPTIONS {
            if let Some(layers) = request.option_u64(key) {
                return u32::try_from(layers).unwrap_or(u32::MAX);
            }
        }
        if !self.hardware.has_accelerator() {
            return 0;
        }
        request
            .size
            .as_deref()
            .and_then(SizeClass::parse)
            .unwrap_or(SizeClass::Medium)
            .gpu_layers()
    }

    fn transformer_accelerator(&self, request: &ModelRequest, gpu_layers: u32) -> Accelerator {
        if gpu_layers == 0 {
            return Accelerator::Cpu;
        }
        match request.accelerator {
            Some(acc) if acc.is_gpu() && self.hardware.supports(acc) => acc,
            _ => self.hardware.primary(),
        }
    }

    async fn build_transformer(
        &self,
        request: &ModelRequest,
        footprint: u64,
        progress: &ProgressReporter,
        ct: &CancellationToken,
    ) -> OrchestratorResult<BuiltSession> {
        let context_size = request.context_size.unwrap_or(self.default_context_size);
        let gpu_layers = self.resolve_gpu_layers(request);
        let accelerator = self.transformer_accelerator(request, gpu_layers);
        let weight_params = WeightParams {
            gpu_layers,
            device_id: request.device_id,
            use_mmap: true,
            use_mlock: false,
        };
        let context_params = ContextParams {
            context_size,
            threads: self.hardware.cpu_cores.max(1),
        };
        tracing::debug!(
            model_id = %request.id,
            gpu_layers,
            context_size,
            accelerator = %accelerator,
            "transformer parameters resolved"
        );
        progress.report(
            stage::PREPARED,
            format!("{gpu_layers} layer(s) on {accelerator}, context {context_size}"),
        );

        let job = TransformerJob {
            factory: self.clone(),
            path: request.path.clone(),
            weight_params,
            context_params,
            progress: progress.clone(),
            ct: ct.clone(),
        };
        let built = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| join_failure(&request.id, e))?;

        let (context, lease) = built.map_err(|e| OrchestratorError::load_failure(&request.id, e))?;
        if ct.is_cancelled() {
            // context before lease, mirroring unload
            drop(context);
            drop(lease);
            tracing::debug!(model_id = %request.id, "transformer context dropped after cancellation");
            return Err(OrchestratorError::Cancelled);
        }

        let backend = TransformerBackend::new(
            context,
            lease,
            accelerator,
            gpu_layers,
            context_size,
            footprint,
        );
        progress.report(stage::DONE, "transformer context ready");

        Ok(BuiltSession {
            backend: Arc::new(backend),
            accelerator,
            context_size,
        })
    }
}

fn construct_graph(
    engine: &dyn super::engine::GraphEngine,
    model_id: &str,
    path: &Path,
    attempts: &[GraphSessionOptions],
    ct: &CancellationToken,
) -> Result<(Box<dyn GraphSession>, Accelerator), EngineError> {
    let mut last_error = EngineError::Unavailable("no execution provider attempted".to_string());
    for options in attempts {
        if ct.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match engine.create_session(path, options) {
            Ok(session) => return Ok((session, options.accelerator)),
            Err(e) => {
                tracing::warn!(
                    model_id,
                    accelerator = %options.accelerator,
                    error = %e,
                    "execution provider failed, falling back"
                );
                last_error = e;
            }
        }
    }
    Err(last_error)
}

/// Blocking half of a transformer build.
struct TransformerJob {
    factory: BackendFactory,
    path: PathBuf,
    weight_params: WeightParams,
    context_params: ContextParams,
    progress: ProgressReporter,
    ct: CancellationToken,
}

impl TransformerJob {
    fn run(self) -> Result<(Box<dyn TransformerContext>, WeightLease), EngineError> {
        if self.ct.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let engine = Arc::clone(&self.factory.engines.transformer);
        let lease = self
            .factory
            .arena
            .acquire(&self.path, || engine.load_weights(&self.path, &self.weight_params))?;
        self.progress.report(stage::CONSTRUCTED, "weights mapped");

        // Dropping the lease on early return releases our reference
        if self.ct.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let context = engine.create_context(lease.block(), &self.context_params)?;
        self.progress.report(stage::VALIDATED, "context created");

        if self.ct.is_cancelled() {
            drop(context);
            return Err(EngineError::Cancelled);
        }
        Ok((context, lease))
    }
}

fn join_failure(model_id: &str, error: tokio::task::JoinError) -> OrchestratorError {
    OrchestratorError::load_failure(
        model_id,
        EngineError::Construction(format!("construction task failed: {error}")),
    )
}
