//! Inference dispatch and admission.
//!
//! An inference first takes a permit from the admission semaphore (sized to
//! the machine's compute units), then the target entry's execution gate:
//! shared when the session declares itself concurrent-safe, exclusive
//! otherwise. Independent models therefore run in parallel while calls into
//! a non-reentrant engine stay serialized.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLockReadGuard, RwLockWriteGuard, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, OrchestratorError, OrchestratorResult};
use crate::registry::{LoadedModelEntry, ModelRegistry};
use crate::types::{InferenceInput, InferenceResult};

/// Held for the duration of one inference.
enum GateGuard<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

impl GateGuard<'_> {
    fn is_exclusive(&self) -> bool {
        matches!(self, GateGuard::Exclusive(_))
    }
}

/// Routes inference calls to the entry's backend.
#[derive(Debug)]
pub struct InferenceDispatcher {
    registry: Arc<ModelRegistry>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl InferenceDispatcher {
    pub fn new(registry: Arc<ModelRegistry>, concurrency: usize) -> Self {
        let capacity = concurrency.max(1);
        Self {
            registry,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Maximum number of inferences admitted at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Stop admitting inferences; waiting calls fail.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Run `input` on model `id`. Never loads implicitly.
    ///
    /// The call runs on its own task, which keeps the admission permit and
    /// the gate until the engine returns. Dropping the returned future
    /// cancels the call; native work already started still finishes under
    /// the gate.
    pub async fn infer(
        &self,
        id: &str,
        input: InferenceInput,
        ct: &CancellationToken,
    ) -> OrchestratorResult<InferenceResult> {
        let entry = self
            .registry
            .get(id)
            .filter(|e| e.is_ready())
            .ok_or_else(|| OrchestratorError::ModelNotLoaded(id.to_string()))?;

        // A failed call still counts for recency
        self.registry.touch(&entry);
        if ct.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let ct = ct.child_token();
        let _cancel_on_drop = ct.clone().drop_guard();
        let task = tokio::spawn(run_inference(
            Arc::clone(&self.permits),
            entry,
            id.to_string(),
            input,
            ct,
        ));
        match task.await {
            Ok(result) => result,
            Err(e) => Err(OrchestratorError::inference_failure(
                id,
                EngineError::Execution(format!("inference task failed: {e}")),
            )),
        }
    }
}

async fn run_inference(
    permits: Arc<Semaphore>,
    entry: Arc<LoadedModelEntry>,
    id: String,
    input: InferenceInput,
    ct: CancellationToken,
) -> OrchestratorResult<InferenceResult> {
    let _permit = tokio::select! {
        permit = permits.acquire_owned() => permit.map_err(|_| {
            OrchestratorError::InvalidRequest("orchestrator is shutting down".to_string())
        })?,
        _ = ct.cancelled() => return Err(OrchestratorError::Cancelled),
    };

    let guard = tokio::select! {
        guard = acquire_gate(&entry) => guard,
        _ = ct.cancelled() => return Err(OrchestratorError::Cancelled),
    };

    // Unloaded while we queued behind the gate
    if !entry.is_ready() {
        return Err(OrchestratorError::ModelNotLoaded(id));
    }

    let options = entry.options();
    let backend = entry.backend();
    tracing::debug!(
        model_id = %id,
        backend = %backend.kind(),
        exclusive = guard.is_exclusive(),
        "dispatching inference"
    );

    let started = Instant::now();
    let outcome = backend
        .infer(input, &options, &ct)
        .await
        .map_err(|e| OrchestratorError::inference_failure(&id, e))?;
    let elapsed = started.elapsed();
    drop(guard);

    let secs = elapsed.as_secs_f64();
    let tokens_per_second = if outcome.tokens_generated > 0 && secs > 0.0 {
        outcome.tokens_generated as f64 / secs
    } else {
        0.0
    };
    tracing::debug!(
        model_id = %id,
        tokens = outcome.tokens_generated,
        elapsed_ms = elapsed.as_millis() as u64,
        tokens_per_second,
        "inference finished"
    );

    Ok(InferenceResult {
        model_id: id,
        backend: backend.kind(),
        output: outcome.output,
        tokens_generated: outcome.tokens_generated,
        finish_reason: outcome.finish_reason,
        elapsed,
        tokens_per_second,
    })
}

async fn acquire_gate(entry: &LoadedModelEntry) -> GateGuard<'_> {
    if entry.backend().concurrent_safe() {
        GateGuard::Shared(entry.gate().read().await)
    } else {
        GateGuard::Exclusive(entry.gate().write().await)
    }
}
