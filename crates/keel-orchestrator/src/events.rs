//! Lifecycle event bus.
//!
//! Events are published on the emitting task after the triggering state
//! change has committed. Delivery uses a tokio broadcast channel: any number
//! of subscribers, and a slow subscriber lags instead of blocking the
//! publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::backend::BackendKind;
use crate::error::{ErrorKind, OrchestratorError};
use crate::format::ModelFormat;
use crate::hardware::Accelerator;

/// Why a model left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadReason {
    Requested,
    /// Evicted to make room for another load
    Evicted,
    /// Unloaded ahead of deleting its files
    Deleted,
    /// Evicted by an explicit memory optimization pass
    Optimized,
    Shutdown,
}

/// Operation during which an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Load,
    Unload,
    Infer,
    UpdateParameters,
    Download,
    Delete,
}

/// Payload of a resource-threshold warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdReport {
    pub current_bytes: u64,
    pub threshold_bytes: u64,
    pub max_bytes: u64,
    /// Current usage as a percentage of the budget ceiling
    pub current_percent: f64,
    /// Warning threshold as a percentage of the budget ceiling
    pub threshold_percent: f64,
    pub recommendation: String,
}

/// Lifecycle events published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ModelLoaded {
        model_id: String,
        session_id: String,
        format: ModelFormat,
        backend: BackendKind,
        accelerator: Accelerator,
        memory_bytes: u64,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },
    ModelUnloaded {
        model_id: String,
        memory_freed: u64,
        reason: UnloadReason,
        timestamp: DateTime<Utc>,
    },
    ModelError {
        model_id: Option<String>,
        operation: Operation,
        kind: ErrorKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ResourceThresholdExceeded {
        report: ThresholdReport,
        timestamp: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn model_id(&self) -> Option<&str> {
        match self {
            Self::ModelLoaded { model_id, .. } | Self::ModelUnloaded { model_id, .. } => {
                Some(model_id)
            }
            Self::ModelError { model_id, .. } => model_id.as_deref(),
            Self::ResourceThresholdExceeded { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ModelLoaded { .. } => "model_loaded",
            Self::ModelUnloaded { .. } => "model_unloaded",
            Self::ModelError { .. } => "model_error",
            Self::ResourceThresholdExceeded { .. } => "resource_threshold_exceeded",
        }
    }
}

/// Multi-subscriber publisher of [`LifecycleEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: LifecycleEvent) {
        tracing::trace!(event = event.name(), model_id = ?event.model_id(), "publishing event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub(crate) fn model_loaded(
        &self,
        handle: &crate::types::ModelHandle,
        elapsed: std::time::Duration,
    ) {
        self.publish(LifecycleEvent::ModelLoaded {
            model_id: handle.id.clone(),
            session_id: handle.session_id.clone(),
            format: handle.format,
            backend: handle.backend,
            accelerator: handle.accelerator,
            memory_bytes: handle.memory_bytes,
            elapsed_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn model_unloaded(&self, model_id: &str, memory_freed: u64, reason: UnloadReason) {
        self.publish(LifecycleEvent::ModelUnloaded {
            model_id: model_id.to_string(),
            memory_freed,
            reason,
            timestamp: Utc::now(),
        });
    }

    /// Publish a `ModelError` unless the error is a caller error or a cancellation.
    pub(crate) fn model_error(
        &self,
        model_id: Option<&str>,
        operation: Operation,
        error: &OrchestratorError,
    ) {
        if !error.is_reportable() {
            return;
        }
        self.publish(LifecycleEvent::ModelError {
            model_id: model_id.map(str::to_string),
            operation,
            kind: error.kind(),
            message: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn threshold_exceeded(&self, report: ThresholdReport) {
        self.publish(LifecycleEvent::ResourceThresholdExceeded {
            report,
            timestamp: Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
