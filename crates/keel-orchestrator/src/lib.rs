//! # keel-orchestrator
//!
//! Loads, serves and evicts neural-network models under a hard memory budget.
//!
//! A model's on-disk format picks its backend family:
//!
//! | Format        | Backend                                  |
//! |---------------|------------------------------------------|
//! | ONNX          | graph-execution session, first working accelerator |
//! | GGUF / GGML   | quantized transformer context over shared weights  |
//!
//! Native runtimes plug in through the [`backend::GraphEngine`] and
//! [`backend::TransformerEngine`] traits. Without them the orchestrator still
//! detects formats, accounts memory, lists and stores models; loads fail with
//! `ModelLoadFailure`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use keel_orchestrator::{EngineSet, ModelOrchestrator, ModelRequest, OrchestratorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = ModelOrchestrator::new(OrchestratorConfig::default(), EngineSet::default())?;
//!     let mut events = orchestrator.subscribe();
//!
//!     let request = ModelRequest::new("llama-7b", "/models/llama-7b.Q4_K_M.gguf")
//!         .with_size("7b")
//!         .with_quantization("q4_k_m");
//!     let handle = orchestrator.load_model(request).await?;
//!     println!("{} on {}", handle.id, handle.provider);
//!
//!     let result = orchestrator.infer("llama-7b", "Hello").await?;
//!     println!("{:?} ({:.1} tok/s)", result.output.as_text(), result.tokens_per_second);
//!
//!     while let Ok(event) = events.try_recv() {
//!         println!("{}", event.name());
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod eviction;
pub mod format;
pub mod hardware;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod resources;
pub mod storage;
pub mod types;

pub use backend::{BackendKind, EngineSet, InferenceBackend};
pub use catalog::{DirectoryCatalog, ModelCatalog, StaticCatalog};
pub use config::{CatalogTemplate, ConfigError, GIB, OrchestratorConfig};
pub use error::{EngineError, ErrorKind, OrchestratorError, OrchestratorResult};
pub use events::{EventBus, LifecycleEvent, Operation, ThresholdReport, UnloadReason};
pub use format::{FormatDetector, ModelFormat};
pub use hardware::{Accelerator, HardwareInfo};
pub use orchestrator::{ModelOrchestrator, ModelOrchestratorBuilder};
pub use progress::{Progress, ProgressReporter};
pub use resources::{ResourceAccountant, ResourceBudget};
pub use storage::{DownloadSource, FsModelStore, ModelStorage};
pub use types::{
    InferenceInput, InferenceOutput, InferenceResult, ModelConfiguration, ModelHandle,
    ModelParameters, ModelRequest, ModelState, ModelType, Priority,
};
