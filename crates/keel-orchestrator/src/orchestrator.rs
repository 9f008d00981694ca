//! The model orchestrator facade.
//!
//! [`ModelOrchestrator`] ties the components together:
//!
//! - loads go detector → accountant (evict, reserve) → factory → registry
//! - inferences go registry → dispatcher → backend
//! - every state change is published on the event bus
//!
//! The admission mutex covers only the accounting decision and the registry
//! commit. Native construction runs outside it, charged through a
//! [`Reservation`](crate::resources::Reservation). Loads and unloads of the
//! same id are serialized by a per-id lock.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendFactory, EngineSet, WeightArena};
use crate::catalog::{DirectoryCatalog, ModelCatalog, StaticCatalog};
use crate::config::OrchestratorConfig;
use crate::dispatch::InferenceDispatcher;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, LifecycleEvent, Operation, UnloadReason};
use crate::eviction::EvictionController;
use crate::format::{FormatDetector, ModelFormat};
use crate::hardware::{self, HardwareInfo};
use crate::progress::{ProgressReporter, stage};
use crate::registry::{LoadedModelEntry, ModelRegistry};
use crate::resources::{ResourceAccountant, ResourceBudget};
use crate::storage::{DownloadSource, FsModelStore, ModelStorage};
use crate::types::{
    InferenceInput, InferenceResult, ModelConfiguration, ModelHandle, ModelParameters,
    ModelRequest, ModelResourceUsage, ModelState, OrchestratorStats, ResourceUsage,
    RuntimeOptions,
};

/// Builder for [`ModelOrchestrator`].
pub struct ModelOrchestratorBuilder {
    config: OrchestratorConfig,
    engines: EngineSet,
    hardware: Option<HardwareInfo>,
    storage: Option<Arc<dyn ModelStorage>>,
    catalogs: Vec<Arc<dyn ModelCatalog>>,
}

impl ModelOrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            engines: EngineSet::default(),
            hardware: None,
            storage: None,
            catalogs: Vec::new(),
        }
    }

    pub fn engines(mut self, engines: EngineSet) -> Self {
        self.engines = engines;
        self
    }

    /// Use `hardware` instead of probing the machine.
    pub fn hardware(mut self, hardware: HardwareInfo) -> Self {
        self.hardware = Some(hardware);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn ModelStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn ModelCatalog>) -> Self {
        self.catalogs.push(catalog);
        self
    }

    /// Validate the configuration and assemble the orchestrator.
    ///
    /// Without an explicit storage or catalog, `models_dir` provides a
    /// filesystem store and a directory catalog, and configured templates
    /// become a static catalog.
    pub fn build(self) -> OrchestratorResult<ModelOrchestrator> {
        let config = self.config;
        config.validate()?;

        let hardware = Arc::new(self.hardware.unwrap_or_else(HardwareInfo::detect));
        let events = EventBus::new(config.event_capacity);
        let registry = Arc::new(ModelRegistry::with_events(events));

        let storage = match self.storage {
            Some(storage) => Some(storage),
            None => FsModelStore::from_config(&config)?
                .map(|store| Arc::new(store) as Arc<dyn ModelStorage>),
        };

        let mut catalogs = self.catalogs;
        if catalogs.is_empty() {
            if let Some(dir) = &config.models_dir {
                catalogs.push(Arc::new(DirectoryCatalog::new(dir.clone())));
            }
            if !config.catalog.is_empty() {
                catalogs.push(Arc::new(StaticCatalog::new(config.catalog.clone())));
            }
        }

        let concurrency = config
            .inference_concurrency
            .unwrap_or_else(|| hardware.compute_units());

        info!(
            device = %hardware.device_name(),
            max_memory_bytes = config.max_memory_bytes,
            inference_concurrency = concurrency,
            graph_engine = self.engines.graph.name(),
            transformer_engine = self.engines.transformer.name(),
            "model orchestrator initialized"
        );

        Ok(ModelOrchestrator {
            accountant: ResourceAccountant::new(
                ResourceBudget::from_config(&config),
                Arc::clone(&registry),
            ),
            eviction: EvictionController::new(Arc::clone(&registry)),
            factory: BackendFactory::new(
                self.engines,
                Arc::clone(&hardware),
                config.default_context_size,
            ),
            dispatcher: InferenceDispatcher::new(Arc::clone(&registry), concurrency),
            detector: FormatDetector::new(),
            admission: Mutex::new(()),
            load_locks: DashMap::new(),
            failed_loads: DashMap::new(),
            registry,
            hardware,
            storage,
            catalogs,
            config,
        })
    }
}

/// Loads, serves and evicts models under a memory budget.
pub struct ModelOrchestrator {
    config: OrchestratorConfig,
    hardware: Arc<HardwareInfo>,
    registry: Arc<ModelRegistry>,
    accountant: ResourceAccountant,
    eviction: EvictionController,
    factory: BackendFactory,
    dispatcher: InferenceDispatcher,
    detector: FormatDetector,
    /// Held for the accounting decision and the registry commit only
    admission: Mutex<()>,
    load_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Ids whose most recent load attempt failed during construction
    failed_loads: DashMap<String, ()>,
    storage: Option<Arc<dyn ModelStorage>>,
    catalogs: Vec<Arc<dyn ModelCatalog>>,
}

impl std::fmt::Debug for ModelOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelOrchestrator")
            .field("loaded", &self.registry.len())
            .field("memory_bytes", &self.registry.total_memory_usage())
            .field("device", &self.hardware.device_name())
            .field("catalogs", &self.catalogs.len())
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

impl ModelOrchestrator {
    /// Orchestrator over `engines` with probed hardware.
    pub fn new(config: OrchestratorConfig, engines: EngineSet) -> OrchestratorResult<Self> {
        Self::builder(config).engines(engines).build()
    }

    pub fn builder(config: OrchestratorConfig) -> ModelOrchestratorBuilder {
        ModelOrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn hardware(&self) -> &HardwareInfo {
        &self.hardware
    }

    pub fn events(&self) -> &EventBus {
        self.registry.events()
    }

    /// Shared transformer weights currently mapped.
    pub fn weight_arena(&self) -> &WeightArena {
        self.factory.arena()
    }

    /// Maximum inferences admitted at once.
    pub fn inference_capacity(&self) -> usize {
        self.dispatcher.capacity()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events().subscribe()
    }

    fn load_lock(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.load_locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn release_load_lock(&self, id: &str) {
        self.load_locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    // ------------------------------------------------------------------------
    // Load / unload
    // ------------------------------------------------------------------------

    /// Load `request`, or return the resident handle for its id.
    pub async fn load_model(&self, request: ModelRequest) -> OrchestratorResult<ModelHandle> {
        self.load_model_with(request, &ProgressReporter::disabled(), &CancellationToken::new())
            .await
    }

    /// Load with progress reporting and cancellation.
    pub async fn load_model_with(
        &self,
        request: ModelRequest,
        progress: &ProgressReporter,
        ct: &CancellationToken,
    ) -> OrchestratorResult<ModelHandle> {
        let id = request.id.clone();
        let result = {
            let lock = self.load_lock(&id);
            let result = self.load_serialized(&lock, request, progress, ct).await;
            drop(lock);
            self.release_load_lock(&id);
            result
        };

        if let Err(e) = &result {
            if e.is_reportable() {
                warn!(model_id = %id, error = %e, "model load failed");
            } else {
                debug!(model_id = %id, error = %e, "model load not completed");
            }
            self.events().model_error(Some(&id), Operation::Load, e);
        }
        result
    }

    async fn load_serialized(
        &self,
        lock: &Mutex<()>,
        request: ModelRequest,
        progress: &ProgressReporter,
        ct: &CancellationToken,
    ) -> OrchestratorResult<ModelHandle> {
        if request.id.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "model id must not be empty".to_string(),
            ));
        }

        let _serial = tokio::select! {
            guard = lock.lock() => guard,
            _ = ct.cancelled() => return Err(OrchestratorError::Cancelled),
        };

        if let Some(entry) = self.registry.get(&request.id).filter(|e| e.is_ready()) {
            self.registry.refresh(&entry);
            debug!(model_id = %request.id, "model already loaded");
            progress.report(stage::DONE, "already loaded");
            return Ok(entry.handle());
        }
        if ct.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let format = self.detector.detect(&request.path);
        if format == ModelFormat::Unknown {
            return Err(OrchestratorError::UnsupportedFormat {
                model_id: request.id.clone(),
                path: request.path.clone(),
            });
        }

        let started = Instant::now();
        let footprint = self.accountant.estimate_footprint(&request);
        info!(
            model_id = %request.id,
            format = %format,
            path = %request.path.display(),
            footprint,
            "loading model"
        );

        // Accounting decision
        let reservation = {
            let _admission = tokio::select! {
                guard = self.admission.lock() => guard,
                _ = ct.cancelled() => return Err(OrchestratorError::Cancelled),
            };
            self.make_room(&request.id, footprint, ct).await?;
            self.failed_loads.remove(&request.id);
            self.accountant.reserve(&request.id, footprint)
        };

        // Native construction, outside the admission lock
        let built = match self
            .factory
            .build_session(format, &request, footprint, progress, ct)
            .await
        {
            Ok(built) => built,
            Err(e) => {
                if e.is_reportable() {
                    self.failed_loads.insert(request.id.clone(), ());
                }
                return Err(e);
            }
        };
        let backend = built.backend;

        let handle = ModelHandle {
            id: request.id.clone(),
            session_id: Uuid::new_v4().to_string(),
            provider: backend.provider(),
            model_type: request.model_type,
            format,
            backend: backend.kind(),
            accelerator: built.accelerator,
            memory_bytes: backend.footprint_bytes(),
            loaded_at: Utc::now(),
            state: ModelState::Ready,
            metadata: backend.metadata(),
        };
        let options = RuntimeOptions {
            accelerator: built.accelerator,
            device_id: request.device_id,
            priority: request.priority,
            context_size: built.context_size,
            max_tokens: self.config.default_max_tokens,
            temperature: None,
            top_p: None,
            custom_options: request.custom_options.clone(),
        };
        let entry = LoadedModelEntry::new(handle, request, Arc::clone(&backend), options);

        // Commit
        let committed = {
            let _admission = self.admission.lock().await;
            if ct.is_cancelled() {
                Err(OrchestratorError::Cancelled)
            } else {
                match self.registry.insert(entry) {
                    Ok(entry) => {
                        reservation.commit();
                        Ok(entry)
                    }
                    Err(rejected) => Err(OrchestratorError::InvalidRequest(format!(
                        "model '{}' was registered concurrently",
                        rejected.id()
                    ))),
                }
            }
        };
        let entry = match committed {
            Ok(entry) => entry,
            Err(e) => {
                backend.unload().await;
                return Err(e);
            }
        };

        let handle = entry.handle();
        let elapsed = started.elapsed();
        info!(
            model_id = %handle.id,
            format = %handle.format,
            backend = %handle.backend,
            accelerator = %handle.accelerator,
            memory_bytes = handle.memory_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "model loaded"
        );
        self.events().model_loaded(&handle, elapsed);

        let total = self.registry.total_memory_usage();
        if let Some(report) = self.accountant.check_threshold(total) {
            warn!(
                current_bytes = report.current_bytes,
                threshold_bytes = report.threshold_bytes,
                "memory warning threshold exceeded"
            );
            self.events().threshold_exceeded(report);
        }
        Ok(handle)
    }

    /// Evict until `footprint` fits. Caller holds the admission lock.
    async fn make_room(
        &self,
        model_id: &str,
        footprint: u64,
        ct: &CancellationToken,
    ) -> OrchestratorResult<()> {
        if self.accountant.has_room_for(footprint) {
            return Ok(());
        }

        let budget = self.accountant.budget();
        let reserved = self.accountant.reserved_bytes();
        // Evicting every resident model would still not be enough
        let reachable = budget.usable_bytes().saturating_sub(reserved);
        if footprint <= reachable {
            let shortfall = self
                .accountant
                .current_usage()
                .saturating_add(footprint)
                .saturating_add(budget.min_memory_buffer)
                .saturating_sub(budget.max_memory_bytes);
            debug!(model_id, footprint, shortfall, "evicting to make room");
            self.eviction.free_at_least(shortfall, ct).await;
            // Victims evicted before the cancellation stay unloaded
            if ct.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
        }

        if self.accountant.has_room_for(footprint) {
            Ok(())
        } else {
            Err(OrchestratorError::InsufficientMemory {
                model_id: model_id.to_string(),
                required: footprint,
                available: self.accountant.available(),
            })
        }
    }

    /// Unload `id`. Returns `false` when it was not loaded.
    pub async fn unload_model(&self, id: &str) -> bool {
        self.unload_with_reason(id, UnloadReason::Requested).await
    }

    async fn unload_with_reason(&self, id: &str, reason: UnloadReason) -> bool {
        let unloaded = {
            let lock = self.load_lock(id);
            let _serial = lock.lock().await;
            self.registry.unload(id, reason).await.is_some()
        };
        self.release_load_lock(id);
        unloaded
    }

    pub fn is_model_loaded(&self, id: &str) -> bool {
        self.registry.is_loaded(id)
    }

    /// Lifecycle state of `id`.
    ///
    /// `Loading` while a load holds its reservation, `Failed` when the last
    /// load attempt broke during construction, `Unloaded` for ids that are
    /// neither resident nor in flight.
    pub fn model_state(&self, id: &str) -> ModelState {
        if let Some(entry) = self.registry.get(id) {
            return entry.state();
        }
        if self.accountant.is_reserved(id) {
            ModelState::Loading
        } else if self.failed_loads.contains_key(id) {
            ModelState::Failed
        } else {
            ModelState::Unloaded
        }
    }

    /// Handle of a resident model.
    pub fn get_handle(&self, id: &str) -> Option<ModelHandle> {
        self.registry.get(id).map(|e| e.handle())
    }

    pub fn list_loaded_models(&self) -> Vec<ModelConfiguration> {
        self.registry
            .list_loaded()
            .iter()
            .map(|e| e.configuration())
            .collect()
    }

    /// Loaded models plus everything the catalogs know about, one entry per id.
    pub async fn list_available_models(&self) -> Vec<ModelConfiguration> {
        let mut models = self.list_loaded_models();
        for catalog in &self.catalogs {
            match catalog.list().await {
                Ok(found) => {
                    for config in found {
                        if !models.iter().any(|m| m.id == config.id) {
                            models.push(config);
                        }
                    }
                }
                Err(e) => warn!(catalog = catalog.name(), error = %e, "catalog listing failed"),
            }
        }
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Configuration of a loaded model, else its catalog entry.
    pub async fn get_model_info(&self, id: &str) -> Option<ModelConfiguration> {
        if let Some(entry) = self.registry.get(id) {
            return Some(entry.configuration());
        }
        for catalog in &self.catalogs {
            if let Ok(found) = catalog.list().await {
                if let Some(config) = found.into_iter().find(|c| c.id == id) {
                    return Some(config);
                }
            }
        }
        None
    }

    /// Update runtime parameters of a resident model.
    pub fn update_model_parameters(
        &self,
        id: &str,
        params: &ModelParameters,
    ) -> OrchestratorResult<bool> {
        let entry = self
            .registry
            .get(id)
            .filter(|e| e.is_ready())
            .ok_or_else(|| OrchestratorError::ModelNotLoaded(id.to_string()))?;
        params.validate().map_err(OrchestratorError::InvalidRequest)?;
        entry.update_options(params);
        debug!(model_id = id, "model parameters updated");
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Inference
    // ------------------------------------------------------------------------

    pub async fn infer(
        &self,
        id: &str,
        input: impl Into<InferenceInput>,
    ) -> OrchestratorResult<InferenceResult> {
        self.infer_with(id, input.into(), &CancellationToken::new())
            .await
    }

    /// Run an inference on a resident model. Never loads implicitly.
    pub async fn infer_with(
        &self,
        id: &str,
        input: InferenceInput,
        ct: &CancellationToken,
    ) -> OrchestratorResult<InferenceResult> {
        let result = self.dispatcher.infer(id, input, ct).await;
        if let Err(e) = &result {
            if e.is_reportable() {
                warn!(model_id = id, error = %e, "inference failed");
            }
            self.events().model_error(Some(id), Operation::Infer, e);
        }
        result
    }

    // ------------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------------

    pub fn get_total_memory_usage(&self) -> u64 {
        self.registry.total_memory_usage()
    }

    pub fn get_resource_usage(&self) -> ResourceUsage {
        let budget = self.accountant.budget();
        let used = self.accountant.current_usage();
        let utilization_percent = if budget.max_memory_bytes == 0 {
            0.0
        } else {
            used as f64 / budget.max_memory_bytes as f64 * 100.0
        };
        let (system_total_bytes, system_available_bytes) = hardware::system_memory();
        ResourceUsage {
            device_name: self.hardware.device_name(),
            total_bytes: budget.max_memory_bytes,
            used_bytes: used,
            available_bytes: budget.max_memory_bytes.saturating_sub(used),
            utilization_percent,
            accelerators: self.hardware.flags(),
            system_total_bytes,
            system_available_bytes,
        }
    }

    pub fn get_model_resource_usage(&self, id: &str) -> OrchestratorResult<ModelResourceUsage> {
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| OrchestratorError::ModelNotLoaded(id.to_string()))?;
        Ok(ModelResourceUsage {
            model_id: id.to_string(),
            memory_bytes: entry.memory_usage(),
            accelerator_memory_bytes: entry.backend().accelerator_bytes(),
            uptime: entry.uptime(),
        })
    }

    /// Evict the coldest fraction of resident models. Returns whether
    /// anything was evicted.
    pub async fn optimize_memory(&self) -> bool {
        let _admission = self.admission.lock().await;
        let before = self.registry.total_memory_usage();
        let evicted = self
            .eviction
            .evict_coldest(self.config.optimize_fraction)
            .await;
        info!(
            evicted = ?evicted,
            freed = before.saturating_sub(self.registry.total_memory_usage()),
            "memory optimization finished"
        );
        !evicted.is_empty()
    }

    pub fn get_stats(&self) -> OrchestratorStats {
        let entries = self.registry.list_loaded();
        let total = self.registry.total_memory_usage();
        OrchestratorStats {
            loaded_count: entries.len(),
            total_memory_bytes: total,
            available_memory_bytes: self.accountant.budget().max_memory_bytes.saturating_sub(total),
            models: entries.iter().map(|e| e.stats()).collect(),
            timestamp: Utc::now(),
        }
    }

    // ------------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------------

    fn storage(&self) -> OrchestratorResult<&Arc<dyn ModelStorage>> {
        self.storage
            .as_ref()
            .ok_or_else(|| OrchestratorError::Storage("no model storage configured".to_string()))
    }

    /// Fetch a model into storage.
    pub async fn download_model(
        &self,
        id: &str,
        source: impl Into<DownloadSource>,
        progress: &ProgressReporter,
    ) -> OrchestratorResult<bool> {
        let source = source.into();
        let result = match self.storage() {
            Ok(storage) => storage.download(id, &source, progress).await.map(|_| true),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.events().model_error(Some(id), Operation::Download, e);
        }
        result
    }

    /// Unload `id` if resident, then remove its files.
    pub async fn delete_model(&self, id: &str) -> OrchestratorResult<bool> {
        self.unload_with_reason(id, UnloadReason::Deleted).await;
        let result = match self.storage() {
            Ok(storage) => storage.delete(id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.events().model_error(Some(id), Operation::Delete, e);
        }
        result
    }

    pub async fn get_model_size(&self, id: &str) -> OrchestratorResult<u64> {
        self.storage()?.size_of(id).await
    }

    /// Stop admitting inferences and unload every resident model.
    /// Returns the number of models unloaded.
    pub async fn shutdown(&self) -> usize {
        self.dispatcher.close();
        let mut unloaded = 0;
        for entry in self.registry.list_loaded() {
            if self
                .unload_with_reason(entry.id(), UnloadReason::Shutdown)
                .await
            {
                unloaded += 1;
            }
        }
        info!(unloaded, "model orchestrator shut down");
        unloaded
    }
}
