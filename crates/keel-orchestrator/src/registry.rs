//! Model registry and lifecycle state.
//!
//! The registry is the authoritative map from model id to
//! [`LoadedModelEntry`]. Entries are inserted only once fully constructed,
//! so callers never observe a half-loaded model.
//!
//! Recency is tracked with a registry-wide logical clock: every insert and
//! every access takes the next tick, which gives a strict LRU order with no
//! ties between entries.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock as Gate;

use crate::backend::InferenceBackend;
use crate::events::{EventBus, UnloadReason};
use crate::types::{
    ModelConfiguration, ModelHandle, ModelParameters, ModelRequest, ModelState, ModelStats,
    ModelStatus, RuntimeOptions,
};

/// A resident model. Owned by the registry; shared with in-flight calls.
pub struct LoadedModelEntry {
    handle: ModelHandle,
    request: ModelRequest,
    path: PathBuf,
    backend: Arc<dyn InferenceBackend>,
    options: RwLock<RuntimeOptions>,
    /// Shared for concurrent-safe sessions, exclusive otherwise and for unload
    gate: Gate<()>,
    state: AtomicU8,
    last_tick: AtomicU64,
    last_access: Mutex<DateTime<Utc>>,
    access_count: AtomicU64,
    loaded_at: Instant,
}

impl LoadedModelEntry {
    pub fn new(
        handle: ModelHandle,
        request: ModelRequest,
        backend: Arc<dyn InferenceBackend>,
        options: RuntimeOptions,
    ) -> Self {
        let path = request.path.clone();
        let loaded_at = handle.loaded_at;
        Self {
            handle,
            request,
            path,
            backend,
            options: RwLock::new(options),
            gate: Gate::new(()),
            state: AtomicU8::new(ModelState::Ready.as_u8()),
            last_tick: AtomicU64::new(0),
            last_access: Mutex::new(loaded_at),
            access_count: AtomicU64::new(0),
            loaded_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.handle.id
    }

    /// Handle snapshot with the current lifecycle state.
    pub fn handle(&self) -> ModelHandle {
        let mut handle = self.handle.clone();
        handle.state = self.state();
        handle
    }

    pub fn request(&self) -> &ModelRequest {
        &self.request
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    pub fn memory_usage(&self) -> u64 {
        self.handle.memory_bytes
    }

    pub fn state(&self) -> ModelState {
        ModelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ModelState::Ready
    }

    /// Move `from → to` if the entry is currently in `from`.
    fn transition(&self, from: ModelState, to: ModelState) -> bool {
        debug_assert!(from.can_transition_to(to));
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn options(&self) -> RuntimeOptions {
        self.options.read().clone()
    }

    pub fn update_options(&self, params: &ModelParameters) {
        self.options.write().apply(params);
    }

    pub(crate) fn gate(&self) -> &Gate<()> {
        &self.gate
    }

    pub fn last_tick(&self) -> u64 {
        self.last_tick.load(Ordering::Acquire)
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        *self.last_access.lock()
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    pub fn configuration(&self) -> ModelConfiguration {
        let options = self.options.read();
        ModelConfiguration {
            id: self.handle.id.clone(),
            provider: self.handle.provider.clone(),
            model_type: self.handle.model_type,
            status: ModelStatus::Loaded,
            path: Some(self.path.clone()),
            format: Some(self.handle.format),
            memory_bytes: Some(self.handle.memory_bytes),
            priority: Some(options.priority),
            context_size: Some(options.context_size),
        }
    }

    pub fn stats(&self) -> ModelStats {
        ModelStats {
            id: self.handle.id.clone(),
            model_type: self.handle.model_type,
            memory_bytes: self.handle.memory_bytes,
            access_count: self.access_count(),
            last_access: self.last_access(),
        }
    }
}

impl std::fmt::Debug for LoadedModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModelEntry")
            .field("id", &self.handle.id)
            .field("state", &self.state())
            .field("memory_bytes", &self.handle.memory_bytes)
            .field("last_tick", &self.last_tick())
            .finish()
    }
}

/// Authoritative map from model id to entry.
#[derive(Debug)]
pub struct ModelRegistry {
    entries: RwLock<HashMap<String, Arc<LoadedModelEntry>>>,
    clock: AtomicU64,
    events: EventBus,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::with_events(EventBus::default())
    }

    pub fn with_events(events: EventBus) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Insert a fully constructed entry. Returns the entry back if the id is
    /// already present.
    pub fn insert(&self, entry: LoadedModelEntry) -> Result<Arc<LoadedModelEntry>, LoadedModelEntry> {
        let mut entries = self.entries.write();
        if entries.contains_key(entry.id()) {
            return Err(entry);
        }
        entry.last_tick.store(self.tick(), Ordering::Release);
        let entry = Arc::new(entry);
        entries.insert(entry.id().to_string(), Arc::clone(&entry));
        tracing::debug!(model_id = %entry.id(), tick = entry.last_tick(), "registry entry inserted");
        Ok(entry)
    }

    /// Record an access: new LRU position, counter, timestamp.
    pub fn touch(&self, entry: &LoadedModelEntry) {
        entry.last_tick.store(self.tick(), Ordering::Release);
        entry.access_count.fetch_add(1, Ordering::Relaxed);
        *entry.last_access.lock() = Utc::now();
    }

    /// Refresh an entry's LRU position without counting an access.
    pub fn refresh(&self, entry: &LoadedModelEntry) {
        entry.last_tick.store(self.tick(), Ordering::Release);
    }

    pub fn get(&self, id: &str) -> Option<Arc<LoadedModelEntry>> {
        self.entries.read().get(id).cloned()
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.entries
            .read()
            .get(id)
            .map(|e| e.is_ready())
            .unwrap_or(false)
    }

    /// Entries sorted by id.
    pub fn list_loaded(&self) -> Vec<Arc<LoadedModelEntry>> {
        let mut list: Vec<_> = self.entries.read().values().cloned().collect();
        list.sort_by(|a, b| a.id().cmp(b.id()));
        list
    }

    /// Entries from least to most recently used.
    pub fn lru_order(&self) -> Vec<Arc<LoadedModelEntry>> {
        let mut list: Vec<_> = self.entries.read().values().cloned().collect();
        list.sort_by_key(|e| e.last_tick());
        list
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_memory_usage(&self) -> u64 {
        self.entries.read().values().map(|e| e.memory_usage()).sum()
    }

    /// Unload `id`. Returns the bytes freed, or `None` when the id is absent
    /// or already being unloaded.
    ///
    /// Waits for in-flight inferences on the entry, then removes it, releases
    /// the backend session and publishes `ModelUnloaded`. Dropping the future
    /// while it waits leaves the model `Ready`; once the entry is removed the
    /// release runs to completion on its own task.
    pub async fn unload(&self, id: &str, reason: UnloadReason) -> Option<u64> {
        let entry = self.get(id)?;
        if !entry.transition(ModelState::Ready, ModelState::Unloading) {
            tracing::debug!(model_id = id, state = %entry.state(), "unload skipped");
            return None;
        }

        let pending = PendingUnload { entry: &entry, armed: true };
        let exclusive = entry.gate().write().await;
        {
            let mut entries = self.entries.write();
            if entries
                .get(id)
                .is_some_and(|current| Arc::ptr_eq(current, &entry))
            {
                entries.remove(id);
            }
        }
        pending.disarm();
        drop(exclusive);

        let events = self.events.clone();
        let id = id.to_string();
        let release = tokio::spawn(async move {
            entry.backend().unload().await;
            entry.transition(ModelState::Unloading, ModelState::Unloaded);

            let freed = entry.memory_usage();
            tracing::info!(model_id = %id, bytes = freed, reason = ?reason, "model unloaded");
            events.model_unloaded(&id, freed, reason);
            freed
        });
        release.await.ok()
    }
}

/// Puts an entry back to `Ready` if its unload is abandoned before the entry
/// leaves the map.
struct PendingUnload<'a> {
    entry: &'a LoadedModelEntry,
    armed: bool,
}

impl PendingUnload<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingUnload<'_> {
    fn drop(&mut self) {
        if self.armed && self.entry.transition(ModelState::Unloading, ModelState::Ready) {
            tracing::debug!(model_id = %self.entry.id(), "abandoned unload, model kept");
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
