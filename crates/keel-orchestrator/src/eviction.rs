//! LRU eviction.
//!
//! Eviction always goes through [`ModelRegistry::unload`], so shared weight
//! references, session disposal and `ModelUnloaded` events behave exactly as
//! for an explicit unload.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::events::UnloadReason;
use crate::registry::ModelRegistry;

/// Selects and unloads least-recently-used models.
#[derive(Debug, Clone)]
pub struct EvictionController {
    registry: Arc<ModelRegistry>,
}

impl EvictionController {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    /// Ids that `free_at_least(bytes)` would unload, coldest first.
    pub fn plan(&self, bytes: u64) -> Vec<String> {
        let mut planned = 0u64;
        let mut ids = Vec::new();
        for entry in self.registry.lru_order() {
            if planned >= bytes {
                break;
            }
            if !entry.is_ready() {
                continue;
            }
            planned += entry.memory_usage();
            ids.push(entry.id().to_string());
        }
        ids
    }

    /// Unload coldest models until at least `bytes` were freed or nothing is
    /// left. Never fails; the caller re-checks room afterwards.
    pub async fn free_at_least(&self, bytes: u64, ct: &CancellationToken) -> u64 {
        let mut freed = 0u64;
        while freed < bytes {
            if ct.is_cancelled() {
                tracing::debug!(freed, requested = bytes, "eviction interrupted by cancellation");
                break;
            }
            let Some(victim) = self
                .registry
                .lru_order()
                .into_iter()
                .find(|e| e.is_ready())
            else {
                break;
            };
            tracing::info!(
                model_id = %victim.id(),
                bytes = victim.memory_usage(),
                "evicting least recently used model"
            );
            // An unload dropped while waiting for in-flight work keeps its model
            let unloaded = tokio::select! {
                unloaded = self.registry.unload(victim.id(), UnloadReason::Evicted) => unloaded,
                _ = ct.cancelled() => {
                    tracing::debug!(model_id = %victim.id(), "eviction abandoned by cancellation");
                    break;
                }
            };
            if let Some(bytes) = unloaded {
                freed += bytes;
            }
        }
        tracing::debug!(freed, requested = bytes, "eviction pass finished");
        freed
    }

    /// Number of models an optimize pass evicts: `ceil(resident * fraction)`,
    /// at least one when anything is resident.
    pub fn optimize_count(resident: usize, fraction: f64) -> usize {
        if resident == 0 {
            return 0;
        }
        let count = (resident as f64 * fraction.clamp(0.0, 1.0)).ceil() as usize;
        count.clamp(1, resident)
    }

    /// Evict the coldest `fraction` of resident models. Returns evicted ids.
    pub async fn evict_coldest(&self, fraction: f64) -> Vec<String> {
        let candidates: Vec<_> = self
            .registry
            .lru_order()
            .into_iter()
            .filter(|e| e.is_ready())
            .collect();
        let count = Self::optimize_count(candidates.len(), fraction);

        let mut evicted = Vec::with_capacity(count);
        for entry in candidates.into_iter().take(count) {
            if self
                .registry
                .unload(entry.id(), UnloadReason::Optimized)
                .await
                .is_some()
            {
                evicted.push(entry.id().to_string());
            }
        }
        evicted
    }
}
