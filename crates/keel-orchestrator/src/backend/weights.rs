//! Shared transformer weight blocks.
//!
//! Contexts built from the same weight file share one [`WeightBlock`]. The
//! arena keeps an explicit reference count per canonical path: acquiring a
//! lease increments it, dropping the lease decrements it, and the arena lets
//! go of the block when the count reaches zero.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::EngineError;

use super::engine::WeightBlock;

struct Slot {
    block: Arc<dyn WeightBlock>,
    refs: usize,
}

type Slots = Arc<Mutex<HashMap<PathBuf, Slot>>>;

/// Reference-counted arena of weight blocks keyed by canonical path.
#[derive(Clone, Default)]
pub struct WeightArena {
    slots: Slots,
}

impl WeightArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical arena key for `path`; falls back to the path itself.
    pub fn key_for(path: &Path) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    /// Share the block for `path`, loading it with `load` when absent.
    ///
    /// `load` runs without the arena lock held. If another caller inserted
    /// the same path meanwhile, the freshly loaded block is dropped and the
    /// existing one is shared.
    pub fn acquire<F>(&self, path: &Path, load: F) -> Result<WeightLease, EngineError>
    where
        F: FnOnce() -> Result<Arc<dyn WeightBlock>, EngineError>,
    {
        let key = Self::key_for(path);

        if let Some(lease) = self.share(&key) {
            return Ok(lease);
        }

        let block = load()?;

        let mut slots = self.slots.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
            block: Arc::clone(&block),
            refs: 0,
        });
        slot.refs += 1;
        tracing::debug!(path = %key.display(), refs = slot.refs, "weight block acquired");
        Ok(WeightLease {
            slots: Arc::clone(&self.slots),
            key,
            block: Arc::clone(&slot.block),
        })
    }

    fn share(&self, key: &Path) -> Option<WeightLease> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(key)?;
        slot.refs += 1;
        tracing::debug!(path = %key.display(), refs = slot.refs, "weight block shared");
        Some(WeightLease {
            slots: Arc::clone(&self.slots),
            key: key.to_path_buf(),
            block: Arc::clone(&slot.block),
        })
    }

    /// Current reference count for `path` (0 when not resident).
    pub fn ref_count(&self, path: &Path) -> usize {
        let key = Self::key_for(path);
        self.slots.lock().get(&key).map(|s| s.refs).unwrap_or(0)
    }

    /// Number of distinct resident blocks.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for WeightArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightArena")
            .field("blocks", &self.len())
            .finish()
    }
}

/// One reference to a shared weight block.
pub struct WeightLease {
    slots: Slots,
    key: PathBuf,
    block: Arc<dyn WeightBlock>,
}

impl WeightLease {
    pub fn block(&self) -> Arc<dyn WeightBlock> {
        Arc::clone(&self.block)
    }

    pub fn path(&self) -> &Path {
        &self.key
    }
}

impl Drop for WeightLease {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&self.key) else {
            return;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            slots.remove(&self.key);
            tracing::debug!(path = %self.key.display(), "weight block released");
        } else {
            tracing::debug!(path = %self.key.display(), refs = slot.refs, "weight block reference dropped");
        }
    }
}

impl std::fmt::Debug for WeightLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightLease")
            .field("path", &self.key)
            .finish()
    }
}
