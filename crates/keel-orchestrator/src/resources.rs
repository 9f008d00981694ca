//! Memory budget accounting.
//!
//! The accountant answers "does this fit?" against the configured budget.
//! Committed usage is whatever the registry holds; loads whose native
//! construction is still running are charged through [`Reservation`]s so
//! that two loads can never both claim the same headroom.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{GIB, OrchestratorConfig};
use crate::events::ThresholdReport;
use crate::registry::ModelRegistry;
use crate::types::ModelRequest;

/// Custom option that pins a model's footprint in bytes.
pub const MEMORY_BYTES_OPTION: &str = "memory_bytes";

/// Bytes per parameter assumed for parameter-count size tags (fp16).
const BYTES_PER_PARAM: f64 = 2.0;

static PARAM_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)?)\s*([bm])$").expect("valid parameter tag pattern"));

/// Process-wide memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub max_memory_bytes: u64,
    pub memory_warning_threshold: u64,
    pub min_memory_buffer: u64,
}

impl ResourceBudget {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_memory_bytes: config.max_memory_bytes,
            memory_warning_threshold: config.memory_warning_threshold,
            min_memory_buffer: config.min_memory_buffer,
        }
    }

    /// Largest total that still leaves the minimum buffer free.
    pub fn usable_bytes(&self) -> u64 {
        self.max_memory_bytes.saturating_sub(self.min_memory_buffer)
    }
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Size class of a model, parsed from its size tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeClass {
    Tiny,
    Small,
    Base,
    Medium,
    Large,
    Xl,
    /// Parameter-count tag such as `7b` or `350m`
    Params(f64),
}

impl SizeClass {
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_ascii_lowercase();
        let class = match tag.as_str() {
            "tiny" => Self::Tiny,
            "small" => Self::Small,
            "base" => Self::Base,
            "medium" => Self::Medium,
            "large" => Self::Large,
            "xl" | "xlarge" | "x-large" => Self::Xl,
            _ => {
                let caps = PARAM_TAG.captures(&tag)?;
                let n: f64 = caps[1].parse().ok()?;
                let scale = if &caps[2] == "b" { 1e9 } else { 1e6 };
                Self::Params(n * scale)
            }
        };
        Some(class)
    }

    /// Unquantized footprint in bytes.
    pub fn base_bytes(self) -> u64 {
        match self {
            Self::Tiny => GIB,
            Self::Small => 2 * GIB,
            Self::Base => 4 * GIB,
            Self::Medium => 8 * GIB,
            Self::Large => 16 * GIB,
            Self::Xl => 32 * GIB,
            Self::Params(params) => (params * BYTES_PER_PARAM) as u64,
        }
    }

    /// Transformer layers offloaded when an accelerator is present.
    /// Parameter tags map onto the nearest named class by footprint.
    pub fn gpu_layers(self) -> u32 {
        match self {
            Self::Tiny => 16,
            Self::Small => 24,
            Self::Base => 32,
            Self::Medium => 40,
            Self::Large => 60,
            Self::Xl => 80,
            Self::Params(_) => {
                let bytes = self.base_bytes();
                if bytes <= GIB {
                    16
                } else if bytes <= 2 * GIB {
                    24
                } else if bytes <= 4 * GIB {
                    32
                } else if bytes <= 8 * GIB {
                    40
                } else if bytes <= 16 * GIB {
                    60
                } else {
                    80
                }
            }
        }
    }
}

/// Footprint multiplier for a quantization tag.
pub fn quantization_multiplier(tag: Option<&str>) -> f64 {
    let Some(tag) = tag else {
        return 1.0;
    };
    let tag = tag.trim().to_ascii_lowercase();
    // importance-matrix quants (iq2_xs, iq4_nl) size like their q counterparts
    let tag = match tag.strip_prefix("iq") {
        Some(rest) => format!("q{rest}"),
        None => tag,
    };
    let tag = tag.as_str();
    if tag.starts_with("q2") || tag.starts_with("q3") || tag.starts_with("int3") {
        0.3
    } else if tag.starts_with("q4") || tag.starts_with("int4") {
        0.4
    } else if tag.starts_with("q5") || tag.starts_with("q6") {
        0.6
    } else if tag.starts_with("q8") || tag.starts_with("int8") {
        0.8
    } else if matches!(tag, "f16" | "fp16" | "bf16") {
        1.0
    } else if matches!(tag, "f32" | "fp32") {
        2.0
    } else {
        1.0
    }
}

/// Estimate a request's footprint in bytes.
///
/// A `memory_bytes` custom option wins; otherwise the size tag (unknown or
/// missing tags count as medium) is scaled by the quantization multiplier.
pub fn estimate_footprint(request: &ModelRequest) -> u64 {
    if let Some(bytes) = request.option_u64(MEMORY_BYTES_OPTION) {
        return bytes;
    }
    let class = request
        .size
        .as_deref()
        .and_then(SizeClass::parse)
        .unwrap_or(SizeClass::Medium);
    let multiplier = quantization_multiplier(request.quantization.as_deref());
    (class.base_bytes() as f64 * multiplier) as u64
}

// ============================================================================
// Reservations
// ============================================================================

#[derive(Debug, Default)]
struct Ledger {
    pending: Mutex<HashMap<u64, (String, u64)>>,
    next_id: AtomicU64,
}

impl Ledger {
    fn total(&self) -> u64 {
        self.pending.lock().values().map(|(_, bytes)| *bytes).sum()
    }
}

/// Memory held for a load whose construction is in progress.
///
/// Dropping the reservation releases it; [`Reservation::commit`] hands the
/// bytes over to the registry entry.
#[derive(Debug)]
pub struct Reservation {
    ledger: Arc<Ledger>,
    id: u64,
    model_id: String,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Release the hold because the registry now accounts for the bytes.
    /// Must run in the same critical section as the registry insert.
    pub fn commit(self) -> u64 {
        self.ledger.pending.lock().remove(&self.id);
        tracing::trace!(model_id = %self.model_id, bytes = self.bytes, "reservation committed");
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.ledger.pending.lock().remove(&self.id).is_some() {
            tracing::debug!(model_id = %self.model_id, bytes = self.bytes, "reservation rolled back");
        }
    }
}

// ============================================================================
// Accountant
// ============================================================================

/// Tracks committed and reserved memory against the budget.
#[derive(Debug)]
pub struct ResourceAccountant {
    budget: ResourceBudget,
    registry: Arc<ModelRegistry>,
    ledger: Arc<Ledger>,
}

impl ResourceAccountant {
    pub fn new(budget: ResourceBudget, registry: Arc<ModelRegistry>) -> Self {
        Self {
            budget,
            registry,
            ledger: Arc::new(Ledger::default()),
        }
    }

    pub fn budget(&self) -> ResourceBudget {
        self.budget
    }

    pub fn estimate_footprint(&self, request: &ModelRequest) -> u64 {
        estimate_footprint(request)
    }

    /// Committed plus reserved bytes.
    pub fn current_usage(&self) -> u64 {
        self.registry.total_memory_usage() + self.reserved_bytes()
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.ledger.total()
    }

    /// Whether a load of `model_id` currently holds a reservation.
    pub fn is_reserved(&self, model_id: &str) -> bool {
        self.ledger
            .pending
            .lock()
            .values()
            .any(|(id, _)| id == model_id)
    }

    /// `current + bytes + min_buffer <= max`
    pub fn has_room_for(&self, bytes: u64) -> bool {
        self.current_usage()
            .saturating_add(bytes)
            .saturating_add(self.budget.min_memory_buffer)
            <= self.budget.max_memory_bytes
    }

    /// Bytes a new load may still claim.
    pub fn available(&self) -> u64 {
        self.budget.usable_bytes().saturating_sub(self.current_usage())
    }

    /// Hold `bytes` for `model_id` until committed or dropped.
    pub fn reserve(&self, model_id: &str, bytes: u64) -> Reservation {
        let id = self.ledger.next_id.fetch_add(1, Ordering::Relaxed);
        self.ledger
            .pending
            .lock()
            .insert(id, (model_id.to_string(), bytes));
        tracing::trace!(model_id, bytes, "memory reserved");
        Reservation {
            ledger: Arc::clone(&self.ledger),
            id,
            model_id: model_id.to_string(),
            bytes,
        }
    }

    /// Threshold report when `new_total` exceeds the warning threshold.
    pub fn check_threshold(&self, new_total: u64) -> Option<ThresholdReport> {
        let budget = self.budget;
        if new_total <= budget.memory_warning_threshold {
            return None;
        }
        let percent = |bytes: u64| {
            if budget.max_memory_bytes == 0 {
                0.0
            } else {
                bytes as f64 / budget.max_memory_bytes as f64 * 100.0
            }
        };
        let recommendation = if new_total > budget.usable_bytes() {
            "Memory critically low: unload unused models or run optimize_memory before loading more"
        } else {
            "Memory usage above warning threshold: consider unloading idle models"
        };
        Some(ThresholdReport {
            current_bytes: new_total,
            threshold_bytes: budget.memory_warning_threshold,
            max_bytes: budget.max_memory_bytes,
            current_percent: percent(new_total),
            threshold_percent: percent(budget.memory_warning_threshold),
            recommendation: recommendation.to_string(),
        })
    }
}
