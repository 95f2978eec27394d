//! Per-category memory accounting with peak tracking.
//!
//! Every tensor buffer registers its bytes against one accountant on
//! creation and deregisters when the last owner drops. The accountant is the
//! only state shared between the training loop and the background sampler,
//! so all mutation is serialized through a single mutex.

use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;

use nanotune_core::{NanoTuneError, Result};

/// Accounting tag attached to every allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    ModelWeights,
    Activations,
    OptimizerStates,
    Gradients,
    Temporary,
}

impl MemoryCategory {
    /// All categories in a fixed order (index matches `idx`).
    pub const ALL: [MemoryCategory; 5] = [
        MemoryCategory::ModelWeights,
        MemoryCategory::Activations,
        MemoryCategory::OptimizerStates,
        MemoryCategory::Gradients,
        MemoryCategory::Temporary,
    ];

    fn idx(&self) -> usize {
        match self {
            MemoryCategory::ModelWeights => 0,
            MemoryCategory::Activations => 1,
            MemoryCategory::OptimizerStates => 2,
            MemoryCategory::Gradients => 3,
            MemoryCategory::Temporary => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MemoryCategory::ModelWeights => "model_weights",
            MemoryCategory::Activations => "activations",
            MemoryCategory::OptimizerStates => "optimizer_states",
            MemoryCategory::Gradients => "gradients",
            MemoryCategory::Temporary => "temporary",
        }
    }
}

/// Live/peak counters for one category.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CategoryCounters {
    pub current: u64,
    pub peak: u64,
}

/// Point-in-time view of the accountant.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub by_category: [CategoryCounters; 5],
    pub total_current: u64,
    pub total_peak: u64,
}

impl MemorySnapshot {
    pub fn category(&self, cat: MemoryCategory) -> CategoryCounters {
        self.by_category[cat.idx()]
    }
}

/// Snapshot plus the observation window it covers.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub snapshot: MemorySnapshot,
    pub window_secs: f64,
}

#[derive(Debug, Default)]
struct AccountantInner {
    by_category: [CategoryCounters; 5],
    total_current: u64,
    total_peak: u64,
}

/// Serialized byte accountant shared by all tensor allocations.
#[derive(Debug)]
pub struct MemoryAccountant {
    inner: Mutex<AccountantInner>,
    /// Optional hard ceiling on total live bytes.
    limit: Option<u64>,
}

impl MemoryAccountant {
    /// Create an accountant without an allocation ceiling.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AccountantInner::default()),
            limit: None,
        }
    }

    /// Create an accountant that refuses allocations pushing total live
    /// bytes above `limit_bytes`.
    pub fn with_limit(limit_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(AccountantInner::default()),
            limit: Some(limit_bytes),
        }
    }

    /// Register `bytes` under `category`. Fails when the ceiling would be
    /// exceeded, leaving counters untouched.
    pub fn register(&self, category: MemoryCategory, bytes: u64) -> Result<()> {
        let mut inner = self.inner.lock().expect("accountant lock poisoned");
        if let Some(limit) = self.limit {
            if inner.total_current + bytes > limit {
                return Err(NanoTuneError::AllocationFailed(format!(
                    "{} bytes in {} would exceed limit {} (current {})",
                    bytes,
                    category.name(),
                    limit,
                    inner.total_current
                )));
            }
        }
        let c = &mut inner.by_category[category.idx()];
        c.current += bytes;
        c.peak = c.peak.max(c.current);
        inner.total_current += bytes;
        inner.total_peak = inner.total_peak.max(inner.total_current);
        Ok(())
    }

    /// Deregister `bytes` previously registered under `category`.
    pub fn unregister(&self, category: MemoryCategory, bytes: u64) {
        let mut inner = self.inner.lock().expect("accountant lock poisoned");
        let c = &mut inner.by_category[category.idx()];
        c.current = c.current.saturating_sub(bytes);
        inner.total_current = inner.total_current.saturating_sub(bytes);
    }

    /// Consistent snapshot of all counters.
    pub fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.lock().expect("accountant lock poisoned");
        MemorySnapshot {
            by_category: inner.by_category,
            total_current: inner.total_current,
            total_peak: inner.total_peak,
        }
    }

    /// Snapshot annotated with the duration it covers.
    pub fn report(&self, window: Duration) -> MemoryReport {
        MemoryReport {
            snapshot: self.snapshot(),
            window_secs: window.as_secs_f64(),
        }
    }
}

impl Default for MemoryAccountant {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes as human-readable.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}
