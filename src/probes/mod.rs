pub mod memory;
pub mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::types::ProcessStatus;

pub use memory::SystemMemoryPressure;
pub use process::ProcessTable;

/// Failure of an external probe. Callers treat it as "no data this cycle".
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("probe unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reports liveness of the worker process behind an execution handle.
#[async_trait]
pub trait ProcessStatusProvider: Send + Sync {
    /// `Ok(None)` when the handle is unknown to the provider.
    async fn status(&self, execution_handle: &str) -> Result<Option<ProcessStatus>, ProbeError>;
}

/// Memory usage expressed as percentages (0-100).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPressure {
    /// Share of system memory in use.
    pub system_percent: f64,
    /// This process's resident set as a share of its memory limit.
    pub rss_percent: f64,
}

impl MemoryPressure {
    /// The single 0-100 value eviction decisions are made on.
    pub fn value(&self) -> f64 {
        self.system_percent.max(self.rss_percent).clamp(0.0, 100.0)
    }
}

/// Source of memory-pressure readings for the eviction scheduler.
pub trait MemoryPressureSignal: Send + Sync {
    fn current_pressure(&self) -> Result<MemoryPressure, ProbeError>;

    /// One-shot hint to hand freed memory back to the OS after an
    /// aggressive sweep.
    fn reclaim(&self) {}
}
