pub mod activity;
pub mod history;
pub mod token_usage;

use std::collections::HashSet;

pub use activity::{ActivityEntry, ActivityKind, ActivityLog};
pub use history::WorkflowHistory;
pub use token_usage::{TokenLedger, TokenSummary};

/// Failure reported by a companion tracker.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The tracker's internal lock was poisoned by a panicking writer.
    #[error("tracker '{tracker}' state is poisoned")]
    Poisoned { tracker: String },

    /// Tracker-specific failure.
    #[error("tracker '{tracker}' failed: {message}")]
    Failed { tracker: String, message: String },
}

/// Side-tracker holding per-workflow state outside the record store.
///
/// The eviction scheduler uses this to find orphaned state, clear evicted
/// workflows and bound per-workflow history. It never looks inside.
pub trait CompanionTracker: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Workflows this tracker currently holds state for.
    fn tracked_workflow_names(&self) -> Result<HashSet<String>, TrackerError>;

    /// Drop all state held for `workflow`.
    fn clear(&self, workflow: &str) -> Result<(), TrackerError>;

    /// Trim every per-workflow history to at most `max_len` entries.
    /// Returns the number of entries dropped.
    fn trim_to(&self, max_len: usize) -> Result<usize, TrackerError>;
}
