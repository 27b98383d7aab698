use std::collections::HashMap;

use crate::engine::types::{StepState, StepStatus};

/// Change to apply to a record's completed/failed tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TallyDelta {
    pub completed: i32,
    pub failed: i32,
}

impl TallyDelta {
    pub const ZERO: TallyDelta = TallyDelta {
        completed: 0,
        failed: 0,
    };

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Apply the delta, flooring both counters at zero.
    pub fn apply_to(&self, completed: &mut u32, failed: &mut u32) {
        *completed = clamp_add(*completed, self.completed);
        *failed = clamp_add(*failed, self.failed);
    }
}

fn clamp_add(value: u32, delta: i32) -> u32 {
    if delta >= 0 {
        value.saturating_add(delta.unsigned_abs())
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Per-workflow step reconciliation.
///
/// Upstream reporters may repeat or reorder terminal reports for the same
/// step. Only a transition into a terminal state that differs from the
/// previous one moves the tallies.
#[derive(Debug, Default, Clone)]
pub struct StepStateTracker {
    states: HashMap<String, StepState>,
}

impl StepStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status report for `step` and return the tally change.
    pub fn report(&mut self, step: &str, status: StepStatus) -> TallyDelta {
        let previous = self.state(step);

        match (status, previous) {
            (StepStatus::Running, StepState::Unseen) => {
                self.states.insert(step.to_string(), StepState::Running);
                TallyDelta::ZERO
            }
            (StepStatus::Completed, prev) if prev != StepState::Completed => {
                self.states.insert(step.to_string(), StepState::Completed);
                TallyDelta {
                    completed: 1,
                    failed: if prev == StepState::Failed { -1 } else { 0 },
                }
            }
            (StepStatus::Failed, prev) if prev != StepState::Failed => {
                self.states.insert(step.to_string(), StepState::Failed);
                TallyDelta {
                    completed: if prev == StepState::Completed { -1 } else { 0 },
                    failed: 1,
                }
            }
            _ => TallyDelta::ZERO,
        }
    }

    pub fn state(&self, step: &str) -> StepState {
        self.states.get(step).copied().unwrap_or(StepState::Unseen)
    }

    /// Number of steps seen so far.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
