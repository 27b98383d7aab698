use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trackers::{CompanionTracker, TrackerError, WorkflowHistory};

/// Entries kept per workflow before the oldest are dropped.
pub const ACTIVITY_HISTORY_CAPACITY: usize = 100;

/// What a worker was doing when it reported activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    FileRead,
    FileWrite,
    FileEdit,
    Command,
    Thinking,
    #[default]
    Analysis,
    Completion,
}

impl std::str::FromStr for ActivityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_read" => Ok(ActivityKind::FileRead),
            "file_write" => Ok(ActivityKind::FileWrite),
            "file_edit" => Ok(ActivityKind::FileEdit),
            "command" => Ok(ActivityKind::Command),
            "thinking" => Ok(ActivityKind::Thinking),
            "analysis" => Ok(ActivityKind::Analysis),
            "completion" => Ok(ActivityKind::Completion),
            other => Err(anyhow::anyhow!("Unknown activity kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub kind: ActivityKind,
    pub details: String,
}

/// Per-workflow log of worker activity notes.
pub struct ActivityLog {
    history: WorkflowHistory<ActivityEntry>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(ACTIVITY_HISTORY_CAPACITY)
    }
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: WorkflowHistory::new("activity", capacity),
        }
    }

    pub fn record(
        &self,
        workflow: &str,
        step: Option<&str>,
        kind: ActivityKind,
        details: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), TrackerError> {
        self.history.push(
            workflow,
            ActivityEntry {
                timestamp,
                step: step.map(str::to_string),
                kind,
                details: details.to_string(),
            },
        )
    }

    pub fn entries(&self, workflow: &str) -> Result<Vec<ActivityEntry>, TrackerError> {
        self.history.get(workflow)
    }

    pub fn current(&self, workflow: &str) -> Result<Option<ActivityEntry>, TrackerError> {
        self.history.latest(workflow)
    }
}

impl CompanionTracker for ActivityLog {
    fn name(&self) -> &str {
        "activity"
    }

    fn tracked_workflow_names(&self) -> Result<HashSet<String>, TrackerError> {
        self.history.workflows()
    }

    fn clear(&self, workflow: &str) -> Result<(), TrackerError> {
        self.history.remove(workflow)
    }

    fn trim_to(&self, max_len: usize) -> Result<usize, TrackerError> {
        self.history.trim_to(max_len)
    }
}
