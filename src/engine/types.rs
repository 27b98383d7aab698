use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activity text set when a workflow record is created.
pub const STARTING_ACTIVITY: &str = "Spinning up workflow...";

/// Activity text set by the ticker while the worker process is up but its
/// sub-agent has not reported anything yet.
pub const WAITING_ACTIVITY: &str = "Waiting for worker agent to start...";

/// Generic activity text some workers emit before anything meaningful.
pub const PROCESSING_ACTIVITY: &str = "Processing...";

/// Returns true when the activity text carries no information beyond
/// "something is happening".
pub fn is_placeholder_activity(activity: Option<&str>) -> bool {
    match activity {
        None => true,
        Some(text) => {
            text.is_empty()
                || text == STARTING_ACTIVITY
                || text == PROCESSING_ACTIVITY
                || text == WAITING_ACTIVITY
        }
    }
}

/// Lifecycle status of a workflow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

impl WorkflowStatus {
    /// Completed and failed records are done; they only wait for eviction.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Paused => write!(f, "paused"),
        }
    }
}

/// Status reported for a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(anyhow::anyhow!("Invalid step status: {}", other)),
        }
    }
}

/// Reconciled state of a step as seen by the step tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Unseen,
    Running,
    Completed,
    Failed,
}

/// Latest process-liveness snapshot for a workflow's worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub sub_agent_alive: bool,
}

/// One token-usage sample reported by a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_percent: Option<f64>,
    /// Estimated cost in USD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Live metrics record for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Stable token reused across restarts of the same named workflow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub status: WorkflowStatus,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    /// Percentage in `0.0..=100.0`.
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_activity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_agent: Option<String>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub retry_attempts: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_token_usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_percent: Option<f64>,
    pub total_cost: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub cost_per_step: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_status: Option<ProcessStatus>,
}

impl WorkflowRecord {
    pub fn new(name: &str, total_steps: u32, now: DateTime<Utc>) -> Self {
        Self {
            workflow_name: name.to_string(),
            execution_id: None,
            correlation_token: None,
            start_time: now,
            end_time: None,
            duration_ms: 0,
            status: WorkflowStatus::Running,
            total_steps,
            completed_steps: 0,
            failed_steps: 0,
            success_rate: 0.0,
            current_step: None,
            current_activity: Some(STARTING_ACTIVITY.to_string()),
            current_model: None,
            current_agent: None,
            cache_hits: 0,
            cache_misses: 0,
            retry_attempts: 0,
            total_tokens: 0,
            current_token_usage: None,
            context_window_percent: None,
            total_cost: 0.0,
            cost_per_step: BTreeMap::new(),
            process_status: None,
        }
    }

    /// Recompute `success_rate` from the step tallies.
    pub fn recompute_success_rate(&mut self) {
        let processed = self.completed_steps + self.failed_steps;
        self.success_rate = if processed == 0 {
            0.0
        } else {
            f64::from(self.completed_steps) / f64::from(processed) * 100.0
        };
    }

    /// Recompute `duration_ms` as the time elapsed since start.
    pub fn recompute_duration(&mut self, now: DateTime<Utc>) {
        self.duration_ms = (now - self.start_time).num_milliseconds().max(0);
    }

    /// Timestamp used to order records for eviction: end time if finished,
    /// start time otherwise.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.end_time.unwrap_or(self.start_time)
    }
}

/// Shallow patch of presentation/resource fields. Absent fields are left as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsPatch {
    pub execution_id: Option<String>,
    pub current_activity: Option<String>,
    pub current_model: Option<String>,
    pub current_agent: Option<String>,
    pub total_tokens: Option<u64>,
    pub total_cost: Option<f64>,
    pub context_window_percent: Option<f64>,
    pub cache_hits: Option<u64>,
    pub cache_misses: Option<u64>,
    pub retry_attempts: Option<u64>,
}

impl MetricsPatch {
    pub fn apply_to(self, record: &mut WorkflowRecord) {
        if let Some(v) = self.execution_id {
            record.execution_id = Some(v);
        }
        if let Some(v) = self.current_activity {
            record.current_activity = Some(v);
        }
        if let Some(v) = self.current_model {
            record.current_model = Some(v);
        }
        if let Some(v) = self.current_agent {
            record.current_agent = Some(v);
        }
        if let Some(v) = self.total_tokens {
            record.total_tokens = v;
        }
        if let Some(v) = self.total_cost {
            record.total_cost = v;
        }
        if let Some(v) = self.context_window_percent {
            record.context_window_percent = Some(v);
        }
        if let Some(v) = self.cache_hits {
            record.cache_hits = v;
        }
        if let Some(v) = self.cache_misses {
            record.cache_misses = v;
        }
        if let Some(v) = self.retry_attempts {
            record.retry_attempts = v;
        }
    }
}

/// Final result reported by the worker when a workflow ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowResult {
    pub success: bool,
    pub completed_names: Vec<String>,
    pub failed_names: Vec<String>,
}

/// Returned by `start`: what a caller needs to correlate later events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowHandle {
    pub workflow_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub correlation_token: String,
}

/// Kind of change carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Snapshot,
    Start,
    StepUpdate,
    End,
    Activity,
    ResourceUpdate,
    /// Periodic heartbeat and generic metric patches.
    Metrics,
    Evicted,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Snapshot => "snapshot",
            ChangeKind::Start => "start",
            ChangeKind::StepUpdate => "step-update",
            ChangeKind::End => "end",
            ChangeKind::Activity => "activity",
            ChangeKind::ResourceUpdate => "resource-update",
            ChangeKind::Metrics => "metrics",
            ChangeKind::Evicted => "evicted",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        kind: ChangeKind,
        workflow_name: Option<&str>,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            workflow_name: workflow_name.map(str::to_string),
            payload,
            timestamp,
        }
    }

    /// Full-state event sent to new subscribers.
    pub fn snapshot(records: &[WorkflowRecord], timestamp: DateTime<Utc>) -> Self {
        Self::new(
            ChangeKind::Snapshot,
            None,
            serde_json::json!({ "workflows": records }),
            timestamp,
        )
    }

    /// Event whose payload is a single record under `metrics`.
    pub fn for_record(kind: ChangeKind, record: &WorkflowRecord, timestamp: DateTime<Utc>) -> Self {
        Self::new(
            kind,
            Some(&record.workflow_name),
            serde_json::json!({ "metrics": record }),
            timestamp,
        )
    }
}

/// Inbound lifecycle event as submitted by workers (HTTP body, replay log line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Start {
        name: String,
        total_steps: u32,
        #[serde(default)]
        execution_id: Option<String>,
        #[serde(default)]
        correlation_seed: Option<String>,
    },
    Step {
        name: String,
        step: String,
        status: StepStatus,
    },
    Activity {
        name: String,
        #[serde(default)]
        step: Option<String>,
        text: String,
        #[serde(default)]
        kind: Option<String>,
    },
    Tokens {
        name: String,
        step: String,
        usage: TokenUsage,
    },
    Metrics {
        name: String,
        fields: MetricsPatch,
    },
    End {
        name: String,
        result: WorkflowResult,
        #[serde(default)]
        duration_ms: Option<i64>,
    },
}

impl LifecycleEvent {
    pub fn workflow_name(&self) -> &str {
        match self {
            LifecycleEvent::Start { name, .. }
            | LifecycleEvent::Step { name, .. }
            | LifecycleEvent::Activity { name, .. }
            | LifecycleEvent::Tokens { name, .. }
            | LifecycleEvent::Metrics { name, .. }
            | LifecycleEvent::End { name, .. } => name,
        }
    }
}
