use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use md5::{Digest, Md5};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::steps::StepStateTracker;
use crate::engine::types::*;

/// Derive the stable correlation token for a workflow.
///
/// MD5 of the seed, laid out as a version-4 UUID so that tools expecting a
/// GUID (agent `--resume` flags) accept it. Same seed, same token.
pub fn correlation_token(seed: &str) -> String {
    let digest = Md5::digest(seed.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest);
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .to_string()
}

/// Accumulated step tallies versus the counts the end event declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TallyDrift {
    pub tracked_completed: u32,
    pub tracked_failed: u32,
    pub reported_completed: u32,
    pub reported_failed: u32,
}

impl TallyDrift {
    pub fn is_consistent(&self) -> bool {
        self.tracked_completed == self.reported_completed
            && self.tracked_failed == self.reported_failed
    }
}

/// Result of [`WorkflowStore::end`].
#[derive(Debug, Clone)]
pub struct EndOutcome {
    pub record: WorkflowRecord,
    pub drift: TallyDrift,
}

struct Entry {
    record: WorkflowRecord,
    steps: StepStateTracker,
}

/// Authoritative map of workflow name to live record.
///
/// Every mutation goes through one of the methods below; callers only ever
/// get clones back.
#[derive(Default)]
pub struct WorkflowStore {
    entries: HashMap<String, Entry>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh running record, replacing any previous one under `name`.
    pub fn start(
        &mut self,
        name: &str,
        total_steps: u32,
        execution_id: Option<String>,
        correlation_seed: Option<&str>,
        now: DateTime<Utc>,
    ) -> WorkflowRecord {
        let token = self
            .entries
            .get(name)
            .and_then(|e| e.record.correlation_token.clone())
            .unwrap_or_else(|| correlation_token(correlation_seed.unwrap_or(name)));

        let mut record = WorkflowRecord::new(name, total_steps, now);
        record.execution_id = execution_id;
        record.correlation_token = Some(token);

        let replaced = self
            .entries
            .insert(
                name.to_string(),
                Entry {
                    record: record.clone(),
                    steps: StepStateTracker::new(),
                },
            )
            .is_some();

        info!(workflow = %name, total_steps, replaced, "Workflow started");
        record
    }

    /// Apply a step status report. Unknown workflows are a logged no-op.
    pub fn step_update(
        &mut self,
        name: &str,
        step: &str,
        status: StepStatus,
        now: DateTime<Utc>,
    ) -> Option<WorkflowRecord> {
        let key = self.resolve_key(name, "step update")?;
        let entry = self.entries.get_mut(&key)?;

        let delta = entry.steps.report(step, status);
        let record = &mut entry.record;
        delta.apply_to(&mut record.completed_steps, &mut record.failed_steps);
        record.current_step = Some(step.to_string());
        record.recompute_success_rate();
        record.recompute_duration(now);

        debug!(
            workflow = %key,
            step = %step,
            status = %status,
            processed = record.completed_steps + record.failed_steps,
            total = record.total_steps,
            "Step update"
        );

        Some(record.clone())
    }

    /// Shallow-merge presentation/resource fields.
    pub fn patch_metrics(&mut self, name: &str, patch: MetricsPatch) -> Option<WorkflowRecord> {
        let record = self.record_mut(name, "metrics patch")?;
        patch.apply_to(record);
        Some(record.clone())
    }

    pub fn record_activity(&mut self, name: &str, text: &str) -> Option<WorkflowRecord> {
        let record = self.record_mut(name, "activity")?;
        record.current_activity = Some(text.to_string());
        Some(record.clone())
    }

    /// Accumulate one token-usage sample into totals and the per-step cost map.
    pub fn record_token_usage(
        &mut self,
        name: &str,
        step: &str,
        usage: &TokenUsage,
    ) -> Option<WorkflowRecord> {
        let record = self.record_mut(name, "token usage")?;
        record.total_tokens = record.total_tokens.saturating_add(usage.total_tokens);
        record.context_window_percent = usage.context_window_percent;
        if let Some(model) = &usage.model {
            record.current_model = Some(model.clone());
        }
        if let Some(cost) = usage.cost {
            record.total_cost += cost;
            *record.cost_per_step.entry(step.to_string()).or_insert(0.0) += cost;
        }
        record.current_token_usage = Some(usage.clone());
        Some(record.clone())
    }

    /// Close a workflow. The result's counts overwrite the tracked tallies.
    pub fn end(
        &mut self,
        name: &str,
        result: &WorkflowResult,
        duration: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<EndOutcome> {
        let record = self.record_mut(name, "end")?;

        let drift = TallyDrift {
            tracked_completed: record.completed_steps,
            tracked_failed: record.failed_steps,
            reported_completed: saturating_len(&result.completed_names),
            reported_failed: saturating_len(&result.failed_names),
        };
        if !drift.is_consistent() {
            warn!(
                workflow = %record.workflow_name,
                tracked_completed = drift.tracked_completed,
                tracked_failed = drift.tracked_failed,
                reported_completed = drift.reported_completed,
                reported_failed = drift.reported_failed,
                "Step tallies disagree with final result; using final result"
            );
        }

        // First end wins for end_time.
        let ended_at = match record.end_time {
            Some(first) => {
                debug!(workflow = %record.workflow_name, status = %record.status, "Repeated end for finished workflow");
                first
            }
            None => now,
        };
        record.end_time = Some(ended_at);
        record.duration_ms = match duration {
            Some(d) => d.num_milliseconds().max(0),
            None => (ended_at - record.start_time).num_milliseconds().max(0),
        };
        record.completed_steps = drift.reported_completed;
        record.failed_steps = drift.reported_failed;
        record.recompute_success_rate();
        record.status = if result.success {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };

        info!(
            workflow = %record.workflow_name,
            status = %record.status,
            completed = record.completed_steps,
            failed = record.failed_steps,
            "Workflow ended"
        );

        Some(EndOutcome {
            record: record.clone(),
            drift,
        })
    }

    pub fn refresh_duration(&mut self, name: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.record.recompute_duration(now);
        }
    }

    pub fn record_process_status(&mut self, name: &str, status: ProcessStatus) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.record.process_status = Some(status);
        }
    }

    /// Transition a running record whose worker vanished to `failed`.
    /// Returns false if the record is absent or no longer running.
    pub fn mark_process_died(&mut self, name: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if entry.record.status == WorkflowStatus::Running => {
                entry.record.status = WorkflowStatus::Failed;
                entry.record.end_time = Some(now);
                entry.record.recompute_duration(now);
                warn!(workflow = %name, "Worker process died, marking workflow failed");
                true
            }
            _ => false,
        }
    }

    /// Replace placeholder activity text with the waiting hint. Real activity
    /// text is never overwritten.
    pub fn mark_waiting_for_agent(&mut self, name: &str) -> bool {
        match self.entries.get_mut(name) {
            Some(entry)
                if is_placeholder_activity(entry.record.current_activity.as_deref())
                    && entry.record.current_activity.as_deref() != Some(WAITING_ACTIVITY) =>
            {
                entry.record.current_activity = Some(WAITING_ACTIVITY.to_string());
                true
            }
            _ => false,
        }
    }

    /// `(name, execution handle)` for every running record.
    pub fn running_probes(&self) -> Vec<(String, Option<String>)> {
        let mut probes: Vec<(String, Option<String>)> = self
            .entries
            .values()
            .filter(|e| e.record.status == WorkflowStatus::Running)
            .map(|e| (e.record.workflow_name.clone(), e.record.execution_id.clone()))
            .collect();
        probes.sort();
        probes
    }

    /// All records, ordered by start time.
    pub fn snapshot(&self) -> Vec<WorkflowRecord> {
        let mut records: Vec<WorkflowRecord> =
            self.entries.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.workflow_name.cmp(&b.workflow_name))
        });
        records
    }

    pub fn snapshot_one(&self, name: &str) -> Option<WorkflowRecord> {
        self.entries.get(name).map(|e| e.record.clone())
    }

    pub fn records(&self) -> impl Iterator<Item = &WorkflowRecord> {
        self.entries.values().map(|e| &e.record)
    }

    /// Remove a record together with its step tracker.
    pub fn delete(&mut self, name: &str) -> Option<WorkflowRecord> {
        self.entries.remove(name).map(|e| e.record)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> HashSet<String> {
        self.entries.keys().cloned().collect()
    }

    /// Steps seen by the tracker of `name`, if the record exists.
    pub fn tracked_steps(&self, name: &str) -> Option<usize> {
        self.entries.get(name).map(|e| e.steps.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn record_mut(&mut self, name: &str, operation: &str) -> Option<&mut WorkflowRecord> {
        let key = self.resolve_key(name, operation)?;
        self.entries.get_mut(&key).map(|e| &mut e.record)
    }

    /// Exact match first, then a case-insensitive match (reporters do not
    /// always normalize case).
    fn resolve_key(&self, name: &str, operation: &str) -> Option<String> {
        if self.entries.contains_key(name) {
            return Some(name.to_string());
        }

        let lowered = name.to_lowercase();
        let mut candidates: Vec<&String> = self
            .entries
            .keys()
            .filter(|k| k.to_lowercase() == lowered)
            .collect();
        candidates.sort();

        match candidates.first() {
            Some(key) => {
                warn!(
                    workflow = %name,
                    matched = %key,
                    operation,
                    "Workflow not found, using case-insensitive match"
                );
                Some((*key).clone())
            }
            None => {
                warn!(
                    workflow = %name,
                    operation,
                    available = ?self.entries.keys().collect::<Vec<_>>(),
                    "Workflow not found"
                );
                None
            }
        }
    }
}

fn saturating_len(names: &[String]) -> u32 {
    u32::try_from(names.len()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_token_is_deterministic_uuid_v4() {
        let a = correlation_token("deploy-flow");
        let b = correlation_token("deploy-flow");
        assert_eq!(a, b);
        assert_ne!(a, correlation_token("other-flow"));

        let parsed = uuid::Uuid::parse_str(&a).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_eq!(&a[14..15], "4");
    }
}
