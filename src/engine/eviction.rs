use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::store::WorkflowStore;
use crate::engine::types::{WorkflowRecord, WorkflowStatus};
use crate::probes::MemoryPressureSignal;
use crate::trackers::CompanionTracker;

/// Thresholds driving each eviction pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionPolicy {
    /// How long a finished record stays visible.
    pub grace_period: Duration,
    pub max_records: usize,
    /// Size the store is brought back to once it exceeds `max_records`.
    pub target_records: usize,
    /// Running records older than this are treated as abandoned.
    pub stale_running_after: Duration,
    pub pressure_high_water: f64,
    pub pressure_critical_water: f64,
    /// Under pressure, running records older than this are dropped too.
    pub pressure_running_after: Duration,
    /// Under critical pressure, only this many most recent records survive.
    pub pressure_keep_recent: usize,
    /// Per-workflow history length companion trackers are trimmed to.
    pub history_limit: usize,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::minutes(5),
            max_records: 20,
            target_records: 16,
            stale_running_after: Duration::hours(2),
            pressure_high_water: 80.0,
            pressure_critical_water: 90.0,
            pressure_running_after: Duration::hours(1),
            pressure_keep_recent: 5,
            history_limit: 25,
        }
    }
}

impl EvictionPolicy {
    /// Default shrink target for a given capacity: 80 % of `max_records`.
    pub fn default_target(max_records: usize) -> usize {
        max_records * 4 / 5
    }

    /// Keep `target_records` strictly below `max_records`.
    pub fn normalized(mut self) -> Self {
        self.target_records = self.target_records.min(self.max_records.saturating_sub(1));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionReason {
    Expired,
    Capacity,
    StaleRunning,
    MemoryPressure,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::Expired => write!(f, "expired"),
            EvictionReason::Capacity => write!(f, "capacity"),
            EvictionReason::StaleRunning => write!(f, "stale-running"),
            EvictionReason::MemoryPressure => write!(f, "memory-pressure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Eviction {
    pub workflow_name: String,
    pub reason: EvictionReason,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub orphans_cleared: usize,
    pub evicted: Vec<Eviction>,
    pub trimmed: usize,
    /// Pressure reading, when a signal is configured and answered.
    pub pressure: Option<f64>,
    /// Collaborator calls that failed and were skipped.
    pub skipped: usize,
}

impl SweepReport {
    pub fn evicted_names(&self) -> Vec<&str> {
        self.evicted.iter().map(|e| e.workflow_name.as_str()).collect()
    }

    pub fn count(&self, reason: EvictionReason) -> usize {
        self.evicted.iter().filter(|e| e.reason == reason).count()
    }
}

/// Applies the eviction policy to a store and its companion trackers.
pub struct EvictionScheduler {
    policy: EvictionPolicy,
}

impl EvictionScheduler {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            policy: policy.normalized(),
        }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// One full sweep. Collaborator failures are logged and skipped; the
    /// sweep always runs every pass.
    pub fn sweep(
        &self,
        store: &mut WorkflowStore,
        trackers: &[Arc<dyn CompanionTracker>],
        memory: Option<&dyn MemoryPressureSignal>,
        now: DateTime<Utc>,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        self.clear_orphans(store, trackers, &mut report);
        self.evict_expired(store, trackers, now, &mut report);
        self.evict_over_capacity(store, trackers, &mut report);
        self.evict_stale_running(store, trackers, now, &mut report);
        if let Some(signal) = memory {
            self.relieve_pressure(store, trackers, signal, now, &mut report);
        }
        self.trim_histories(trackers, &mut report);

        if !report.evicted.is_empty() || report.orphans_cleared > 0 || report.skipped > 0 {
            info!(
                evicted = report.evicted.len(),
                orphans = report.orphans_cleared,
                trimmed = report.trimmed,
                skipped = report.skipped,
                remaining = store.len(),
                "Eviction sweep finished"
            );
        } else {
            debug!(remaining = store.len(), "Eviction sweep found nothing to do");
        }

        report
    }

    /// Capacity pass on its own, run right after a record is inserted.
    pub fn enforce_capacity(
        &self,
        store: &mut WorkflowStore,
        trackers: &[Arc<dyn CompanionTracker>],
    ) -> SweepReport {
        let mut report = SweepReport::default();
        self.evict_over_capacity(store, trackers, &mut report);
        report
    }

    /// Drop tracker state for workflows the store no longer knows.
    fn clear_orphans(
        &self,
        store: &WorkflowStore,
        trackers: &[Arc<dyn CompanionTracker>],
        report: &mut SweepReport,
    ) {
        for tracker in trackers {
            let names = match tracker.tracked_workflow_names() {
                Ok(names) => names,
                Err(e) => {
                    warn!(tracker = tracker.name(), error = %e, "Skipping orphan cleanup for tracker");
                    report.skipped += 1;
                    continue;
                }
            };

            for name in names.iter().filter(|n| !store.contains(n)) {
                match tracker.clear(name) {
                    Ok(()) => report.orphans_cleared += 1,
                    Err(e) => {
                        warn!(tracker = tracker.name(), workflow = %name, error = %e, "Failed to clear orphaned state");
                        report.skipped += 1;
                    }
                }
            }
        }
    }

    fn evict_expired(
        &self,
        store: &mut WorkflowStore,
        trackers: &[Arc<dyn CompanionTracker>],
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let expired = select(store, |r| {
            r.status.is_terminal()
                && r.end_time
                    .is_some_and(|end| now - end > self.policy.grace_period)
        });
        for name in expired {
            evict(store, trackers, &name, EvictionReason::Expired, report);
        }
    }

    /// Oldest first, finished before running, down to `target_records`.
    fn evict_over_capacity(
        &self,
        store: &mut WorkflowStore,
        trackers: &[Arc<dyn CompanionTracker>],
        report: &mut SweepReport,
    ) {
        if store.len() <= self.policy.max_records {
            return;
        }

        let mut candidates: Vec<&WorkflowRecord> = store.records().collect();
        candidates.sort_by(|a, b| {
            let a_running = a.status == WorkflowStatus::Running;
            let b_running = b.status == WorkflowStatus::Running;
            a_running
                .cmp(&b_running)
                .then_with(|| a.last_activity_at().cmp(&b.last_activity_at()))
                .then_with(|| a.workflow_name.cmp(&b.workflow_name))
        });

        let excess = store.len() - self.policy.target_records;
        let victims: Vec<String> = candidates
            .into_iter()
            .take(excess)
            .map(|r| r.workflow_name.clone())
            .collect();

        for name in victims {
            evict(store, trackers, &name, EvictionReason::Capacity, report);
        }
    }

    fn evict_stale_running(
        &self,
        store: &mut WorkflowStore,
        trackers: &[Arc<dyn CompanionTracker>],
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let stale = select(store, |r| {
            r.status == WorkflowStatus::Running && now - r.start_time > self.policy.stale_running_after
        });
        for name in stale {
            evict(store, trackers, &name, EvictionReason::StaleRunning, report);
        }
    }

    fn relieve_pressure(
        &self,
        store: &mut WorkflowStore,
        trackers: &[Arc<dyn CompanionTracker>],
        signal: &dyn MemoryPressureSignal,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let pressure = match signal.current_pressure() {
            Ok(p) => p.value(),
            Err(e) => {
                warn!(error = %e, "Memory pressure unavailable, skipping pressure eviction");
                report.skipped += 1;
                return;
            }
        };
        report.pressure = Some(pressure);

        if pressure <= self.policy.pressure_high_water {
            return;
        }

        warn!(pressure, remaining = store.len(), "High memory pressure, evicting aggressively");
        self.clear_orphans(store, trackers, report);

        let victims = select(store, |r| {
            r.status.is_terminal()
                || (r.status == WorkflowStatus::Running
                    && now - r.start_time > self.policy.pressure_running_after)
        });
        for name in victims {
            evict(store, trackers, &name, EvictionReason::MemoryPressure, report);
        }

        if pressure > self.policy.pressure_critical_water
            && store.len() > self.policy.pressure_keep_recent
        {
            let mut records: Vec<&WorkflowRecord> = store.records().collect();
            records.sort_by(|a, b| {
                b.last_activity_at()
                    .cmp(&a.last_activity_at())
                    .then_with(|| a.workflow_name.cmp(&b.workflow_name))
            });
            let victims: Vec<String> = records
                .into_iter()
                .skip(self.policy.pressure_keep_recent)
                .map(|r| r.workflow_name.clone())
                .collect();
            for name in victims {
                evict(store, trackers, &name, EvictionReason::MemoryPressure, report);
            }
        }

        signal.reclaim();
    }

    fn trim_histories(&self, trackers: &[Arc<dyn CompanionTracker>], report: &mut SweepReport) {
        for tracker in trackers {
            match tracker.trim_to(self.policy.history_limit) {
                Ok(dropped) => report.trimmed += dropped,
                Err(e) => {
                    warn!(tracker = tracker.name(), error = %e, "Failed to trim tracker history");
                    report.skipped += 1;
                }
            }
        }
    }
}

fn select(store: &WorkflowStore, predicate: impl Fn(&WorkflowRecord) -> bool) -> Vec<String> {
    let mut names: Vec<String> = store
        .records()
        .filter(|r| predicate(r))
        .map(|r| r.workflow_name.clone())
        .collect();
    names.sort();
    names
}

/// Remove the record and every companion tracker's state for it.
fn evict(
    store: &mut WorkflowStore,
    trackers: &[Arc<dyn CompanionTracker>],
    name: &str,
    reason: EvictionReason,
    report: &mut SweepReport,
) {
    if store.delete(name).is_none() {
        return;
    }

    for tracker in trackers {
        if let Err(e) = tracker.clear(name) {
            warn!(tracker = tracker.name(), workflow = %name, error = %e, "Failed to clear tracker state for evicted workflow");
            report.skipped += 1;
        }
    }

    debug!(workflow = %name, reason = %reason, "Evicted workflow");
    report.evicted.push(Eviction {
        workflow_name: name.to_string(),
        reason,
    });
}
