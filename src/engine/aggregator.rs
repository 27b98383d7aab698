use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::engine::clock::{Clock, SystemClock};
use crate::engine::eviction::{EvictionPolicy, EvictionScheduler, SweepReport};
use crate::engine::hub::{BroadcastHub, PublishReport, SubscriberId, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
use crate::engine::store::WorkflowStore;
use crate::engine::ticker::{DEFAULT_PROBE_TIMEOUT, RealtimeTicker};
use crate::engine::types::*;
use crate::probes::{MemoryPressureSignal, ProcessStatusProvider};
use crate::trackers::{ActivityKind, ActivityLog, CompanionTracker, TokenLedger};

/// The telemetry core: record store, step reconciliation, fan-out, eviction
/// and the realtime refresh, driven from one logical event loop.
///
/// All methods take `&mut self`; whoever owns the aggregator serializes
/// access (see [`crate::engine::service`]).
pub struct Aggregator {
    store: WorkflowStore,
    hub: BroadcastHub,
    eviction: EvictionScheduler,
    ticker: RealtimeTicker,
    trackers: Vec<Arc<dyn CompanionTracker>>,
    activity_log: Option<Arc<ActivityLog>>,
    token_ledger: Option<Arc<TokenLedger>>,
    memory: Option<Arc<dyn MemoryPressureSignal>>,
    clock: Arc<dyn Clock>,
}

/// Builder for [`Aggregator`]. Every collaborator is optional.
pub struct AggregatorBuilder {
    policy: EvictionPolicy,
    subscriber_buffer: usize,
    probe_timeout: Duration,
    process_provider: Option<Arc<dyn ProcessStatusProvider>>,
    memory: Option<Arc<dyn MemoryPressureSignal>>,
    clock: Arc<dyn Clock>,
    trackers: Vec<Arc<dyn CompanionTracker>>,
    activity_log: Option<Arc<ActivityLog>>,
    token_ledger: Option<Arc<TokenLedger>>,
}

impl Default for AggregatorBuilder {
    fn default() -> Self {
        Self {
            policy: EvictionPolicy::default(),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            process_provider: None,
            memory: None,
            clock: Arc::new(SystemClock),
            trackers: Vec::new(),
            activity_log: None,
            token_ledger: None,
        }
    }
}

impl AggregatorBuilder {
    pub fn policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn subscriber_buffer(mut self, buffer: usize) -> Self {
        self.subscriber_buffer = buffer;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn process_provider(mut self, provider: Arc<dyn ProcessStatusProvider>) -> Self {
        self.process_provider = Some(provider);
        self
    }

    pub fn memory_signal(mut self, signal: Arc<dyn MemoryPressureSignal>) -> Self {
        self.memory = Some(signal);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a companion tracker for orphan cleanup, eviction and trimming.
    pub fn tracker(mut self, tracker: Arc<dyn CompanionTracker>) -> Self {
        self.trackers.push(tracker);
        self
    }

    /// Activity notes are also written to this log; it is registered as a tracker.
    pub fn activity_log(mut self, log: Arc<ActivityLog>) -> Self {
        self.trackers.push(log.clone());
        self.activity_log = Some(log);
        self
    }

    /// Token samples are also written to this ledger; it is registered as a tracker.
    pub fn token_ledger(mut self, ledger: Arc<TokenLedger>) -> Self {
        self.trackers.push(ledger.clone());
        self.token_ledger = Some(ledger);
        self
    }

    pub fn build(self) -> Aggregator {
        Aggregator {
            store: WorkflowStore::new(),
            hub: BroadcastHub::new(self.subscriber_buffer),
            eviction: EvictionScheduler::new(self.policy),
            ticker: RealtimeTicker::new(self.process_provider, self.probe_timeout),
            trackers: self.trackers,
            activity_log: self.activity_log,
            token_ledger: self.token_ledger,
            memory: self.memory,
            clock: self.clock,
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Aggregator {
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn start(
        &mut self,
        name: &str,
        total_steps: u32,
        execution_id: Option<String>,
        correlation_seed: Option<&str>,
    ) -> WorkflowHandle {
        let now = self.now();
        let record = self
            .store
            .start(name, total_steps, execution_id, correlation_seed, now);
        self.hub
            .publish(ChangeEvent::for_record(ChangeKind::Start, &record, now));

        let report = self.eviction.enforce_capacity(&mut self.store, &self.trackers);
        self.publish_evictions(&report, now);

        WorkflowHandle {
            workflow_name: record.workflow_name,
            execution_id: record.execution_id,
            correlation_token: record.correlation_token.unwrap_or_default(),
        }
    }

    pub fn step_update(&mut self, name: &str, step: &str, status: StepStatus) -> Option<WorkflowRecord> {
        let now = self.now();
        let record = self.store.step_update(name, step, status, now)?;
        self.hub.publish(ChangeEvent::new(
            ChangeKind::StepUpdate,
            Some(&record.workflow_name),
            serde_json::json!({ "step": step, "status": status, "metrics": record }),
            now,
        ));
        Some(record)
    }

    pub fn patch_metrics(&mut self, name: &str, patch: MetricsPatch) -> Option<WorkflowRecord> {
        let now = self.now();
        let record = self.store.patch_metrics(name, patch)?;
        self.hub
            .publish(ChangeEvent::for_record(ChangeKind::Metrics, &record, now));
        Some(record)
    }

    pub fn record_activity(
        &mut self,
        name: &str,
        step: Option<&str>,
        text: &str,
        kind: ActivityKind,
    ) -> Option<WorkflowRecord> {
        let now = self.now();
        let record = self.store.record_activity(name, text)?;

        if let Some(log) = &self.activity_log
            && let Err(e) = log.record(&record.workflow_name, step, kind, text, now)
        {
            warn!(workflow = %record.workflow_name, error = %e, "Failed to record activity");
        }

        self.hub.publish(ChangeEvent::new(
            ChangeKind::Activity,
            Some(&record.workflow_name),
            serde_json::json!({ "activity": text, "kind": kind, "step": step }),
            now,
        ));
        Some(record)
    }

    pub fn record_token_usage(&mut self, name: &str, step: &str, usage: &TokenUsage) -> Option<WorkflowRecord> {
        let now = self.now();
        let record = self.store.record_token_usage(name, step, usage)?;

        if let Some(ledger) = &self.token_ledger
            && let Err(e) = ledger.record(&record.workflow_name, step, usage, now)
        {
            warn!(workflow = %record.workflow_name, error = %e, "Failed to record token usage");
        }

        self.hub.publish(ChangeEvent::new(
            ChangeKind::ResourceUpdate,
            Some(&record.workflow_name),
            serde_json::json!({ "step": step, "usage": usage, "metrics": record }),
            now,
        ));
        Some(record)
    }

    /// Close a workflow. `duration` overrides the elapsed time when given.
    pub fn end(
        &mut self,
        name: &str,
        result: &WorkflowResult,
        duration: Option<chrono::Duration>,
    ) -> Option<WorkflowRecord> {
        let now = self.now();
        let outcome = self.store.end(name, result, duration, now)?;
        self.hub.publish(ChangeEvent::new(
            ChangeKind::End,
            Some(&outcome.record.workflow_name),
            serde_json::json!({
                "metrics": outcome.record,
                "result": result,
                "drift": outcome.drift,
            }),
            now,
        ));
        Some(outcome.record)
    }

    /// Apply one inbound event. Returns false when it referenced an unknown
    /// workflow.
    pub fn apply(&mut self, event: LifecycleEvent) -> bool {
        match event {
            LifecycleEvent::Start {
                name,
                total_steps,
                execution_id,
                correlation_seed,
            } => {
                self.start(&name, total_steps, execution_id, correlation_seed.as_deref());
                true
            }
            LifecycleEvent::Step { name, step, status } => {
                self.step_update(&name, &step, status).is_some()
            }
            LifecycleEvent::Activity {
                name,
                step,
                text,
                kind,
            } => {
                let kind = kind
                    .as_deref()
                    .and_then(|k| k.parse().ok())
                    .unwrap_or_default();
                self.record_activity(&name, step.as_deref(), &text, kind)
                    .is_some()
            }
            LifecycleEvent::Tokens { name, step, usage } => {
                self.record_token_usage(&name, &step, &usage).is_some()
            }
            LifecycleEvent::Metrics { name, fields } => self.patch_metrics(&name, fields).is_some(),
            LifecycleEvent::End {
                name,
                result,
                duration_ms,
            } => {
                let duration = duration_ms.and_then(|ms| {
                    let d = chrono::Duration::try_milliseconds(ms);
                    if d.is_none() {
                        warn!(workflow = %name, duration_ms = ms, "Reported duration out of range; ignoring");
                    }
                    d
                });
                self.end(&name, &result, duration).is_some()
            }
        }
    }

    pub fn snapshot(&self) -> Vec<WorkflowRecord> {
        self.store.snapshot()
    }

    pub fn snapshot_one(&self, name: &str) -> Option<WorkflowRecord> {
        self.store.snapshot_one(name)
    }

    /// Remove a workflow and its companion state right away.
    pub fn delete(&mut self, name: &str) -> bool {
        if self.store.delete(name).is_none() {
            return false;
        }
        for tracker in &self.trackers {
            if let Err(e) = tracker.clear(name) {
                warn!(tracker = tracker.name(), workflow = %name, error = %e, "Failed to clear tracker state");
            }
        }
        let now = self.now();
        self.hub.publish(ChangeEvent::new(
            ChangeKind::Evicted,
            Some(name),
            serde_json::json!({ "reason": "deleted" }),
            now,
        ));
        true
    }

    pub fn subscribe(&mut self) -> Subscription {
        let now = self.now();
        let snapshot = ChangeEvent::snapshot(&self.store.snapshot(), now);
        self.hub.subscribe(snapshot)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn publish(&mut self, event: ChangeEvent) -> PublishReport {
        self.hub.publish(event)
    }

    /// One eviction sweep; evicted workflows are announced to subscribers.
    pub fn sweep(&mut self) -> SweepReport {
        let now = self.now();
        let report = self.eviction.sweep(
            &mut self.store,
            &self.trackers,
            self.memory.as_deref(),
            now,
        );
        self.publish_evictions(&report, now);
        report
    }

    /// Liveness pass over subscribers.
    pub fn sweep_subscribers(&mut self) -> usize {
        self.hub.sweep_closed()
    }

    /// One realtime tick: probe running workers, refresh derived fields and
    /// publish a heartbeat per running record. Returns the events published.
    pub async fn tick(&mut self) -> usize {
        let targets = self.store.running_probes();
        if targets.is_empty() {
            return 0;
        }
        let outcomes = self.ticker.probe(&targets).await;
        let now = self.now();
        let events = self.ticker.apply(&mut self.store, &outcomes, now);
        let count = events.len();
        for event in events {
            self.hub.publish(event);
        }
        count
    }

    /// Close every subscriber and drop all records. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        let closed = self.hub.close_all();
        let records = self.store.len();
        self.store.clear();
        if closed > 0 || records > 0 {
            info!(subscribers = closed, records, "Aggregator shut down");
        }
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn policy(&self) -> &EvictionPolicy {
        self.eviction.policy()
    }

    pub fn trackers(&self) -> &[Arc<dyn CompanionTracker>] {
        &self.trackers
    }

    fn publish_evictions(&mut self, report: &SweepReport, now: DateTime<Utc>) {
        for eviction in &report.evicted {
            self.hub.publish(ChangeEvent::new(
                ChangeKind::Evicted,
                Some(&eviction.workflow_name),
                serde_json::json!({ "reason": eviction.reason }),
                now,
            ));
        }
    }
}
