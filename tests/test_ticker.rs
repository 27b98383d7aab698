//! Tests for the realtime ticker and process liveness handling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use flowpulse::engine::Aggregator;
use flowpulse::engine::clock::ManualClock;
use flowpulse::engine::store::WorkflowStore;
use flowpulse::engine::ticker::{ProbeOutcome, RealtimeTicker};
use flowpulse::engine::types::*;
use flowpulse::probes::{ProbeError, ProcessStatusProvider};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// Provider answering from a fixed table; missing handles are unknown.
#[derive(Default)]
struct FakeProvider {
    statuses: Mutex<HashMap<String, Result<ProcessStatus, String>>>,
    delay: Option<StdDuration>,
}

impl FakeProvider {
    fn set(&self, handle: &str, status: Result<ProcessStatus, String>) {
        self.statuses.lock().unwrap().insert(handle.to_string(), status);
    }
}

#[async_trait]
impl ProcessStatusProvider for FakeProvider {
    async fn status(&self, execution_handle: &str) -> Result<Option<ProcessStatus>, ProbeError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let answer = self.statuses.lock().unwrap().get(execution_handle).cloned();
        match answer {
            Some(Ok(status)) => Ok(Some(status)),
            Some(Err(message)) => Err(ProbeError::Unavailable(message)),
            None => Ok(None),
        }
    }
}

fn alive(sub_agent_alive: bool) -> ProcessStatus {
    ProcessStatus {
        running: true,
        pid: Some(4242),
        exit_code: None,
        sub_agent_alive,
    }
}

fn dead() -> ProcessStatus {
    ProcessStatus {
        running: false,
        pid: Some(4242),
        exit_code: Some(137),
        sub_agent_alive: false,
    }
}

#[tokio::test]
async fn probe_classifies_outcomes() {
    let provider = Arc::new(FakeProvider::default());
    provider.set("exec-a", Ok(alive(true)));
    provider.set("exec-b", Err("permission denied".into()));
    let ticker = RealtimeTicker::new(Some(provider), StdDuration::from_millis(250));

    let targets = vec![
        ("a".to_string(), Some("exec-a".to_string())),
        ("b".to_string(), Some("exec-b".to_string())),
        ("c".to_string(), Some("exec-c".to_string())),
        ("d".to_string(), None),
    ];
    let outcomes = ticker.probe(&targets).await;

    assert_eq!(outcomes["a"], ProbeOutcome::Reported(alive(true)));
    assert_eq!(outcomes["b"], ProbeOutcome::NoData);
    assert_eq!(outcomes["c"], ProbeOutcome::UnknownExecution);
    assert_eq!(outcomes["d"], ProbeOutcome::NoData);
}

#[tokio::test(start_paused = true)]
async fn slow_probe_times_out_as_no_data() {
    let provider = Arc::new(FakeProvider {
        delay: Some(StdDuration::from_secs(5)),
        ..FakeProvider::default()
    });
    provider.set("exec-a", Ok(dead()));
    let ticker = RealtimeTicker::new(Some(provider), StdDuration::from_millis(250));

    let outcomes = ticker
        .probe(&[("a".to_string(), Some("exec-a".to_string()))])
        .await;
    assert_eq!(outcomes["a"], ProbeOutcome::NoData);
}

#[tokio::test(start_paused = true)]
async fn hung_lookups_cost_one_timeout_per_tick() {
    let provider = Arc::new(FakeProvider {
        delay: Some(StdDuration::from_secs(3600)),
        ..FakeProvider::default()
    });
    let clock = Arc::new(ManualClock::new(t0()));
    let mut aggregator = Aggregator::builder()
        .clock(clock)
        .process_provider(provider)
        .probe_timeout(StdDuration::from_millis(250))
        .build();
    for i in 0..20 {
        aggregator.start(&format!("w{i}"), 1, Some(format!("exec-{i}")), None);
    }

    let started = tokio::time::Instant::now();
    let refreshed = aggregator.tick().await;
    let elapsed = started.elapsed();

    assert_eq!(refreshed, 20);
    assert!(elapsed >= StdDuration::from_millis(250));
    assert!(elapsed < StdDuration::from_millis(500), "tick took {elapsed:?}");
    assert!(
        aggregator
            .snapshot()
            .iter()
            .all(|r| r.status == WorkflowStatus::Running)
    );
}

#[test]
fn dead_process_fails_the_workflow() {
    let ticker = RealtimeTicker::new(None, StdDuration::from_millis(250));
    let mut store = WorkflowStore::new();
    store.start("w", 2, Some("exec-w".into()), None, t0());

    let outcomes = HashMap::from([("w".to_string(), ProbeOutcome::Reported(dead()))]);
    let events = ticker.apply(&mut store, &outcomes, t0() + Duration::seconds(3));

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChangeKind::End);
    let record = store.snapshot_one("w").unwrap();
    assert_eq!(record.status, WorkflowStatus::Failed);
    assert_eq!(record.duration_ms, 3_000);
    assert_eq!(record.process_status, Some(dead()));
}

#[test]
fn missing_sub_agent_shows_waiting_hint() {
    let ticker = RealtimeTicker::new(None, StdDuration::from_millis(250));
    let mut store = WorkflowStore::new();
    store.start("w", 1, Some("exec-w".into()), None, t0());

    let outcomes = HashMap::from([("w".to_string(), ProbeOutcome::Reported(alive(false)))]);
    let events = ticker.apply(&mut store, &outcomes, t0());

    assert_eq!(events[0].kind, ChangeKind::Metrics);
    let record = store.snapshot_one("w").unwrap();
    assert_eq!(record.status, WorkflowStatus::Running);
    assert_eq!(record.current_activity.as_deref(), Some(WAITING_ACTIVITY));
}

#[test]
fn unknown_execution_records_default_status() {
    let ticker = RealtimeTicker::new(None, StdDuration::from_millis(250));
    let mut store = WorkflowStore::new();
    store.start("w", 1, Some("exec-w".into()), None, t0());

    let outcomes = HashMap::from([("w".to_string(), ProbeOutcome::UnknownExecution)]);
    ticker.apply(&mut store, &outcomes, t0());

    let record = store.snapshot_one("w").unwrap();
    assert_eq!(record.status, WorkflowStatus::Running);
    assert_eq!(record.process_status, Some(ProcessStatus::default()));
}

#[test]
fn heartbeat_refreshes_duration_of_running_records_only() {
    let ticker = RealtimeTicker::new(None, StdDuration::from_millis(250));
    let mut store = WorkflowStore::new();
    store.start("running", 1, None, None, t0());
    store.start("done", 1, None, None, t0());
    store.end("done", &WorkflowResult::default(), None, t0());

    let events = ticker.apply(&mut store, &HashMap::new(), t0() + Duration::seconds(42));

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].workflow_name.as_deref(), Some("running"));
    assert_eq!(events[0].payload["metrics"]["duration_ms"], 42_000);
    assert_eq!(store.snapshot_one("running").unwrap().duration_ms, 42_000);
}

#[tokio::test]
async fn aggregator_tick_publishes_end_for_dead_worker() {
    let provider = Arc::new(FakeProvider::default());
    provider.set("exec-w", Ok(dead()));
    let clock = Arc::new(ManualClock::new(t0()));
    let mut aggregator = Aggregator::builder()
        .process_provider(provider)
        .clock(clock.clone())
        .build();

    aggregator.start("w", 1, Some("exec-w".into()), None);
    let mut sub = aggregator.subscribe();
    clock.advance(Duration::seconds(1));

    assert_eq!(aggregator.tick().await, 1);
    let kinds: Vec<ChangeKind> = sub.drain().iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![ChangeKind::Snapshot, ChangeKind::End]);

    // Finished records are no longer probed.
    assert_eq!(aggregator.tick().await, 0);
}
