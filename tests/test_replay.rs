//! Tests for replaying JSON-lines event logs.

use flowpulse::cli::{FlowPulseConfig, aggregator_builder, replay_events};
use flowpulse::engine::types::WorkflowStatus;

const LOG: &str = r#"
# deploy pipeline
{"type": "start", "name": "deploy-flow", "total_steps": 2, "execution_id": "exec-9"}
{"type": "step", "name": "deploy-flow", "step": "build", "status": "running"}
{"type": "activity", "name": "deploy-flow", "step": "build", "text": "Running cargo build", "kind": "command"}
{"type": "step", "name": "deploy-flow", "step": "build", "status": "completed"}
{"type": "tokens", "name": "deploy-flow", "step": "build", "usage": {"total_tokens": 500, "cost": 0.1}}
{"type": "step", "name": "deploy-flow", "step": "test", "status": "failed"}
{"type": "step", "name": "deploy-flow", "step": "test", "status": "completed"}
{"type": "metrics", "name": "deploy-flow", "fields": {"current_model": "sonnet", "retry_attempts": 1}}
{"type": "end", "name": "deploy-flow", "result": {"success": true, "completed_names": ["build", "test"]}, "duration_ms": 4200}
{"type": "step", "name": "other", "step": "x", "status": "completed"}
"#;

#[test]
fn replay_builds_final_state() {
    let mut aggregator = aggregator_builder(&FlowPulseConfig::default()).build();
    let (applied, ignored) = replay_events(&mut aggregator, LOG).unwrap();

    assert_eq!(applied, 9);
    assert_eq!(ignored, 1);

    let records = aggregator.snapshot();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, WorkflowStatus::Completed);
    assert_eq!(record.completed_steps, 2);
    assert_eq!(record.failed_steps, 0);
    assert_eq!(record.success_rate, 100.0);
    assert_eq!(record.duration_ms, 4200);
    assert_eq!(record.total_tokens, 500);
    assert_eq!(record.current_model.as_deref(), Some("sonnet"));
    assert_eq!(record.retry_attempts, 1);
    assert_eq!(record.execution_id.as_deref(), Some("exec-9"));
}

#[test]
fn malformed_line_is_reported_with_its_number() {
    let mut aggregator = aggregator_builder(&FlowPulseConfig::default()).build();
    let log = "{\"type\": \"start\", \"name\": \"w\", \"total_steps\": 1}\nnot json\n";

    let err = replay_events(&mut aggregator, log).unwrap_err();
    assert!(err.to_string().contains("line 2"));
}
