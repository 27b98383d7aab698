//! Tests for change-event fan-out.

use chrono::Utc;
use serde_json::json;

use flowpulse::engine::hub::BroadcastHub;
use flowpulse::engine::types::{ChangeEvent, ChangeKind};

fn event(kind: ChangeKind, name: &str) -> ChangeEvent {
    ChangeEvent::new(kind, Some(name), json!({}), Utc::now())
}

fn snapshot() -> ChangeEvent {
    ChangeEvent::snapshot(&[], Utc::now())
}

#[test]
fn subscriber_gets_snapshot_first() {
    let mut hub = BroadcastHub::new(8);
    let mut sub = hub.subscribe(snapshot());
    hub.publish(event(ChangeKind::Start, "w"));

    let events = sub.drain();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, ChangeKind::Snapshot);
    assert_eq!(events[1].kind, ChangeKind::Start);
}

#[test]
fn closed_subscriber_is_removed_during_publish() {
    let mut hub = BroadcastHub::new(8);
    let mut one = hub.subscribe(snapshot());
    let two = hub.subscribe(snapshot());
    let mut three = hub.subscribe(snapshot());
    let two_id = two.id();
    drop(two);

    let report = hub.publish(event(ChangeKind::StepUpdate, "w"));
    assert_eq!(report.delivered, 2);
    assert_eq!(report.removed, 1);
    assert!(!hub.contains(two_id));
    assert_eq!(hub.len(), 2);

    for sub in [&mut one, &mut three] {
        let kinds: Vec<ChangeKind> = sub.drain().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Snapshot, ChangeKind::StepUpdate]);
    }
}

#[test]
fn events_arrive_in_publish_order() {
    let mut hub = BroadcastHub::new(16);
    let mut sub = hub.subscribe(snapshot());
    for name in ["a", "b", "c", "d"] {
        hub.publish(event(ChangeKind::Metrics, name));
    }

    let names: Vec<String> = sub
        .drain()
        .into_iter()
        .skip(1)
        .filter_map(|e| e.workflow_name.clone())
        .collect();
    assert_eq!(names, vec!["a", "b", "c", "d"]);
}

#[test]
fn slow_subscriber_lags_without_blocking_others() {
    let mut hub = BroadcastHub::new(2);
    let mut slow = hub.subscribe(snapshot());
    let mut fast = hub.subscribe(snapshot());
    let slow_id = slow.id();

    // Slow queue holds the snapshot plus one event.
    hub.publish(event(ChangeKind::Metrics, "1"));
    fast.drain();
    let report = hub.publish(event(ChangeKind::Metrics, "2"));

    assert_eq!(report.delivered, 1);
    assert_eq!(report.lagged, 1);
    assert_eq!(hub.missed(slow_id), Some(1));
    assert!(hub.contains(slow_id));
    assert_eq!(fast.drain().len(), 1);
    assert_eq!(slow.drain().len(), 2);
}

#[test]
fn liveness_sweep_drops_closed_subscribers() {
    let mut hub = BroadcastHub::new(4);
    let keep = hub.subscribe(snapshot());
    let gone = hub.subscribe(snapshot());
    drop(gone);

    assert_eq!(hub.sweep_closed(), 1);
    assert_eq!(hub.len(), 1);
    assert!(hub.contains(keep.id()));
    assert_eq!(hub.sweep_closed(), 0);
}

#[test]
fn unsubscribe_stops_delivery() {
    let mut hub = BroadcastHub::new(4);
    let mut sub = hub.subscribe(snapshot());
    assert!(hub.unsubscribe(sub.id()));
    assert!(!hub.unsubscribe(sub.id()));

    let report = hub.publish(event(ChangeKind::End, "w"));
    assert_eq!(report.delivered, 0);
    assert_eq!(sub.drain().len(), 1);
}

#[tokio::test]
async fn close_all_ends_streams_after_queued_events() {
    let mut hub = BroadcastHub::new(4);
    let mut sub = hub.subscribe(snapshot());
    hub.publish(event(ChangeKind::End, "w"));

    assert_eq!(hub.close_all(), 1);
    assert!(hub.is_empty());

    assert_eq!(sub.recv().await.unwrap().kind, ChangeKind::Snapshot);
    assert_eq!(sub.recv().await.unwrap().kind, ChangeKind::End);
    assert!(sub.recv().await.is_none());
}
