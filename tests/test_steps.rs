//! Tests for step reconciliation.

use flowpulse::engine::steps::{StepStateTracker, TallyDelta};
use flowpulse::engine::types::{StepState, StepStatus};

fn tally(tracker: &mut StepStateTracker, reports: &[(&str, StepStatus)]) -> (u32, u32) {
    let (mut completed, mut failed) = (0, 0);
    for (step, status) in reports {
        tracker.report(step, *status).apply_to(&mut completed, &mut failed);
    }
    (completed, failed)
}

#[test]
fn running_then_completed_counts_once() {
    let mut tracker = StepStateTracker::new();
    assert_eq!(tracker.report("build", StepStatus::Running), TallyDelta::ZERO);
    assert_eq!(
        tracker.report("build", StepStatus::Completed),
        TallyDelta {
            completed: 1,
            failed: 0
        }
    );
    assert_eq!(tracker.state("build"), StepState::Completed);
}

#[test]
fn repeated_terminal_report_is_idempotent() {
    let mut tracker = StepStateTracker::new();
    let (completed, failed) = tally(
        &mut tracker,
        &[
            ("build", StepStatus::Completed),
            ("build", StepStatus::Completed),
            ("build", StepStatus::Completed),
        ],
    );
    assert_eq!((completed, failed), (1, 0));
}

#[test]
fn failed_to_completed_moves_the_count() {
    let mut tracker = StepStateTracker::new();
    tracker.report("test", StepStatus::Failed);
    let delta = tracker.report("test", StepStatus::Completed);
    assert_eq!(
        delta,
        TallyDelta {
            completed: 1,
            failed: -1
        }
    );

    let mut tracker = StepStateTracker::new();
    let (completed, failed) = tally(
        &mut tracker,
        &[
            ("test", StepStatus::Completed),
            ("test", StepStatus::Failed),
        ],
    );
    assert_eq!((completed, failed), (0, 1));
}

#[test]
fn running_after_terminal_is_ignored() {
    let mut tracker = StepStateTracker::new();
    tracker.report("deploy", StepStatus::Completed);
    assert!(tracker.report("deploy", StepStatus::Running).is_zero());
    assert_eq!(tracker.state("deploy"), StepState::Completed);
}

#[test]
fn deploy_flow_sequence() {
    let mut tracker = StepStateTracker::new();
    let (completed, failed) = tally(
        &mut tracker,
        &[
            ("build", StepStatus::Running),
            ("build", StepStatus::Completed),
            ("test", StepStatus::Running),
            ("test", StepStatus::Failed),
            ("test", StepStatus::Completed),
            ("build", StepStatus::Completed),
        ],
    );
    assert_eq!((completed, failed), (2, 0));
    assert_eq!(tracker.len(), 2);
}

#[test]
fn tallies_never_go_negative() {
    let mut completed = 0;
    let mut failed = 0;
    TallyDelta {
        completed: -1,
        failed: -3,
    }
    .apply_to(&mut completed, &mut failed);
    assert_eq!((completed, failed), (0, 0));
}

#[test]
fn tallies_match_final_step_states() {
    // However reports interleave, counts equal the number of steps in each
    // terminal state.
    let mut tracker = StepStateTracker::new();
    let reports = [
        ("a", StepStatus::Failed),
        ("b", StepStatus::Completed),
        ("a", StepStatus::Completed),
        ("c", StepStatus::Running),
        ("b", StepStatus::Failed),
        ("a", StepStatus::Failed),
        ("d", StepStatus::Completed),
        ("c", StepStatus::Failed),
        ("d", StepStatus::Completed),
    ];
    let (completed, failed) = tally(&mut tracker, &reports);

    let states: Vec<StepState> = ["a", "b", "c", "d"].iter().map(|s| tracker.state(s)).collect();
    let expected_completed = states.iter().filter(|s| **s == StepState::Completed).count() as u32;
    let expected_failed = states.iter().filter(|s| **s == StepState::Failed).count() as u32;
    assert_eq!((completed, failed), (expected_completed, expected_failed));
    assert_eq!((completed, failed), (1, 3));
}
