//! Parallel hook processes sharing one state directory.

use std::fs;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use stagehand::core::{dag, Stage, StageStatus};
use stagehand::orchestration::Controller;
use stagehand::state::{FileStateStore, PipelineEvent, StateStore};

use crate::fixtures::{report, TestHarness};

const SESSION: &str = "parallel";

/// Classify a review-loop refactor and get DEV through.
fn siblings_in_flight() -> TestHarness {
    let harness = TestHarness::review_loop();
    harness
        .controller
        .on_prompt(SESSION, "refactor the config loader")
        .unwrap();
    harness.run_stage(SESSION, "developer", "Done. Verdict: PASS");
    for capability in ["code-reviewer", "test-engineer"] {
        assert!(harness.controller.on_delegate(SESSION, capability, None).allow);
    }
    harness
}

/// Test: Sibling completions race without losing an update
/// Given REVIEW and TEST delegated in parallel
/// When both report back at the same moment from separate processes
/// Then both are completed and DOCS becomes ready
#[test]
fn test_sibling_reports_are_not_lost() {
    let harness = siblings_in_flight();
    let barrier = Barrier::new(2);

    thread::scope(|scope| {
        for capability in ["code-reviewer", "test-engineer"] {
            let controller = harness.sibling_process();
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                controller.on_stage_complete(SESSION, &report(capability, "Verdict: PASS"));
            });
        }
    });

    let state = harness.controller.status(SESSION).unwrap();
    assert_eq!(state.status(Stage::Review), Some(StageStatus::Completed));
    assert_eq!(state.status(Stage::Test), Some(StageStatus::Completed));
    assert!(state.active_stages.is_empty());
    assert_eq!(dag::awaiting_delegation(&state), vec![Stage::Docs]);

    let reports = harness
        .controller
        .store()
        .load_events(SESSION)
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e, PipelineEvent::StageReported { .. }))
        .count();
    assert_eq!(reports, 3);
}

/// Test: Many concurrent prompts leave a readable snapshot
/// Given eight processes classifying the same session at once
/// When they all finish
/// Then exactly one pipeline was started and the snapshot parses
#[test]
fn test_concurrent_classification_is_serialized() {
    let harness = TestHarness::new();
    let barrier = Barrier::new(8);

    let started = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let controller = harness.sibling_process();
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    controller.on_prompt(SESSION, "fix the crash on startup").is_some()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|started| *started)
            .count()
    });
    assert_eq!(started, 1);

    let contents = fs::read_to_string(harness.snapshot_path(SESSION)).unwrap();
    let state: stagehand::SessionPipelineState = serde_json::from_str(&contents).unwrap();
    assert_eq!(state.status(Stage::Dev), Some(StageStatus::Pending));
}

/// Test: A held lock fails open
/// Given another process holding the session lock
/// When a delegation arrives with a short lock timeout
/// Then it is allowed instead of hanging or blocking
#[test]
fn test_lock_timeout_fails_open() {
    let harness = TestHarness::review_loop();
    harness
        .controller
        .on_prompt(SESSION, "refactor the config loader")
        .unwrap();

    let lock = harness.temp_dir.path().join(format!("{}.lock", SESSION));
    fs::write(&lock, "").unwrap();

    let impatient = Controller::new(
        FileStateStore::new(harness.temp_dir.path()).with_lock_timeout(Duration::from_millis(50)),
        harness.controller.catalog().clone(),
        harness.controller.config().clone(),
    );
    // REVIEW is not ready; a locked-out delegation is let through anyway.
    assert!(impatient.on_delegate(SESSION, "code-reviewer", None).allow);
    assert!(lock.exists());

    fs::remove_file(&lock).unwrap();
    assert!(!harness.controller.on_delegate(SESSION, "code-reviewer", None).allow);
}

/// Test: A lock left by a crashed process is reclaimed
/// Given a lock file older than the stale age
/// When a prompt arrives
/// Then the lock is taken over and the prompt is classified
#[test]
fn test_stale_lock_is_reclaimed() {
    let harness = TestHarness::new();
    let lock = harness.temp_dir.path().join(format!("{}.lock", SESSION));
    fs::write(&lock, "").unwrap();
    thread::sleep(Duration::from_millis(30));

    let controller = Controller::new(
        FileStateStore::new(harness.temp_dir.path())
            .with_lock_timeout(Duration::from_secs(5))
            .with_stale_after(Duration::from_millis(10)),
        harness.controller.catalog().clone(),
        harness.controller.config().clone(),
    );
    assert!(controller.on_prompt(SESSION, "fix the crash on startup").is_some());
    assert!(!lock.exists());
}
