//! End-to-end pipeline scenarios through the controller.

use stagehand::core::{Stage, StageStatus, Verdict};
use stagehand::pipeline::TaskKind;
use stagehand::state::StateStore;

use crate::fixtures::{report, TestHarness};

const SESSION: &str = "scenario";

fn start_review_loop() -> TestHarness {
    let harness = TestHarness::review_loop();
    let directive = harness
        .controller
        .on_prompt(SESSION, "[pipeline:review-loop] tidy the parser")
        .expect("classification directive");
    assert!(directive.contains("review-loop"));
    harness
}

/// Test: Delegation before dependencies complete
/// Given DEV is pending
/// When REVIEW is delegated
/// Then the delegation is blocked and the message names DEV
#[test]
fn test_delegate_blocked_until_dev_completes() {
    let harness = start_review_loop();

    let outcome = harness.controller.on_delegate(SESSION, "code-reviewer", None);
    assert!(!outcome.allow);
    assert!(outcome.message.unwrap().contains("DEV"));
}

/// Test: Sibling stages open together
/// Given DEV completed
/// When REVIEW and TEST are delegated
/// Then both are allowed and both are in flight
#[test]
fn test_siblings_allowed_after_dev() {
    let harness = start_review_loop();
    harness.run_stage(SESSION, "developer", "Implementation done");

    assert!(harness.controller.on_delegate(SESSION, "code-reviewer", None).allow);
    assert!(harness.controller.on_delegate(SESSION, "test-engineer", None).allow);

    let state = harness.controller.status(SESSION).unwrap();
    assert_eq!(state.active_stages, vec![Stage::Review, Stage::Test]);
    assert!(state.delegation_window_open);
}

/// Test: Join waits on every parent
/// Given DEV and REVIEW completed and TEST pending
/// When DOCS is delegated
/// Then it is blocked and the message names TEST
#[test]
fn test_docs_waits_on_test() {
    let harness = start_review_loop();
    harness.run_stage(SESSION, "developer", "done");
    harness.run_stage(SESSION, "code-reviewer", "Verdict: PASS");

    let outcome = harness.controller.on_delegate(SESSION, "tech-writer", None);
    assert!(!outcome.allow);
    let message = outcome.message.unwrap();
    assert!(message.contains("TEST"));
    assert!(!message.contains("waiting on REVIEW"));
}

/// Test: Skipped dependency satisfies readiness
/// Given DEV completed, REVIEW skipped and TEST completed
/// When DOCS is delegated
/// Then it is allowed
#[test]
fn test_skipped_review_unblocks_docs() {
    let harness = start_review_loop();
    harness.run_stage(SESSION, "developer", "done");
    harness
        .controller
        .store()
        .transaction(SESSION, |slot| {
            let state = slot.as_mut().unwrap();
            state.record_mut(Stage::Review).status = StageStatus::Skipped;
        })
        .unwrap();
    harness.run_stage(SESSION, "test-engineer", "All tests passed");

    assert!(harness.controller.on_delegate(SESSION, "tech-writer", None).allow);
}

/// Test: Review failure rolls back DEV with a bounded retry count
/// Given REVIEW keeps reporting FAIL
/// When three rollback cycles have run
/// Then the fourth failure advances past REVIEW with a warning
#[test]
fn test_review_failure_rollback_is_bounded() {
    let harness = start_review_loop();

    for cycle in 1..=3 {
        harness.run_stage(SESSION, "developer", "done");
        let message = harness
            .run_stage(SESSION, "code-reviewer", "Verdict: FAIL\nSeverity: high")
            .unwrap();
        assert!(message.contains("DEV reopened"), "cycle {cycle}: {message}");

        let state = harness.controller.status(SESSION).unwrap();
        assert_eq!(state.status(Stage::Dev), Some(StageStatus::Pending));
        assert_eq!(state.retries(Stage::Dev), cycle);
    }

    harness.run_stage(SESSION, "developer", "done");
    let message = harness
        .run_stage(SESSION, "code-reviewer", "Verdict: FAIL")
        .unwrap();
    assert!(message.contains("advancing anyway"));

    let state = harness.controller.status(SESSION).unwrap();
    assert_eq!(state.retries(Stage::Dev), 3);
    assert_eq!(state.status(Stage::Review), Some(StageStatus::Completed));
    assert_eq!(state.record(Stage::Review).unwrap().verdict, Some(Verdict::Fail));

    harness.run_stage(SESSION, "test-engineer", "All tests passed");
    let message = harness.run_stage(SESSION, "tech-writer", "Docs updated").unwrap();
    assert!(message.contains("complete with failing verdicts in: REVIEW"));
}

/// Test: Upgrade carries finished work
/// Given a bugfix pipeline whose DEV and TEST completed
/// When the task is upgraded to feature
/// Then DEV and TEST are skipped, the rest pending, and history has one entry
#[test]
fn test_bugfix_upgraded_to_feature() {
    let harness = TestHarness::new();
    harness
        .controller
        .on_prompt(SESSION, "fix the crash when saving drafts")
        .unwrap();
    harness.run_stage(SESSION, "developer", "done");
    harness.run_stage(SESSION, "test-engineer", "All tests passed");

    let directive = harness
        .controller
        .on_prompt(SESSION, "[pipeline:feature] and add draft sharing")
        .unwrap();
    assert!(directive.contains("upgraded from bugfix to feature"));

    let state = harness.controller.status(SESSION).unwrap();
    assert_eq!(state.task_kind(), Some(TaskKind::Feature));
    assert_eq!(state.status(Stage::Dev), Some(StageStatus::Skipped));
    assert_eq!(state.status(Stage::Test), Some(StageStatus::Skipped));
    for stage in [Stage::Plan, Stage::Arch, Stage::Review, Stage::Qa, Stage::E2e, Stage::Docs] {
        assert_eq!(state.status(stage), Some(StageStatus::Pending), "{stage}");
    }
    let history = &state.classification.as_ref().unwrap().history;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from, TaskKind::Bugfix);
    assert_eq!(history[0].to, TaskKind::Feature);
}

/// Test: A full feature run
/// Given a feature pipeline
/// When every stage is delegated in order and passes
/// Then the pipeline completes with all stages passed and asking the user is allowed again
#[test]
fn test_feature_pipeline_runs_to_completion() {
    let harness = TestHarness::new();
    harness
        .controller
        .on_prompt(SESSION, "implement team invitations")
        .unwrap();

    let order = [
        "planner",
        "architect",
        "developer",
        "code-reviewer",
        "test-engineer",
        "qa-engineer",
        "e2e-testing",
    ];
    for capability in order {
        let message = harness.run_stage(SESSION, capability, "Verdict: PASS").unwrap();
        assert!(!message.contains("complete:"), "{capability}: {message}");
    }
    let message = harness.run_stage(SESSION, "tech-writer", "Verdict: PASS").unwrap();
    assert!(message.contains("Pipeline 'feature' complete: all stages passed"));

    let decision = harness
        .controller
        .on_pre_tool(SESSION, &stagehand::orchestration::ActionKind::AskUser);
    assert!(decision.is_allowed());
}

/// Test: Reports from agents outside the pipeline
/// Given a bugfix pipeline
/// When a reviewer that is not part of it reports
/// Then nothing changes and no message is produced
#[test]
fn test_report_from_stage_outside_pipeline_is_ignored() {
    let harness = TestHarness::new();
    harness.controller.on_prompt(SESSION, "fix the crash").unwrap();
    let before = harness.controller.status(SESSION).unwrap();

    assert!(harness
        .controller
        .on_stage_complete(SESSION, &report("code-reviewer", "Verdict: FAIL"))
        .is_none());
    assert_eq!(harness.controller.status(SESSION).unwrap(), before);
}
