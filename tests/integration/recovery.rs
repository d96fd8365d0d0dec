//! Snapshot loss, corruption and journal replay.

use std::fs::{self, OpenOptions};
use std::io::Write;

use stagehand::config::Config;
use stagehand::core::{Stage, StageStatus};
use stagehand::orchestration::{replay, ActionKind, PipelineCatalog};
use stagehand::state::StateStore;
use stagehand::SessionPipelineState;

use crate::fixtures::TestHarness;

const SESSION: &str = "recover";

/// Bugfix session with DEV completed and TEST waiting.
fn bugfix_after_dev(harness: &TestHarness) {
    harness
        .controller
        .on_prompt(SESSION, "fix the crash when saving drafts")
        .unwrap();
    harness.run_stage(SESSION, "developer", "Patched the null check.");
}

fn without_journal() -> TestHarness {
    let config = Config {
        journal: false,
        ..Config::default()
    };
    TestHarness::with_config(PipelineCatalog::builtin().unwrap(), config)
}

/// Test: Journal replay reproduces the snapshot
/// Given a session that classified, delegated and completed a stage
/// When its journal is replayed from scratch
/// Then the result equals the stored snapshot
#[test]
fn test_replay_matches_snapshot() {
    let harness = TestHarness::new();
    bugfix_after_dev(&harness);

    let snapshot = harness.controller.store().load(SESSION).unwrap().unwrap();
    let events = harness.controller.store().load_events(SESSION).unwrap();
    let replayed = replay::replay(
        SESSION,
        &events,
        harness.controller.catalog(),
        harness.controller.config(),
    );
    assert_eq!(replayed, Some(snapshot));
}

/// Test: A corrupt snapshot is rebuilt from the journal
/// Given a snapshot overwritten with garbage
/// When the next hook runs
/// Then progress is recovered and the snapshot is rewritten
#[test]
fn test_corrupt_snapshot_rebuilt_from_journal() {
    let harness = TestHarness::new();
    bugfix_after_dev(&harness);
    fs::write(harness.snapshot_path(SESSION), "{\"sessionId\": \"rec").unwrap();

    let state = harness.controller.status(SESSION).unwrap();
    assert_eq!(state.status(Stage::Dev), Some(StageStatus::Completed));

    assert!(harness.controller.on_delegate(SESSION, "test-engineer", None).allow);
    let contents = fs::read_to_string(harness.snapshot_path(SESSION)).unwrap();
    let rewritten: SessionPipelineState = serde_json::from_str(&contents).unwrap();
    assert_eq!(rewritten.active_stages, vec![Stage::Test]);
}

/// Test: A deleted snapshot is rebuilt on session start
/// Given a session whose snapshot vanished
/// When the session starts again
/// Then the resume message lists the outstanding stage
#[test]
fn test_missing_snapshot_resumes_from_journal() {
    let harness = TestHarness::new();
    bugfix_after_dev(&harness);
    fs::remove_file(harness.snapshot_path(SESSION)).unwrap();

    let message = harness.controller.on_session_start(SESSION).unwrap();
    assert!(message.contains("Resuming pipeline 'bugfix'"));
    assert!(message.contains("TEST"));
    assert!(harness.snapshot_path(SESSION).exists());
}

/// Test: A torn journal line is skipped
/// Given a journal whose last write was cut short
/// When the snapshot is lost and rebuilt
/// Then every complete event still applies
#[test]
fn test_torn_journal_line_is_skipped() {
    let harness = TestHarness::new();
    bugfix_after_dev(&harness);

    let mut journal = OpenOptions::new()
        .append(true)
        .open(harness.journal_path(SESSION))
        .unwrap();
    journal.write_all(b"{\"event\":\"stage-repo").unwrap();
    drop(journal);
    fs::remove_file(harness.snapshot_path(SESSION)).unwrap();

    let state = harness.controller.status(SESSION).unwrap();
    assert_eq!(state.status(Stage::Dev), Some(StageStatus::Completed));
    assert_eq!(state.status(Stage::Test), Some(StageStatus::Active));
}

/// Test: Corruption without a journal fails open
/// Given journaling disabled and a corrupt snapshot
/// When the orchestrator edits code
/// Then the edit is allowed and the session behaves as unclassified
#[test]
fn test_corrupt_snapshot_without_journal_fails_open() {
    let harness = without_journal();
    harness
        .controller
        .on_prompt(SESSION, "fix the crash when saving drafts")
        .unwrap();
    let edit = ActionKind::Edit {
        path: "src/drafts.rs".into(),
    };
    assert!(!harness.controller.on_pre_tool(SESSION, &edit).is_allowed());
    assert!(!harness.journal_path(SESSION).exists());

    fs::write(harness.snapshot_path(SESSION), "not json at all").unwrap();
    assert!(harness.controller.on_pre_tool(SESSION, &edit).is_allowed());
    assert!(harness.controller.status(SESSION).is_none());

    // The next classification starts over and overwrites the bad file.
    assert!(harness
        .controller
        .on_prompt(SESSION, "fix the crash when saving drafts")
        .is_some());
    assert!(harness.controller.status(SESSION).is_some());
}

/// Test: A snapshot from a newer release is not trusted
/// Given a snapshot with a higher schema version
/// When it is loaded
/// Then it is treated as corrupt
#[test]
fn test_newer_schema_is_treated_as_corrupt() {
    let harness = without_journal();
    harness
        .controller
        .on_prompt(SESSION, "fix the crash when saving drafts")
        .unwrap();

    let path = harness.snapshot_path(SESSION);
    let mut value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    value["schemaVersion"] = serde_json::json!(99);
    fs::write(&path, value.to_string()).unwrap();

    assert!(harness.controller.status(SESSION).is_none());
    let edit = ActionKind::Write {
        path: "src/drafts.rs".into(),
    };
    assert!(harness.controller.on_pre_tool(SESSION, &edit).is_allowed());
}

/// Test: Finished sessions are cleaned up
/// Given a completed pipeline past its cooldown
/// When the turn ends
/// Then the snapshot and journal are removed
#[test]
fn test_finished_session_is_removed_after_cooldown() {
    let harness = TestHarness::new();
    harness
        .controller
        .on_prompt(SESSION, "fix the typo in the header")
        .unwrap();
    harness.run_stage(SESSION, "developer", "Verdict: PASS");

    let later = chrono::Utc::now() + chrono::Duration::seconds(120);
    let outcome = harness.controller.on_turn_end_at(SESSION, later);
    assert!(outcome.missing_stages.is_empty());
    assert!(!harness.snapshot_path(SESSION).exists());
    assert!(!harness.journal_path(SESSION).exists());
}
