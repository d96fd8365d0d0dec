//! Classifier behavior across a session's lifetime.

use chrono::{Duration, Utc};

use stagehand::config::Config;
use stagehand::core::{Stage, StageStatus};
use stagehand::orchestration::{PipelineCatalog, StageReport};
use stagehand::pipeline::{ClassificationSource, TaskKind};

use crate::fixtures::TestHarness;

const SESSION: &str = "classify";

/// Finish a quickfix pipeline at `at`.
fn finished_quickfix(harness: &TestHarness, at: chrono::DateTime<Utc>) {
    let c = &harness.controller;
    c.on_prompt_at(SESSION, "fix the typo in the footer", at).unwrap();
    c.on_delegate_at(SESSION, "developer", None, at);
    let report = StageReport {
        agent_type: "developer",
        last_message: Some("Fixed."),
        ..Default::default()
    };
    let message = c.on_stage_complete_at(SESSION, &report, at).unwrap();
    assert!(message.contains("complete"));
}

/// Test: Completion acknowledgement does not reopen the pipeline
/// Given a pipeline that completed just now
/// When an inferred task signal arrives 10s later
/// Then the classification is unchanged and no directive is produced
#[test]
fn test_cooldown_ignores_inferred_signal() {
    let harness = TestHarness::new();
    let done = Utc::now();
    finished_quickfix(&harness, done);
    let before = harness.controller.status(SESSION).unwrap();

    let directive = harness.controller.on_prompt_at(
        SESSION,
        "Thanks! Now implement the export button",
        done + Duration::seconds(10),
    );
    assert!(directive.is_none());
    assert_eq!(
        harness.controller.status(SESSION).unwrap().classification,
        before.classification
    );
}

/// Test: After the cooldown a new task starts fresh
/// Given a pipeline that completed 45s ago
/// When an inferred feature signal arrives
/// Then a fresh feature pipeline starts without carried stages
#[test]
fn test_signal_after_cooldown_starts_new_pipeline() {
    let harness = TestHarness::new();
    let done = Utc::now();
    finished_quickfix(&harness, done);

    let directive = harness
        .controller
        .on_prompt_at(SESSION, "implement the export button", done + Duration::seconds(45))
        .unwrap();
    assert!(directive.contains("feature"));

    let state = harness.controller.status(SESSION).unwrap();
    let classification = state.classification.as_ref().unwrap();
    assert_eq!(classification.task_kind, TaskKind::Feature);
    assert!(classification.history.is_empty());
    assert_eq!(state.status(Stage::Dev), Some(StageStatus::Pending));
    assert!(state.meta.completed_at.is_none());
}

/// Test: Explicit tags bypass the cooldown
/// Given a pipeline that completed 5s ago
/// When an explicit tdd tag arrives
/// Then the pipeline is upgraded immediately
#[test]
fn test_explicit_tag_bypasses_cooldown() {
    let harness = TestHarness::new();
    let done = Utc::now();
    finished_quickfix(&harness, done);

    let directive = harness
        .controller
        .on_prompt_at(SESSION, "[pipeline:tdd] parser rewrite", done + Duration::seconds(5))
        .unwrap();
    assert!(directive.contains("upgraded"));
    let state = harness.controller.status(SESSION).unwrap();
    assert_eq!(state.task_kind(), Some(TaskKind::Tdd));
    assert_eq!(state.status(Stage::Dev), Some(StageStatus::Skipped));
    assert_eq!(
        state.classification.unwrap().source,
        ClassificationSource::Explicit
    );
}

/// Test: Downgrades are rejected
/// Given an active feature pipeline
/// When a quickfix-like prompt arrives
/// Then the feature pipeline continues untouched
#[test]
fn test_downgrade_is_rejected() {
    let harness = TestHarness::new();
    let c = &harness.controller;
    c.on_prompt(SESSION, "implement webhooks").unwrap();
    let before = c.status(SESSION).unwrap();

    assert!(c.on_prompt(SESSION, "also fix the typo in the docs").is_none());
    assert_eq!(c.status(SESSION).unwrap(), before);
}

/// Test: Same-kind reclassification is idempotent
/// Given a bugfix pipeline
/// When another bug report arrives
/// Then no directive is produced and nothing is journaled
#[test]
fn test_same_kind_is_idempotent() {
    let harness = TestHarness::new();
    let c = &harness.controller;
    c.on_prompt(SESSION, "fix the crash on login").unwrap();
    let journal_len = std::fs::read_to_string(harness.journal_path(SESSION))
        .unwrap()
        .lines()
        .count();

    assert!(c.on_prompt(SESSION, "the login bug also crashes on logout").is_none());
    let after = std::fs::read_to_string(harness.journal_path(SESSION))
        .unwrap()
        .lines()
        .count();
    assert_eq!(after, journal_len);
}

/// Test: Research is never enforced
/// Given a question-like prompt
/// When it is classified
/// Then no stage is gated and code edits are allowed
#[test]
fn test_research_does_not_gate() {
    let harness = TestHarness::new();
    let directive = harness
        .controller
        .on_prompt(SESSION, "How does the session cache expire entries?")
        .unwrap();
    assert!(directive.contains("research"));

    let edit = stagehand::orchestration::ActionKind::Edit {
        path: "src/cache.rs".into(),
    };
    assert!(harness.controller.on_pre_tool(SESSION, &edit).is_allowed());
}

/// Test: Missing capabilities shrink the template
/// Given a registry without a QA agent
/// When a feature is classified
/// Then QA is omitted and E2E inherits its dependencies
#[test]
fn test_uninstalled_capability_is_omitted() {
    use stagehand::orchestration::{StaticRegistry, CapabilityRegistry};

    let installed = StaticRegistry::builtin()
        .discover()
        .unwrap()
        .into_iter()
        .filter(|c| c.id != "qa-engineer")
        .collect();
    let catalog = PipelineCatalog::discover(&StaticRegistry::new(installed)).unwrap();
    let harness = TestHarness::with_config(catalog, Config::default());

    harness
        .controller
        .on_prompt(SESSION, "implement the billing export")
        .unwrap();
    let state = harness.controller.status(SESSION).unwrap();
    assert!(!state.dag.contains_key(&Stage::Qa));
    assert_eq!(state.dag[&Stage::E2e].deps, vec![Stage::Review, Stage::Test]);
}
