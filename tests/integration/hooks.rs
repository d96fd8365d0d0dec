//! Hook payload dispatch against an on-disk state directory.

use std::fs;

use serde_json::{json, Value};

use stagehand::core::Stage;
use stagehand::hook::{dispatch, HookEvent, HookPayload, BLOCK_EXIT_CODE};
use stagehand::orchestration::Decision;

use crate::fixtures::TestHarness;

fn payload(value: Value) -> HookPayload {
    HookPayload::parse(&value.to_string()).unwrap()
}

fn tool(session: &str, name: &str, input: Value) -> HookPayload {
    payload(json!({"session_id": session, "tool_name": name, "tool_input": input}))
}

/// Test: A feature session driven entirely through hook payloads
/// Given a session tagged as a feature
/// When the orchestrator tries plan mode, then delegates PLAN by namespaced id
/// Then plan mode is blocked, the delegation passes and the report advances to ARCH
#[test]
fn test_feature_session_through_hooks() {
    let harness = TestHarness::new();
    let c = &harness.controller;
    let session = "hooks-feature";

    let start = dispatch(c, HookEvent::SessionStart, &payload(json!({"session_id": session})));
    assert_eq!(start.response.system_message, None);

    let prompt = dispatch(
        c,
        HookEvent::Prompt,
        &payload(json!({"session_id": session, "prompt": "[pipeline:feature] CSV export"})),
    );
    let directive = prompt.response.system_message.unwrap();
    assert!(directive.contains("pipeline 'feature'"));
    assert!(directive.contains("PLAN (planner)"));

    let plan_mode = dispatch(c, HookEvent::PreTool, &tool(session, "EnterPlanMode", json!({})));
    assert_eq!(plan_mode.exit_code, BLOCK_EXIT_CODE);
    assert_eq!(plan_mode.response.decision, Some(Decision::Block));

    let notes = dispatch(
        c,
        HookEvent::PreTool,
        &tool(session, "Write", json!({"file_path": "NOTES.md"})),
    );
    assert_eq!(notes.exit_code, 0);

    let delegate = dispatch(
        c,
        HookEvent::PreTool,
        &tool(session, "Task", json!({"subagent_type": "acme-plugin:planner", "prompt": "plan it"})),
    );
    assert_eq!(delegate.exit_code, 0);
    assert_eq!(delegate.response.decision, None);

    let transcript = harness.temp_dir.path().join("planner.jsonl");
    fs::write(
        &transcript,
        r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Plan written. Verdict: PASS"}]}}"#,
    )
    .unwrap();
    let stop = dispatch(
        c,
        HookEvent::SubagentStop,
        &payload(json!({
            "session_id": session,
            "agent_type": "planner",
            "agent_transcript_path": transcript,
        })),
    );
    let progress = stop.response.system_message.unwrap();
    assert!(progress.contains("PLAN completed"));
    assert!(progress.contains("ARCH (architect)"));

    let turn_end = dispatch(c, HookEvent::Stop, &payload(json!({"session_id": session})));
    assert_eq!(turn_end.exit_code, 0);
    assert_eq!(turn_end.response.missing_stages.first(), Some(&Stage::Arch));
    assert!(!turn_end.response.missing_stages.contains(&Stage::Plan));
}

/// Test: Destructive commands are blocked without any pipeline
/// Given a session that was never classified
/// When a recursive delete of the home directory is attempted
/// Then the hook exits with the block code and explains why on stderr
#[test]
fn test_destructive_command_blocked_without_session() {
    let harness = TestHarness::new();
    let result = dispatch(
        &harness.controller,
        HookEvent::PreTool,
        &tool("fresh", "Bash", json!({"command": "rm -rf ~"})),
    );
    assert_eq!(result.exit_code, BLOCK_EXIT_CODE);
    assert!(result.stderr.unwrap().contains("recursive delete"));

    let harmless = dispatch(
        &harness.controller,
        HookEvent::PreTool,
        &tool("fresh", "Bash", json!({"command": "rm -rf target/debug"})),
    );
    assert_eq!(harmless.exit_code, 0);
}

/// Test: Unrelated sub-agents pass through
/// Given an active bugfix pipeline
/// When an agent outside the catalog is delegated and reports back
/// Then the delegation is allowed and the report changes nothing
#[test]
fn test_unmapped_agent_is_ignored() {
    let harness = TestHarness::new();
    let c = &harness.controller;
    let session = "hooks-unmapped";
    dispatch(
        c,
        HookEvent::Prompt,
        &payload(json!({"session_id": session, "prompt": "fix the failing login"})),
    );
    let before = c.status(session).unwrap();

    let delegate = dispatch(
        c,
        HookEvent::PreTool,
        &tool(session, "Task", json!({"subagent_type": "general-purpose"})),
    );
    assert_eq!(delegate.exit_code, 0);
    let stop = dispatch(
        c,
        HookEvent::SubagentStop,
        &payload(json!({"session_id": session, "subagent_type": "general-purpose"})),
    );
    assert_eq!(stop.response.system_message, None);
    assert_eq!(c.status(session).unwrap(), before);
}

/// Test: Questions are redirected while a pipeline runs
/// Given an active bugfix pipeline with nothing delegated
/// When the orchestrator asks the user a question
/// Then it is blocked and pointed at the ready stage
#[test]
fn test_ask_user_blocked_during_pipeline() {
    let harness = TestHarness::new();
    let c = &harness.controller;
    let session = "hooks-ask";
    dispatch(
        c,
        HookEvent::Prompt,
        &payload(json!({"session_id": session, "prompt": "fix the broken pagination"})),
    );
    let result = dispatch(c, HookEvent::PreTool, &tool(session, "AskUserQuestion", json!({})));
    assert_eq!(result.exit_code, BLOCK_EXIT_CODE);
    assert!(result.stderr.unwrap().contains("DEV (developer)"));

    dispatch(
        c,
        HookEvent::Prompt,
        &payload(json!({"session_id": session, "prompt": "[pipeline:cancel]"})),
    );
    let after_cancel = dispatch(c, HookEvent::PreTool, &tool(session, "AskUserQuestion", json!({})));
    assert_eq!(after_cancel.exit_code, 0);
}
