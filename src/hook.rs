//! Hook payloads and responses.
//!
//! Each lifecycle hook runs as its own process: a JSON payload arrives on
//! stdin, a JSON response leaves on stdout. A blocked tool call additionally
//! exits with code 2 and carries its remediation message on stderr.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::Stage;
use crate::orchestration::{ActionKind, CompletionAck, Controller, Decision, StageReport};
use crate::state::StateStore;
use crate::{shlog_trace, Result};

/// Exit code that tells the host to block the tool call.
pub const BLOCK_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum HookEvent {
    SessionStart,
    Prompt,
    PreTool,
    SubagentStop,
    Stop,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HookPayload {
    pub session_id: String,
    pub transcript_path: Option<PathBuf>,
    pub prompt: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Value,
    #[serde(alias = "subagent_type", alias = "agent_name")]
    pub agent_type: Option<String>,
    #[serde(alias = "agent_transcript_path")]
    pub subagent_transcript_path: Option<PathBuf>,
    #[serde(alias = "last_assistant_message")]
    pub last_message: Option<String>,
    /// Structured completion acknowledgment.
    pub completion: Option<CompletionAck>,
}

impl HookPayload {
    pub fn parse(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(input)?)
    }

    pub fn session(&self) -> &str {
        if self.session_id.trim().is_empty() {
            "default"
        } else {
            &self.session_id
        }
    }

    /// Map the tool call to the action class the gate understands.
    pub fn action(&self) -> ActionKind {
        let tool = self.tool_name.as_deref().unwrap_or_default();
        let input = |key: &str| {
            self.tool_input
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match tool {
            "Write" => ActionKind::Write {
                path: input("file_path"),
            },
            "Edit" | "MultiEdit" => ActionKind::Edit {
                path: input("file_path"),
            },
            "NotebookEdit" => ActionKind::Edit {
                path: input("notebook_path"),
            },
            "Task" | "Agent" => ActionKind::Delegate {
                target: input("subagent_type"),
            },
            "Skill" | "SlashCommand" => {
                let skill = input("skill");
                ActionKind::Delegate {
                    target: if skill.is_empty() { input("command") } else { skill },
                }
            }
            "AskUserQuestion" => ActionKind::AskUser,
            "EnterPlanMode" => ActionKind::EnterPlanMode,
            "Bash" => ActionKind::Shell {
                command: input("command"),
            },
            other => ActionKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_stages: Vec<Stage>,
}

/// What the hook process should emit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HookResult {
    pub response: HookResponse,
    pub exit_code: i32,
    pub stderr: Option<String>,
}

impl HookResult {
    fn message(message: Option<String>) -> Self {
        Self {
            response: HookResponse {
                system_message: message,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

pub fn dispatch<S: StateStore>(
    controller: &Controller<S>,
    event: HookEvent,
    payload: &HookPayload,
) -> HookResult {
    let session = payload.session();
    shlog_trace!("hook: {:?} session={} payload={:?}", event, session, payload);

    match event {
        HookEvent::SessionStart => HookResult::message(controller.on_session_start(session)),
        HookEvent::Prompt => {
            let directive = payload
                .prompt
                .as_deref()
                .and_then(|text| controller.on_prompt(session, text));
            HookResult::message(directive)
        }
        HookEvent::PreTool => {
            let decision = controller.on_pre_tool(session, &payload.action());
            if decision.is_allowed() {
                return HookResult::default();
            }
            HookResult {
                response: HookResponse {
                    decision: Some(Decision::Block),
                    reason: decision.message.clone(),
                    ..Default::default()
                },
                exit_code: BLOCK_EXIT_CODE,
                stderr: decision.message,
            }
        }
        HookEvent::SubagentStop => {
            let Some(agent) = payload.agent_type.as_deref() else {
                return HookResult::default();
            };
            let transcript = payload
                .subagent_transcript_path
                .as_deref()
                .or(payload.transcript_path.as_deref());
            let report = StageReport {
                agent_type: agent,
                transcript,
                last_message: payload.last_message.as_deref(),
                ack: payload.completion,
            };
            HookResult::message(controller.on_stage_complete(session, &report))
        }
        HookEvent::Stop => {
            let outcome = controller.on_turn_end(session);
            HookResult {
                response: HookResponse {
                    system_message: outcome.message,
                    missing_stages: outcome.missing_stages,
                    ..Default::default()
                },
                ..Default::default()
            }
        }
    }
}
