//! Allow/block decisions for actions the orchestrating session is about to take.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{dag, Stage};
use crate::pipeline::SessionPipelineState;
use crate::shlog_debug;

use super::catalog::PipelineCatalog;
use super::classifier::describe_ready;

/// Destructive shell command patterns, blocked regardless of pipeline state.
static DESTRUCTIVE_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        (
            "recursive delete of the root or home directory",
            r#"\brm\s+(-[a-zA-Z]*\s+)*-[a-zA-Z]*[rR][a-zA-Z]*\s+(-[a-zA-Z]+\s+)*(/|~|\$HOME|"\$HOME")(/?\*?)?(\s|;|&|\||$)"#,
        ),
        (
            "forced push to a protected branch",
            r"\bgit\s+push\b.*(\s--force\b|\s-f\b|\s\+).*\b(main|master)\b|\bgit\s+push\b.*\b(main|master)\b.*(\s--force\b|\s-f\b)",
        ),
        ("raw write to a disk device", r"\bdd\b.*\bof=/dev/"),
        ("filesystem format", r"\bmkfs(\.\w+)?\b"),
        ("redirect onto a disk device", r">\s*/dev/(sd|nvme|hd|disk)\w*"),
        ("world-writable permissions", r"\bchmod\s+(-[a-zA-Z]+\s+)*0?777\b"),
        ("fork bomb", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
    ]
    .into_iter()
    .map(|(label, pattern)| (label, Regex::new(pattern).unwrap()))
    .collect()
});

/// File extensions treated as executable code. Everything else counts as content.
const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "ts", "tsx", "js", "jsx", "mjs", "cjs", "go", "java", "kt", "swift", "c", "cc",
    "cpp", "h", "hpp", "cs", "rb", "php", "sh", "bash", "zsh", "sql", "vue", "svelte", "scala",
    "lua", "dart", "ex", "exs", "css", "scss", "html",
];

/// Class of action being gated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Write { path: String },
    Edit { path: String },
    /// Hand a stage to a sub-agent or skill.
    Delegate { target: String },
    AskUser,
    EnterPlanMode,
    Shell { command: String },
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block,
}

/// Why an action was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockReason {
    DestructiveCommand,
    DirectCodeEdit,
    DependencyUnsatisfied,
    InteractivePrompt,
    PlanModeOwnedByPipeline,
}

/// Result of gate evaluation. A block always carries a remediation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<BlockReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            reason: None,
            message: None,
        }
    }

    pub fn block(reason: BlockReason, message: impl Into<String>) -> Self {
        Self {
            decision: Decision::Block,
            reason: Some(reason),
            message: Some(message.into()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// Evaluate an action against the session's pipeline state.
pub fn evaluate(
    action: &ActionKind,
    state: Option<&SessionPipelineState>,
    catalog: &PipelineCatalog,
) -> GateDecision {
    if let ActionKind::Shell { command } = action {
        if let Some(label) = destructive_match(command) {
            shlog_debug!("gate: blocked destructive command ({})", label);
            return GateDecision::block(
                BlockReason::DestructiveCommand,
                format!(
                    "Blocked: this command looks like a {}. Run a narrower, reversible command instead.",
                    label
                ),
            );
        }
    }

    let Some(state) = state else {
        return GateDecision::allow();
    };
    if !state.is_enforced() || state.cancelled || state.delegation_window_open {
        return GateDecision::allow();
    }
    if dag::is_complete(state) {
        return GateDecision::allow();
    }

    match action {
        ActionKind::Write { path } | ActionKind::Edit { path } => {
            if !is_code_path(path) {
                return GateDecision::allow();
            }
            let ready = dag::awaiting_delegation(state);
            GateDecision::block(
                BlockReason::DirectCodeEdit,
                format!(
                    "A pipeline is active for this task; code changes belong to its stages. \
                     Delegate instead of editing {} directly. Ready now: {}.",
                    path,
                    describe_ready(&ready, catalog)
                ),
            )
        }
        ActionKind::Delegate { target } => evaluate_delegation(target, state, catalog),
        ActionKind::AskUser => GateDecision::block(
            BlockReason::InteractivePrompt,
            format!(
                "The pipeline runs end to end without questions. Continue with the next stage: {}. \
                 Use [pipeline:cancel] to stop it.",
                describe_ready(&dag::awaiting_delegation(state), catalog)
            ),
        ),
        ActionKind::EnterPlanMode => GateDecision::block(
            BlockReason::PlanModeOwnedByPipeline,
            "Planning is handled by the pipeline's PLAN stage; delegate to it instead of entering plan mode.",
        ),
        ActionKind::Shell { .. } | ActionKind::Other(_) => GateDecision::allow(),
    }
}

fn evaluate_delegation(
    target: &str,
    state: &SessionPipelineState,
    catalog: &PipelineCatalog,
) -> GateDecision {
    let Some(stage) = catalog.stage_for_capability(target) else {
        return GateDecision::allow();
    };
    if !state.dag.contains_key(&stage) {
        return GateDecision::allow();
    }
    if dag::is_ready(state, stage) {
        return GateDecision::allow();
    }
    delegation_block(stage, state, catalog)
}

/// Block a delegation to `stage`, naming its unmet dependencies.
pub fn delegation_block(
    stage: Stage,
    state: &SessionPipelineState,
    catalog: &PipelineCatalog,
) -> GateDecision {
    GateDecision::block(
        BlockReason::DependencyUnsatisfied,
        unmet_message(
            stage,
            &dag::unmet_dependencies(state, stage),
            &dag::awaiting_delegation(state),
            catalog,
        ),
    )
}

fn unmet_message(
    stage: Stage,
    missing: &[Stage],
    ready: &[Stage],
    catalog: &PipelineCatalog,
) -> String {
    let missing = missing
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if ready.is_empty() {
        format!(
            "Stage {} cannot start yet: waiting on {}. Wait for the running stages to report back.",
            stage, missing
        )
    } else {
        format!(
            "Stage {} cannot start yet: waiting on {}. Delegate a ready stage first: {}.",
            stage,
            missing,
            describe_ready(ready, catalog)
        )
    }
}

/// Label of the first destructive pattern matching `command`.
pub fn destructive_match(command: &str) -> Option<&'static str> {
    DESTRUCTIVE_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(command))
        .map(|(label, _)| *label)
}

pub fn is_code_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| CODE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
