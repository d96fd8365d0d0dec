//! Task classification: maps a prompt to the pipeline template governing a session.
//!
//! ## Layers
//!
//! - **Layer 1** (explicit): a `[pipeline:<id>]` tag anywhere in the text.
//!   Always wins and bypasses the post-completion cooldown.
//!   `[pipeline:cancel]` (or `off`) cancels the session's pipeline.
//! - **Layer 2** (inferred): ranked keyword rules. The first rule that matches
//!   decides; question-like phrasing maps to `research`.
//!
//! ## Re-classification
//!
//! Task kinds are totally ordered by rank. The same kind is a no-op, a lower
//! rank is rejected, and a higher rank upgrades the session: stages already
//! satisfied in the old DAG are carried into the new one as skipped.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::core::dag;
use crate::core::{Stage, StageRecord, StageStatus};
use crate::error::Result;
use crate::pipeline::{
    Classification, ClassificationSource, ClassificationTransition, SessionPipelineState, TaskKind,
};
use crate::{shlog, shlog_debug};

use super::catalog::PipelineCatalog;

/// Explicit override tag, e.g. `[pipeline:feature]`.
static EXPLICIT_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\s*pipeline\s*:\s*([a-z0-9_-]+)\s*\]").unwrap()
});

/// Interrogative openings that mark a request for information.
static QUESTION_OPENING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(what|why|how|where|when|which|who|explain|describe|investigate|research)\b")
        .unwrap()
});

/// Layer-2 rules in rank-independent match order; the first hit wins.
static RULES: LazyLock<Vec<(TaskKind, Regex)>> = LazyLock::new(|| {
    [
        (
            TaskKind::Tdd,
            r"(?i)\b(tdd|test[- ]driven|tests?[- ]first|red[- ]green)\b",
        ),
        (
            TaskKind::Quickfix,
            r"(?i)\b(typos?|quick[- ]?fix|hotfix|tweak|bump|one[- ]liner|small change|minor change)\b",
        ),
        (
            TaskKind::Test,
            r"(?i)\b((add|write|improve|increase|expand|extend)\s+(\w+\s+){0,3}?(tests?|specs?|coverage)|test coverage)\b",
        ),
        (
            TaskKind::Bugfix,
            r"(?i)\b(fix(es|ed|ing)?|bugs?|broken|crash(es|ed|ing)?|regressions?|failing|fails|not working|doesn'?t work|(get(s|ting)?|got|throws?|throwing|raises?|raising|returns?|returning|shows?|showing)\s+(an?\s+)?errors?|errors?\s+(when|on|in|while|after|during))\b",
        ),
        (
            TaskKind::Refactor,
            r"(?i)\b(refactor(s|ed|ing)?|clean ?up|restructure|reorgani[sz]e|simplify|extract|decouple|modulari[sz]e)\b",
        ),
        (
            TaskKind::Feature,
            r"(?i)\b(implement|add|build|create|introduce|support|feature|new (endpoint|page|command|module|api|screen))\b",
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).unwrap()))
    .collect()
});

/// What a signal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Classify {
        kind: TaskKind,
        source: ClassificationSource,
    },
    Cancel,
}

/// Detect the intent of a free-text signal.
///
/// Returns `None` when nothing in the text maps to a task kind.
pub fn detect_intent(text: &str, catalog: &PipelineCatalog) -> Option<Intent> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(caps) = EXPLICIT_TAG_RE.captures(trimmed) {
        let id = caps[1].to_ascii_lowercase();
        match id.as_str() {
            "cancel" | "off" | "none" | "stop" => return Some(Intent::Cancel),
            _ => {
                let kind = catalog
                    .template_by_id(&id)
                    .map(|t| t.task_kind)
                    .or_else(|| id.parse::<TaskKind>().ok());
                if let Some(kind) = kind {
                    return Some(Intent::Classify {
                        kind,
                        source: ClassificationSource::Explicit,
                    });
                }
                shlog_debug!("classifier: unknown pipeline tag '{}', falling back to heuristics", id);
            }
        }
    }

    let body = EXPLICIT_TAG_RE.replace_all(trimmed, " ");
    infer_kind(&body).map(|kind| Intent::Classify {
        kind,
        source: ClassificationSource::Inferred,
    })
}

/// Layer-2 heuristic classification.
pub fn infer_kind(text: &str) -> Option<TaskKind> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if QUESTION_OPENING_RE.is_match(text) {
        return Some(TaskKind::Research);
    }
    RULES
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(kind, _)| *kind)
        .or_else(|| text.ends_with('?').then_some(TaskKind::Research))
}

/// Instruction produced by a classification that changed the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Started {
        kind: TaskKind,
        template_id: String,
        source: ClassificationSource,
        stages: Vec<Stage>,
        ready: Vec<Stage>,
    },
    Upgraded {
        from: TaskKind,
        to: TaskKind,
        skipped: Vec<Stage>,
        ready: Vec<Stage>,
    },
    Cancelled,
}

impl Directive {
    /// Human-readable instruction for the orchestrating session.
    pub fn render(&self, catalog: &PipelineCatalog) -> String {
        match self {
            Directive::Started {
                kind,
                template_id,
                source,
                stages,
                ready,
            } => {
                if stages.is_empty() {
                    return format!(
                        "[stagehand] Task classified as {} ({}). No pipeline is enforced for this task.",
                        kind, source
                    );
                }
                format!(
                    "[stagehand] Task classified as {} ({}); pipeline '{}': {}. \
                     Delegate each stage to its agent instead of editing code directly. Ready now: {}.",
                    kind,
                    source,
                    template_id,
                    join(stages, " -> "),
                    describe_ready(ready, catalog)
                )
            }
            Directive::Upgraded {
                from,
                to,
                skipped,
                ready,
            } => {
                let carried = if skipped.is_empty() {
                    "none".to_string()
                } else {
                    join(skipped, ", ")
                };
                format!(
                    "[stagehand] Pipeline upgraded from {} to {}. Already satisfied: {}. Ready now: {}.",
                    from,
                    to,
                    carried,
                    describe_ready(ready, catalog)
                )
            }
            Directive::Cancelled => {
                "[stagehand] Pipeline cancelled; actions are no longer gated for this session."
                    .to_string()
            }
        }
    }
}

/// Ready stages with the capability to delegate each one to.
pub fn describe_ready(ready: &[Stage], catalog: &PipelineCatalog) -> String {
    if ready.is_empty() {
        return "nothing".to_string();
    }
    ready
        .iter()
        .map(|stage| match catalog.binding(*stage) {
            Some(binding) => format!("{} ({})", stage, binding.required_capability),
            None => stage.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn join(stages: &[Stage], sep: &str) -> String {
    stages
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

/// Outcome of `classify`. `directive` is `None` whenever the state was left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassifyOutcome {
    pub directive: Option<Directive>,
}

impl ClassifyOutcome {
    fn unchanged() -> Self {
        Self::default()
    }

    pub fn changed(&self) -> bool {
        self.directive.is_some()
    }
}

/// Classify a signal against the current session state.
///
/// `cooldown` is the window after pipeline completion during which inferred
/// signals are ignored.
pub fn classify(
    state: &mut SessionPipelineState,
    signal: &str,
    now: DateTime<Utc>,
    catalog: &PipelineCatalog,
    cooldown: Duration,
) -> Result<ClassifyOutcome> {
    let Some(intent) = detect_intent(signal, catalog) else {
        return Ok(ClassifyOutcome::unchanged());
    };

    let (kind, source) = match intent {
        Intent::Cancel => return Ok(cancel(state)),
        Intent::Classify { kind, source } => (kind, source),
    };
    let explicit = source == ClassificationSource::Explicit;

    if let Some(completed_at) = state.meta.completed_at {
        if !explicit && now - completed_at < cooldown {
            shlog_debug!(
                "classifier: ignoring inferred {} within cooldown ({}s since completion)",
                kind,
                (now - completed_at).num_seconds()
            );
            return Ok(ClassifyOutcome::unchanged());
        }
        // An explicit upgrade extends the finished pipeline; anything else is a new task.
        let extends = explicit
            && state
                .task_kind()
                .map(|current| kind.rank() > current.rank())
                .unwrap_or(false);
        if !extends {
            shlog!("classifier: previous pipeline finished, starting fresh for {}", kind);
            dag::reset(state);
        }
    }

    if state.cancelled {
        if !explicit {
            return Ok(ClassifyOutcome::unchanged());
        }
        dag::reset(state);
    }

    let current = match &state.classification {
        None => return adopt(state, kind, source, now, catalog),
        Some(current) => current.task_kind,
    };

    if kind == current {
        return Ok(ClassifyOutcome::unchanged());
    }
    if kind.rank() < current.rank() {
        shlog!(
            "classifier: downgrade {} -> {} rejected, pipeline continues",
            current,
            kind
        );
        return Ok(ClassifyOutcome::unchanged());
    }
    upgrade(state, current, kind, source, now, catalog)
}

/// Stop enforcing the session's pipeline. Only an explicit tag restarts it.
pub fn cancel(state: &mut SessionPipelineState) -> ClassifyOutcome {
    if state.cancelled {
        return ClassifyOutcome::unchanged();
    }
    shlog!("classifier: pipeline cancelled for session {}", state.session_id);
    state.cancelled = true;
    state.pipeline_active = false;
    state.active_stages.clear();
    state.delegation_window_open = false;
    ClassifyOutcome {
        directive: Some(Directive::Cancelled),
    }
}

fn adopt(
    state: &mut SessionPipelineState,
    kind: TaskKind,
    source: ClassificationSource,
    now: DateTime<Utc>,
    catalog: &PipelineCatalog,
) -> Result<ClassifyOutcome> {
    let template = catalog.resolve_template(kind)?;
    state.install_template(template);
    state.classification = Some(Classification {
        template_id: template.id.clone(),
        task_kind: kind,
        source,
        history: Vec::new(),
    });
    let ready = dag::start(state, now);
    shlog!(
        "classifier: session {} classified as {} ({}), {} stages",
        state.session_id,
        kind,
        source,
        template.stages.len()
    );
    Ok(ClassifyOutcome {
        directive: Some(Directive::Started {
            kind,
            template_id: template.id.clone(),
            source,
            stages: template.stages.clone(),
            ready,
        }),
    })
}

fn upgrade(
    state: &mut SessionPipelineState,
    from: TaskKind,
    to: TaskKind,
    source: ClassificationSource,
    now: DateTime<Utc>,
    catalog: &PipelineCatalog,
) -> Result<ClassifyOutcome> {
    let template = catalog.resolve_template(to)?;
    let previous = std::mem::take(&mut state.stages);
    let in_flight = std::mem::take(&mut state.active_stages);
    let mut history = state
        .classification
        .take()
        .map(|c| c.history)
        .unwrap_or_default();

    state.install_template(template);

    let mut skipped = Vec::new();
    for (stage, record) in previous {
        if !state.dag.contains_key(&stage) {
            continue;
        }
        match record.status {
            StageStatus::Completed | StageStatus::Skipped => {
                state.stages.insert(
                    stage,
                    StageRecord {
                        verdict: record.verdict,
                        severity: record.severity,
                        retries: record.retries,
                        completed_at: record.completed_at,
                        ..StageRecord::skipped()
                    },
                );
                skipped.push(stage);
            }
            _ if in_flight.contains(&stage) => {
                state.record_mut(stage).status = StageStatus::Active;
                state.active_stages.push(stage);
            }
            _ => {}
        }
    }
    state.delegation_window_open = !state.active_stages.is_empty();

    history.push(ClassificationTransition {
        from,
        to,
        at: now,
        skipped_stages: skipped.clone(),
    });
    state.classification = Some(Classification {
        template_id: template.id.clone(),
        task_kind: to,
        source,
        history,
    });

    let ready = dag::start(state, now);
    shlog!(
        "classifier: session {} upgraded {} -> {}, carried {:?}",
        state.session_id,
        from,
        to,
        skipped
    );
    Ok(ClassifyOutcome {
        directive: Some(Directive::Upgraded {
            from,
            to,
            skipped,
            ready,
        }),
    })
}
