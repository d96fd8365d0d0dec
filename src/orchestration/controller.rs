//! Entry points for session lifecycle events.
//!
//! Each call loads the session snapshot inside a store transaction, applies
//! the event, journals it when something changed, and answers the caller.
//! Nothing here returns an error: every failure is logged and resolves to
//! "allow" or to no message at all.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::core::{dag, AdvanceReport, Stage, StageGraph, StageOutcome, StageStatus, Verdict};
use crate::pipeline::SessionPipelineState;
use crate::state::{PipelineEvent, StateStore};
use crate::{shlog, shlog_debug, shlog_warn, Error, Result};

use super::catalog::PipelineCatalog;
use super::classifier::describe_ready;
use super::gate::{self, ActionKind, GateDecision};
use super::replay::{self, Applied};
use super::verdict::{self, CompletionAck};

/// Answer to a delegation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelegateOutcome {
    pub allow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<GateDecision> for DelegateOutcome {
    fn from(decision: GateDecision) -> Self {
        Self {
            allow: decision.is_allowed(),
            message: decision.message,
        }
    }
}

/// Stages still expected when the orchestrator's turn ends.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnEndOutcome {
    pub missing_stages: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A completed stage report.
#[derive(Debug, Clone, Default)]
pub struct StageReport<'a> {
    pub agent_type: &'a str,
    pub transcript: Option<&'a Path>,
    pub last_message: Option<&'a str>,
    pub ack: Option<CompletionAck>,
}

pub struct Controller<S: StateStore> {
    store: S,
    catalog: PipelineCatalog,
    config: Config,
}

impl<S: StateStore> Controller<S> {
    pub fn new(store: S, catalog: PipelineCatalog, config: Config) -> Self {
        Self {
            store,
            catalog,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn catalog(&self) -> &PipelineCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create the session's state, or describe the pipeline a resumed session is in.
    pub fn on_session_start(&self, session_id: &str) -> Option<String> {
        self.on_session_start_at(session_id, Utc::now())
    }

    pub fn on_session_start_at(&self, session_id: &str, now: DateTime<Utc>) -> Option<String> {
        let result = self.store.transaction(session_id, |slot| -> Result<Option<String>> {
            self.recover(session_id, slot)?;
            let event = PipelineEvent::SessionStarted { at: now };
            self.apply_and_record(slot, session_id, &event)?;
            Ok(slot
                .as_ref()
                .filter(|s| s.pipeline_active && !s.cancelled)
                .map(|s| self.resume_message(s)))
        });
        fail_open("session-start", session_id, flatten(result)).flatten()
    }

    /// Classify a prompt. Returns the directive text when the pipeline changed.
    pub fn on_prompt(&self, session_id: &str, text: &str) -> Option<String> {
        self.on_prompt_at(session_id, text, Utc::now())
    }

    pub fn on_prompt_at(&self, session_id: &str, text: &str, now: DateTime<Utc>) -> Option<String> {
        let result = self.store.transaction(session_id, |slot| -> Result<Option<String>> {
            self.recover(session_id, slot)?;
            let event = PipelineEvent::Classified {
                text: text.to_string(),
                at: now,
            };
            match self.apply_and_record(slot, session_id, &event)? {
                Applied::Classified(directive) => Ok(Some(directive.render(&self.catalog))),
                _ => Ok(None),
            }
        });
        fail_open("prompt", session_id, flatten(result)).flatten()
    }

    /// Gate any action. Delegations are routed through `on_delegate`.
    pub fn on_pre_tool(&self, session_id: &str, action: &ActionKind) -> GateDecision {
        if let ActionKind::Delegate { target } = action {
            return self.on_delegate(session_id, target, None).into_decision();
        }
        let state = match self.current_state(session_id) {
            Ok(state) => state,
            Err(e) => {
                shlog_warn!("controller: pre-tool for {} failed open: {}", session_id, e);
                None
            }
        };
        let decision = gate::evaluate(action, state.as_ref(), &self.catalog);
        if !decision.is_allowed() {
            shlog!("controller: blocked {:?} for session {}", action, session_id);
        }
        decision
    }

    /// Decide a delegation to `target` and, when allowed, mark its stage in flight.
    pub fn on_delegate(&self, session_id: &str, target: &str, detail: Option<&str>) -> DelegateOutcome {
        self.on_delegate_at(session_id, target, detail, Utc::now())
    }

    pub fn on_delegate_at(
        &self,
        session_id: &str,
        target: &str,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> DelegateOutcome {
        if let Some(decision) = self.unmapped_delegation(target) {
            return decision.into();
        }
        if let Some(detail) = detail {
            shlog_debug!("controller: delegation to {}: {}", target, truncate(detail, 120));
        }

        let result = self.store.transaction(session_id, |slot| -> Result<GateDecision> {
            self.recover(session_id, slot)?;
            let event = PipelineEvent::Delegated {
                capability: target.to_string(),
                at: now,
            };
            match self.apply_and_record(slot, session_id, &event) {
                Ok(Applied::Delegated { stage, newly }) => {
                    if newly {
                        shlog!("controller: {} delegated in session {}", stage, session_id);
                    }
                    Ok(GateDecision::allow())
                }
                Ok(_) => Ok(GateDecision::allow()),
                Err(Error::DependencyUnsatisfied { stage, missing }) => {
                    shlog!("controller: {} blocked, waiting on {:?}", stage, missing);
                    Ok(slot
                        .as_ref()
                        .map(|s| gate::delegation_block(stage, s, &self.catalog))
                        .unwrap_or_else(GateDecision::allow))
                }
                Err(e) => Err(e),
            }
        });
        fail_open("delegate", session_id, flatten(result))
            .unwrap_or_else(GateDecision::allow)
            .into()
    }

    /// Record a stage's report and advance the pipeline.
    ///
    /// The verdict comes from the structured acknowledgment when present,
    /// then from the final message, then from the transcript. A report with
    /// no recognisable verdict counts as a pass.
    pub fn on_stage_complete(&self, session_id: &str, report: &StageReport<'_>) -> Option<String> {
        self.on_stage_complete_at(session_id, report, Utc::now())
    }

    pub fn on_stage_complete_at(
        &self,
        session_id: &str,
        report: &StageReport<'_>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        if self.catalog.stage_for_capability(report.agent_type).is_none() {
            shlog_debug!("controller: {} is not a pipeline capability", report.agent_type);
            return None;
        }
        let outcome = self.resolve_outcome(report);

        let result = self.store.transaction(session_id, |slot| -> Result<Option<String>> {
            self.recover(session_id, slot)?;
            let event = PipelineEvent::StageReported {
                capability: report.agent_type.to_string(),
                verdict: outcome.verdict,
                severity: outcome.severity,
                at: now,
            };
            match self.apply_and_record(slot, session_id, &event)? {
                Applied::Advanced(advance) => Ok(slot
                    .as_ref()
                    .map(|state| self.progress_message(state, &advance))),
                _ => Ok(None),
            }
        });
        fail_open("stage-complete", session_id, flatten(result)).flatten()
    }

    /// Stages never brought to a terminal status. A finished pipeline whose
    /// cooldown has passed is deleted here.
    pub fn on_turn_end(&self, session_id: &str) -> TurnEndOutcome {
        self.on_turn_end_at(session_id, Utc::now())
    }

    pub fn on_turn_end_at(&self, session_id: &str, now: DateTime<Utc>) -> TurnEndOutcome {
        let result = self.store.transaction(session_id, |slot| -> Result<TurnEndOutcome> {
            self.recover(session_id, slot)?;
            let Some(state) = slot.as_ref() else {
                return Ok(TurnEndOutcome::default());
            };

            if let Some(completed_at) = state.meta.completed_at {
                if now - completed_at >= self.config.cooldown() {
                    shlog_debug!("controller: pipeline of {} finished, removing state", session_id);
                    *slot = None;
                }
                return Ok(TurnEndOutcome::default());
            }
            if !state.pipeline_active || state.cancelled || !state.is_enforced() {
                return Ok(TurnEndOutcome::default());
            }

            let missing = dag::outstanding(state);
            if missing.is_empty() {
                return Ok(TurnEndOutcome::default());
            }
            let message = self.reminder_message(state, &missing);
            Ok(TurnEndOutcome {
                missing_stages: missing,
                message: Some(message),
            })
        });
        fail_open("turn-end", session_id, flatten(result)).unwrap_or_default()
    }

    /// Stop gating the session. Only an explicit `[pipeline:<id>]` tag restarts it.
    pub fn cancel(&self, session_id: &str) -> Option<String> {
        let now = Utc::now();
        let result = self.store.transaction(session_id, |slot| -> Result<Option<String>> {
            self.recover(session_id, slot)?;
            let event = PipelineEvent::Cancelled { at: now };
            match self.apply_and_record(slot, session_id, &event)? {
                Applied::Classified(directive) => Ok(Some(directive.render(&self.catalog))),
                _ => Ok(None),
            }
        });
        fail_open("cancel", session_id, flatten(result)).flatten()
    }

    /// Clear progress. With `keep_classification` the same template restarts.
    pub fn reset(&self, session_id: &str, keep_classification: bool) -> bool {
        let now = Utc::now();
        let result = self.store.transaction(session_id, |slot| -> Result<bool> {
            self.recover(session_id, slot)?;
            let event = PipelineEvent::Reset {
                keep_classification,
                at: now,
            };
            Ok(self.apply_and_record(slot, session_id, &event)?.changed())
        });
        fail_open("reset", session_id, flatten(result)).unwrap_or(false)
    }

    /// Current snapshot, recovered from the journal when needed.
    pub fn status(&self, session_id: &str) -> Option<SessionPipelineState> {
        fail_open("status", session_id, self.current_state(session_id)).flatten()
    }

    /// Human-readable summary of a session.
    pub fn render_status(&self, state: &SessionPipelineState) -> String {
        let mut lines = Vec::new();
        let kind = state
            .task_kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "unclassified".to_string());
        let mode = if state.cancelled {
            "cancelled"
        } else if state.meta.completed_at.is_some() {
            "complete"
        } else if state.pipeline_active {
            "active"
        } else {
            "idle"
        };
        lines.push(format!("session {}: {} ({})", state.session_id, kind, mode));

        let order = StageGraph::from_nodes(&state.dag)
            .and_then(|g| g.topological_order())
            .unwrap_or_else(|_| state.dag.keys().copied().collect());
        for stage in order {
            let record = state.record(stage);
            let status = record.map(|r| r.status).unwrap_or_default();
            let mut line = format!("  {:<6} {:<9}", stage.as_str(), status.to_string());
            if let Some(verdict) = record.and_then(|r| r.verdict) {
                line.push_str(&format!(" verdict={}", verdict));
            }
            if let Some(severity) = record.and_then(|r| r.severity) {
                line.push_str(&format!(" severity={}", severity));
            }
            let retries = record.map(|r| r.retries).unwrap_or(0);
            if retries > 0 {
                line.push_str(&format!(" retries={}", retries));
            }
            if state.active_stages.contains(&stage) {
                line.push_str(" (delegated)");
            }
            lines.push(line);
        }
        if let Some(classification) = &state.classification {
            for t in &classification.history {
                lines.push(format!(
                    "  upgraded {} -> {} at {}",
                    t.from,
                    t.to,
                    t.at.format("%H:%M:%S")
                ));
            }
        }
        lines.join("\n")
    }

    fn current_state(&self, session_id: &str) -> Result<Option<SessionPipelineState>> {
        let mut slot = self.store.load(session_id)?;
        self.recover(session_id, &mut slot)?;
        Ok(slot)
    }

    /// Rebuild a missing or discarded snapshot from the journal.
    fn recover(&self, session_id: &str, slot: &mut Option<SessionPipelineState>) -> Result<()> {
        if slot.is_some() || !self.config.journal {
            return Ok(());
        }
        let events = self.store.load_events(session_id)?;
        if events.is_empty() {
            return Ok(());
        }
        *slot = replay::replay(session_id, &events, &self.catalog, &self.config);
        shlog_warn!(
            "controller: rebuilt session {} from {} journal events",
            session_id,
            events.len()
        );
        Ok(())
    }

    fn apply_and_record(
        &self,
        slot: &mut Option<SessionPipelineState>,
        session_id: &str,
        event: &PipelineEvent,
    ) -> Result<Applied> {
        let applied = replay::apply(slot, session_id, event, &self.catalog, &self.config)?;
        if applied.changed() && self.config.journal {
            if let Err(e) = self.store.append_event(session_id, event) {
                shlog_warn!("controller: journal append failed for {}: {}", session_id, e);
            }
        }
        Ok(applied)
    }

    /// Delegations to capabilities outside the catalog are never gated.
    fn unmapped_delegation(&self, target: &str) -> Option<GateDecision> {
        if self.catalog.stage_for_capability(target).is_some() {
            return None;
        }
        shlog_debug!("controller: {}", Error::UnknownCapability(target.to_string()));
        Some(GateDecision::allow())
    }

    fn resolve_outcome(&self, report: &StageReport<'_>) -> StageOutcome {
        if let Some(ack) = report.ack {
            return ack.into();
        }
        let (mut found, mut severity) = report
            .last_message
            .map(verdict::parse_verdict)
            .unwrap_or((None, None));
        if found.is_none() {
            if let Some(path) = report.transcript {
                match verdict::last_assistant_message(path) {
                    Ok(Some(text)) => {
                        (found, severity) = verdict::parse_verdict(&text);
                    }
                    Ok(None) => {}
                    Err(e) => shlog_warn!(
                        "controller: unreadable transcript {}: {}",
                        path.display(),
                        e
                    ),
                }
            }
        }
        StageOutcome {
            verdict: found.unwrap_or(Verdict::Pass),
            severity,
        }
    }

    fn progress_message(&self, state: &SessionPipelineState, report: &AdvanceReport) -> String {
        let stage = report.stage;
        if let Some(retry) = report.retry {
            let severity = state
                .record(stage)
                .and_then(|r| r.severity)
                .map(|s| format!(" ({})", s))
                .unwrap_or_default();
            return format!(
                "[stagehand] {} reported FAIL{}. {} reopened for a fix (attempt {}/{}). Ready now: {}.",
                stage,
                severity,
                retry.reopened,
                retry.attempt,
                retry.max_retries,
                describe_ready(&dag::awaiting_delegation(state), &self.catalog)
            );
        }

        let mut message = match report.forced {
            Some(forced) => format!(
                "[stagehand] Warning: {} still fails after {} retries of {}; advancing anyway.",
                stage, forced.retries, forced.retried
            ),
            None => format!("[stagehand] {} completed ({}).", stage, report.verdict),
        };

        if report.pipeline_complete {
            let template = state.template_id().unwrap_or("pipeline");
            let failed: Vec<String> = state
                .stages
                .iter()
                .filter(|(_, r)| r.verdict == Some(Verdict::Fail))
                .map(|(s, _)| s.to_string())
                .collect();
            if failed.is_empty() {
                message.push_str(&format!(
                    " Pipeline '{}' complete: all stages passed.",
                    template
                ));
            } else {
                message.push_str(&format!(
                    " Pipeline '{}' complete with failing verdicts in: {}.",
                    template,
                    failed.join(", ")
                ));
            }
            return message;
        }

        let done = state.stages_with(StageStatus::Completed);
        message.push_str(&format!(" Done: {}.", join(&done)));
        if report.newly_ready.is_empty() {
            let waiting: Vec<Stage> = state.active_stages.clone();
            if !waiting.is_empty() {
                message.push_str(&format!(" Waiting on: {}.", join(&waiting)));
            }
        } else {
            message.push_str(&format!(
                " Delegate next: {}.",
                describe_ready(&report.newly_ready, &self.catalog)
            ));
        }
        message
    }

    fn reminder_message(&self, state: &SessionPipelineState, missing: &[Stage]) -> String {
        let template = state.template_id().unwrap_or("pipeline");
        format!(
            "[stagehand] Pipeline '{}' is unfinished. Outstanding: {}. Next: {}.",
            template,
            join(missing),
            describe_ready(&dag::awaiting_delegation(state), &self.catalog)
        )
    }

    fn resume_message(&self, state: &SessionPipelineState) -> String {
        let template = state.template_id().unwrap_or("pipeline");
        format!(
            "[stagehand] Resuming pipeline '{}'. Outstanding: {}. Next: {}.",
            template,
            join(&dag::outstanding(state)),
            describe_ready(&dag::awaiting_delegation(state), &self.catalog)
        )
    }
}

impl DelegateOutcome {
    fn into_decision(self) -> GateDecision {
        if self.allow {
            return GateDecision::allow();
        }
        GateDecision::block(
            gate::BlockReason::DependencyUnsatisfied,
            self.message.unwrap_or_default(),
        )
    }
}

fn flatten<T>(result: Result<Result<T>>) -> Result<T> {
    result.and_then(|inner| inner)
}

fn fail_open<T>(operation: &str, session_id: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            shlog_warn!(
                "controller: {} for session {} failed open: {}",
                operation,
                session_id,
                e
            );
            None
        }
    }
}

fn join(stages: &[Stage]) -> String {
    if stages.is_empty() {
        return "none".to_string();
    }
    stages
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}
