//! Event application and journal replay.
//!
//! Every state change the controller makes goes through `apply`, so folding a
//! session's journal with `replay` reproduces the snapshot it would have
//! written.

use crate::config::Config;
use crate::core::{dag, AdvanceReport, Stage, StageOutcome, StageStatus};
use crate::pipeline::SessionPipelineState;
use crate::state::PipelineEvent;
use crate::{shlog_debug, shlog_warn, Result};

use super::catalog::PipelineCatalog;
use super::classifier::{self, Directive};

/// What applying an event did to the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Unchanged,
    SessionCreated,
    Classified(Directive),
    Delegated { stage: Stage, newly: bool },
    Advanced(AdvanceReport),
    Reset,
}

impl Applied {
    pub fn changed(&self) -> bool {
        !matches!(self, Applied::Unchanged)
    }
}

/// Apply one event to a session slot.
///
/// # Errors
/// `Error::DependencyUnsatisfied` for a delegation whose stage is not ready;
/// template resolution errors from classification.
pub fn apply(
    slot: &mut Option<SessionPipelineState>,
    session_id: &str,
    event: &PipelineEvent,
    catalog: &PipelineCatalog,
    config: &Config,
) -> Result<Applied> {
    let at = event.at();
    let applied = match event {
        PipelineEvent::SessionStarted { .. } => {
            if slot.is_some() {
                Applied::Unchanged
            } else {
                *slot = Some(SessionPipelineState::new(session_id, at));
                Applied::SessionCreated
            }
        }
        PipelineEvent::Classified { text, .. } => {
            let state = slot.get_or_insert_with(|| SessionPipelineState::new(session_id, at));
            match classifier::classify(state, text, at, catalog, config.cooldown())?.directive {
                Some(directive) => Applied::Classified(directive),
                None => Applied::Unchanged,
            }
        }
        PipelineEvent::Delegated { capability, .. } => {
            let Some(state) = slot.as_mut() else {
                return Ok(Applied::Unchanged);
            };
            match governed_stage(state, capability, catalog) {
                Some(stage) if !dag::is_complete(state) => {
                    let newly = dag::activate(state, stage)?;
                    Applied::Delegated { stage, newly }
                }
                _ => Applied::Unchanged,
            }
        }
        PipelineEvent::StageReported {
            capability,
            verdict,
            severity,
            ..
        } => {
            let Some(state) = slot.as_mut() else {
                return Ok(Applied::Unchanged);
            };
            let Some(stage) = governed_stage(state, capability, catalog) else {
                return Ok(Applied::Unchanged);
            };
            let in_flight = state.active_stages.contains(&stage)
                || state.status(stage) == Some(StageStatus::Active);
            if !state.pipeline_active || !in_flight {
                shlog_debug!("replay: ignoring report from {} ({} not in flight)", capability, stage);
                return Ok(Applied::Unchanged);
            }
            let outcome = StageOutcome {
                verdict: *verdict,
                severity: *severity,
            };
            Applied::Advanced(dag::advance(state, stage, outcome, config.max_retries, at)?)
        }
        PipelineEvent::Cancelled { .. } => {
            let Some(state) = slot.as_mut() else {
                return Ok(Applied::Unchanged);
            };
            match classifier::cancel(state).directive {
                Some(directive) => Applied::Classified(directive),
                None => Applied::Unchanged,
            }
        }
        PipelineEvent::Reset {
            keep_classification,
            ..
        } => {
            let Some(state) = slot.as_mut() else {
                return Ok(Applied::Unchanged);
            };
            restart(state, *keep_classification, catalog, at)?;
            Applied::Reset
        }
    };

    if applied.changed() {
        if let Some(state) = slot.as_mut() {
            state.touch(at);
        }
    }
    Ok(applied)
}

/// Rebuild a session from its journal.
///
/// Events that fail to apply are skipped, as they were when first handled.
pub fn replay(
    session_id: &str,
    events: &[PipelineEvent],
    catalog: &PipelineCatalog,
    config: &Config,
) -> Option<SessionPipelineState> {
    let mut slot = None;
    for event in events {
        if let Err(e) = apply(&mut slot, session_id, event, catalog, config) {
            shlog_warn!("replay: skipping {:?}: {}", event, e);
        }
    }
    slot
}

/// Stage governed by the session's pipeline for a capability, if any.
fn governed_stage(
    state: &SessionPipelineState,
    capability: &str,
    catalog: &PipelineCatalog,
) -> Option<Stage> {
    if !state.is_enforced() || state.cancelled {
        return None;
    }
    catalog
        .stage_for_capability(capability)
        .filter(|stage| state.dag.contains_key(stage))
}

/// Clear progress. With `keep_classification` the same template is
/// reinstalled and started again.
fn restart(
    state: &mut SessionPipelineState,
    keep_classification: bool,
    catalog: &PipelineCatalog,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    if !keep_classification {
        dag::reset(state);
        return Ok(());
    }
    dag::reset_keeping_classification(state);
    if let Some(kind) = state.task_kind() {
        state.install_template(catalog.resolve_template(kind)?);
        dag::start(state, now);
    }
    Ok(())
}
