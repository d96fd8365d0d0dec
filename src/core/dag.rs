//! Stage DAG (Directed Acyclic Graph) engine.
//!
//! `StageGraph` validates a stage dependency map with petgraph and yields a
//! topological order. The free functions below are the DAG engine proper:
//! they read and transition the stage records of a `SessionPipelineState`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::core::stage::{Stage, StageOutcome, StageStatus, Verdict};
use crate::error::{Error, Result};
use crate::pipeline::SessionPipelineState;
use crate::{shlog_debug, shlog_warn};

/// Dependency entry for one stage of a materialized DAG.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagNode {
    /// Stages that must be completed or skipped first.
    #[serde(default)]
    pub deps: Vec<Stage>,
    /// Upstream stage reopened when this stage reports a failing verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_target: Option<Stage>,
}

impl DagNode {
    pub fn new(deps: &[Stage]) -> Self {
        Self {
            deps: deps.to_vec(),
            fix_target: None,
        }
    }

    pub fn with_fix_target(mut self, target: Stage) -> Self {
        self.fix_target = Some(target);
        self
    }
}

/// Validated stage graph.
///
/// Edges point from a dependency to its dependent, so a topological sort
/// lists every stage after all of its dependencies.
pub struct StageGraph {
    graph: DiGraph<Stage, ()>,
    index: HashMap<Stage, NodeIndex>,
}

impl StageGraph {
    /// Build a graph from a dependency map.
    ///
    /// # Errors
    /// Returns `Error::Validation` when a dependency names a stage that is not
    /// in the map, and `Error::Cycle` when the dependencies are cyclic.
    pub fn from_nodes(nodes: &BTreeMap<Stage, DagNode>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for stage in nodes.keys() {
            index.insert(*stage, graph.add_node(*stage));
        }

        for (stage, node) in nodes {
            for dep in &node.deps {
                let from = index.get(dep).ok_or_else(|| {
                    Error::Validation(format!("Stage {} depends on unknown stage {}", stage, dep))
                })?;
                graph.add_edge(*from, index[stage], ());
            }
        }

        let dag = Self { graph, index };
        dag.topological_order()?;
        Ok(dag)
    }

    /// Stages in dependency order, siblings in stage order.
    pub fn topological_order(&self) -> Result<Vec<Stage>> {
        toposort(&self.graph, None).map_err(|cycle| Error::Cycle(self.graph[cycle.node_id()]))?;

        let mut indegree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|i| (i, self.graph.neighbors_directed(i, Direction::Incoming).count()))
            .collect();
        let mut ready: BTreeSet<Stage> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| self.graph[*i])
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(stage) = ready.pop_first() {
            order.push(stage);
            for next in self
                .graph
                .neighbors_directed(self.index[&stage], Direction::Outgoing)
            {
                if let Some(degree) = indegree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(self.graph[next]);
                    }
                }
            }
        }
        Ok(order)
    }

    /// Stages that directly depend on `stage`.
    pub fn dependents(&self, stage: Stage) -> Vec<Stage> {
        match self.index.get(&stage) {
            Some(&i) => self
                .graph
                .neighbors_directed(i, Direction::Outgoing)
                .map(|n| self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every stage reachable downstream of `stage`.
    pub fn transitive_dependents(&self, stage: Stage) -> HashSet<Stage> {
        let mut seen = HashSet::new();
        let mut stack = self.dependents(stage);
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.dependents(next));
            }
        }
        seen
    }

    pub fn stage_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }
}

impl std::fmt::Debug for StageGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageGraph")
            .field("stages", &self.stage_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

/// Result of `advance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvanceReport {
    pub stage: Stage,
    pub verdict: Verdict,
    /// Stages that became active because their dependencies are now met.
    pub newly_ready: Vec<Stage>,
    /// Set when a failing verdict reopened a stage for another attempt.
    pub retry: Option<RetryScheduled>,
    /// Set when the retry bound was hit and the stage was pushed through anyway.
    pub forced: Option<RetryExhausted>,
    pub pipeline_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryScheduled {
    /// Stage reopened to address the failure (the fix target, or the stage itself).
    pub reopened: Stage,
    pub attempt: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryExhausted {
    pub retried: Stage,
    pub retries: u32,
}

/// Dependencies of `stage` that are neither completed nor skipped.
///
/// Dependencies missing from the materialized DAG count as satisfied.
pub fn unmet_dependencies(state: &SessionPipelineState, stage: Stage) -> Vec<Stage> {
    let Some(node) = state.dag.get(&stage) else {
        return Vec::new();
    };
    node.deps
        .iter()
        .copied()
        .filter(|dep| state.dag.contains_key(dep))
        .filter(|dep| {
            !state
                .status(*dep)
                .map(|s| s.satisfies_dependents())
                .unwrap_or(false)
        })
        .collect()
}

/// True iff `stage` is in the DAG and every dependency is completed or skipped.
pub fn is_ready(state: &SessionPipelineState, stage: Stage) -> bool {
    state.dag.contains_key(&stage) && unmet_dependencies(state, stage).is_empty()
}

/// Pending (or failed, awaiting re-run) stages that are ready and not yet active.
pub fn ready_set(state: &SessionPipelineState) -> Vec<Stage> {
    ordered_stages(state)
        .into_iter()
        .filter(|stage| {
            matches!(
                state.status(*stage),
                Some(StageStatus::Pending) | Some(StageStatus::Failed) | None
            )
        })
        .filter(|stage| !state.active_stages.contains(stage))
        .filter(|stage| is_ready(state, *stage))
        .collect()
}

/// Stages the orchestrator should hand out next: the ready set plus stages
/// activated by `advance` that have not been delegated yet.
pub fn awaiting_delegation(state: &SessionPipelineState) -> Vec<Stage> {
    ordered_stages(state)
        .into_iter()
        .filter(|stage| !state.active_stages.contains(stage))
        .filter(|stage| match state.status(*stage) {
            Some(StageStatus::Active) => true,
            Some(StageStatus::Pending) | Some(StageStatus::Failed) | None => {
                is_ready(state, *stage)
            }
            _ => false,
        })
        .collect()
}

/// Every non-skipped stage is completed.
pub fn is_complete(state: &SessionPipelineState) -> bool {
    state.dag.keys().all(|stage| {
        matches!(
            state.status(*stage),
            Some(StageStatus::Completed) | Some(StageStatus::Skipped)
        )
    })
}

/// Stages that still have to run, in DAG order.
pub fn outstanding(state: &SessionPipelineState) -> Vec<Stage> {
    ordered_stages(state)
        .into_iter()
        .filter(|stage| {
            state
                .status(*stage)
                .map(|s| s.is_outstanding())
                .unwrap_or(true)
        })
        .collect()
}

/// Arm a freshly installed pipeline and return the stages that may be delegated.
///
/// Stages stay pending until delegated; only `advance` activates dependents.
/// A DAG whose stages were all carried over completes immediately.
pub fn start(state: &mut SessionPipelineState, now: DateTime<Utc>) -> Vec<Stage> {
    state.pipeline_active = state.is_enforced();
    finish_if_complete(state, now);
    ready_set(state)
}

/// Mark `stage` as delegated.
///
/// Returns `true` if the stage was not already in flight.
///
/// # Errors
/// `Error::Validation` when the stage is not part of the DAG, and
/// `Error::DependencyUnsatisfied` when its dependencies are not met.
pub fn activate(state: &mut SessionPipelineState, stage: Stage) -> Result<bool> {
    if !state.dag.contains_key(&stage) {
        return Err(Error::Validation(format!(
            "Stage {} is not part of this pipeline",
            stage
        )));
    }
    let missing = unmet_dependencies(state, stage);
    if !missing.is_empty() {
        return Err(Error::DependencyUnsatisfied { stage, missing });
    }

    let record = state.record_mut(stage);
    if matches!(record.status, StageStatus::Pending | StageStatus::Failed) {
        record.status = StageStatus::Active;
    }

    state.delegation_window_open = true;
    if state.active_stages.contains(&stage) {
        return Ok(false);
    }
    state.active_stages.push(stage);
    shlog_debug!("dag: {} delegated, in flight: {:?}", stage, state.active_stages);
    Ok(true)
}

/// Record a stage's outcome and move the pipeline forward.
///
/// On a failing verdict the stage's fix target (or the stage itself when it
/// has none) is reopened and its retry counter incremented. Once the failing
/// stage itself has failed `max_retries` times in a row it is completed anyway
/// and the report carries `forced`. On success the newly ready stages are
/// activated.
///
/// # Errors
/// `Error::Validation` when the stage is not part of the DAG.
pub fn advance(
    state: &mut SessionPipelineState,
    stage: Stage,
    outcome: StageOutcome,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<AdvanceReport> {
    let node = state.dag.get(&stage).cloned().ok_or_else(|| {
        Error::Validation(format!("Stage {} is not part of this pipeline", stage))
    })?;

    state.active_stages.retain(|s| *s != stage);
    state.delegation_window_open = !state.active_stages.is_empty();

    let mut report = AdvanceReport {
        stage,
        verdict: outcome.verdict,
        newly_ready: Vec::new(),
        retry: None,
        forced: None,
        pipeline_complete: false,
    };

    if outcome.verdict == Verdict::Fail {
        let target = node
            .fix_target
            .filter(|t| state.dag.contains_key(t))
            .unwrap_or(stage);
        let retries = state.record(stage).map(|r| r.consecutive_failures).unwrap_or(0);

        if retries < max_retries {
            state.record_mut(stage).fail(outcome);
            if target == stage {
                state.record_mut(stage).retries += 1;
            } else {
                state.record_mut(target).reopen();
                state.active_stages.retain(|s| *s != target);
                demote_dependents(state, target);
            }
            state.delegation_window_open = !state.active_stages.is_empty();
            report.retry = Some(RetryScheduled {
                reopened: target,
                attempt: retries + 1,
                max_retries,
            });
            shlog_debug!(
                "dag: {} failed, reopened {} (attempt {}/{})",
                stage,
                target,
                retries + 1,
                max_retries
            );
            return Ok(report);
        }

        shlog_warn!(
            "dag: {} failed {} times in a row (fix target {}), advancing anyway",
            stage,
            retries,
            target
        );
        report.forced = Some(RetryExhausted {
            retried: target,
            retries,
        });
    }

    state.record_mut(stage).complete(outcome, now);

    report.newly_ready = ready_set(state);
    for next in &report.newly_ready {
        state.record_mut(*next).status = StageStatus::Active;
    }
    report.pipeline_complete = finish_if_complete(state, now);
    Ok(report)
}

/// Clear the DAG, stage records and classification.
pub fn reset(state: &mut SessionPipelineState) {
    reset_keeping_classification(state);
    state.classification = None;
}

/// Clear the DAG and stage records but keep the classification, for a
/// deliberate restart without re-deriving the task kind.
pub fn reset_keeping_classification(state: &mut SessionPipelineState) {
    state.dag.clear();
    state.stages.clear();
    state.active_stages.clear();
    state.pipeline_active = false;
    state.delegation_window_open = false;
    state.cancelled = false;
    state.meta.completed_at = None;
}

fn finish_if_complete(state: &mut SessionPipelineState, now: DateTime<Utc>) -> bool {
    if !state.is_enforced() || !is_complete(state) {
        return false;
    }
    state.pipeline_active = false;
    state.active_stages.clear();
    state.delegation_window_open = false;
    if state.meta.completed_at.is_none() {
        state.meta.completed_at = Some(now);
    }
    true
}

/// Stages activated but not delegated lose their activation when an upstream
/// stage is reopened, so no active stage ever has unmet dependencies.
fn demote_dependents(state: &mut SessionPipelineState, reopened: Stage) {
    let Ok(graph) = StageGraph::from_nodes(&state.dag) else {
        return;
    };
    for stage in graph.transitive_dependents(reopened) {
        if state.active_stages.contains(&stage) {
            continue;
        }
        let record = state.record_mut(stage);
        if record.status == StageStatus::Active {
            record.status = StageStatus::Pending;
        }
    }
}

fn ordered_stages(state: &SessionPipelineState) -> Vec<Stage> {
    StageGraph::from_nodes(&state.dag)
        .and_then(|g| g.topological_order())
        .unwrap_or_else(|_| state.dag.keys().copied().collect())
}
