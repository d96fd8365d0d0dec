//! Per-session pipeline snapshot.
//!
//! `SessionPipelineState` is the single source of truth shared by every hook
//! process of a session. It is serialized as camelCase JSON so that passive
//! readers (dashboards, notifiers) can consume it without this crate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{DagNode, Stage, StageRecord, StageStatus};
use crate::orchestration::PipelineTemplate;

use super::{Classification, TaskKind};

/// Current snapshot schema. Snapshots with a newer version are treated as corrupt.
pub const SCHEMA_VERSION: u32 = 1;

/// Timestamps for the snapshot as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMeta {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the whole DAG reached a terminal state; drives the cooldown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPipelineState {
    pub session_id: String,
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub dag: BTreeMap<Stage, DagNode>,
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageRecord>,
    #[serde(default)]
    pub pipeline_active: bool,
    /// Stages delegated and not yet reported complete.
    #[serde(default)]
    pub active_stages: Vec<Stage>,
    #[serde(default)]
    pub delegation_window_open: bool,
    #[serde(default)]
    pub cancelled: bool,
    pub meta: PipelineMeta,
}

impl SessionPipelineState {
    /// Create an unclassified state for a session.
    pub fn new(session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            schema_version: SCHEMA_VERSION,
            classification: None,
            dag: BTreeMap::new(),
            stages: BTreeMap::new(),
            pipeline_active: false,
            active_stages: Vec::new(),
            delegation_window_open: false,
            cancelled: false,
            meta: PipelineMeta {
                created_at: now,
                updated_at: now,
                completed_at: None,
            },
        }
    }

    /// A pipeline is enforced once it has at least one stage.
    pub fn is_enforced(&self) -> bool {
        !self.dag.is_empty()
    }

    pub fn task_kind(&self) -> Option<TaskKind> {
        self.classification.as_ref().map(|c| c.task_kind)
    }

    pub fn template_id(&self) -> Option<&str> {
        self.classification.as_ref().map(|c| c.template_id.as_str())
    }

    pub fn status(&self, stage: Stage) -> Option<StageStatus> {
        self.stages.get(&stage).map(|r| r.status)
    }

    pub fn record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.get(&stage)
    }

    pub fn record_mut(&mut self, stage: Stage) -> &mut StageRecord {
        self.stages.entry(stage).or_default()
    }

    pub fn retries(&self, stage: Stage) -> u32 {
        self.stages.get(&stage).map(|r| r.retries).unwrap_or(0)
    }

    /// Replace the DAG with a template's graph, every stage pending.
    pub fn install_template(&mut self, template: &PipelineTemplate) {
        self.dag = template.dag.clone();
        self.stages = template
            .dag
            .keys()
            .map(|stage| (*stage, StageRecord::default()))
            .collect();
        self.active_stages.clear();
        self.delegation_window_open = false;
        self.pipeline_active = !self.dag.is_empty();
        self.meta.completed_at = None;
    }

    /// Stages with the given status, in stage order.
    pub fn stages_with(&self, status: StageStatus) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(s, _)| *s)
            .collect()
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.meta.updated_at = now;
    }
}
