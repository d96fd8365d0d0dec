//! Core pipeline type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Stage;

/// Kind of task a session is working on.
///
/// Declaration order is the priority rank: a higher rank governs a larger
/// pipeline, and a session may only move up the ranking mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Research,
    Quickfix,
    Test,
    Bugfix,
    Refactor,
    Tdd,
    Feature,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::Research,
        TaskKind::Quickfix,
        TaskKind::Test,
        TaskKind::Bugfix,
        TaskKind::Refactor,
        TaskKind::Tdd,
        TaskKind::Feature,
    ];

    /// Fixed priority rank (research = 0 .. feature = 6).
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Research => "research",
            TaskKind::Quickfix => "quickfix",
            TaskKind::Test => "test",
            TaskKind::Bugfix => "bugfix",
            TaskKind::Refactor => "refactor",
            TaskKind::Tdd => "tdd",
            TaskKind::Feature => "feature",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let kind = match lower.as_str() {
            "quick-fix" | "quick_fix" | "hotfix" => TaskKind::Quickfix,
            "bug" | "fix" => TaskKind::Bugfix,
            "tests" | "testing" => TaskKind::Test,
            other => TaskKind::ALL
                .into_iter()
                .find(|kind| kind.as_str() == other)
                .ok_or_else(|| crate::Error::Validation(format!("Unknown task kind: {}", s)))?,
        };
        Ok(kind)
    }
}

/// How a classification was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationSource {
    /// Layer 1: an explicit `[pipeline:<id>]` tag.
    Explicit,
    /// Layer 2: heuristic keyword matching.
    Inferred,
}

impl std::fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassificationSource::Explicit => write!(f, "explicit"),
            ClassificationSource::Inferred => write!(f, "inferred"),
        }
    }
}

/// One upgrade recorded in the classification history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationTransition {
    pub from: TaskKind,
    pub to: TaskKind,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub skipped_stages: Vec<Stage>,
}

/// The decision of which template governs a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub template_id: String,
    pub task_kind: TaskKind,
    pub source: ClassificationSource,
    #[serde(default)]
    pub history: Vec<ClassificationTransition>,
}
