//! Stage data model for pipeline DAGs.
//!
//! A stage is one unit of pipeline work bound to a capability. Each session
//! keeps a `StageRecord` per stage tracking status, verdict and retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named pipeline stage.
///
/// Declaration order is the canonical display order; it is also a valid
/// topological order for every built-in template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Plan,
    Arch,
    Dev,
    Review,
    Test,
    Qa,
    E2e,
    Docs,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Plan,
        Stage::Arch,
        Stage::Dev,
        Stage::Review,
        Stage::Test,
        Stage::Qa,
        Stage::E2e,
        Stage::Docs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Plan => "PLAN",
            Stage::Arch => "ARCH",
            Stage::Dev => "DEV",
            Stage::Review => "REVIEW",
            Stage::Test => "TEST",
            Stage::Qa => "QA",
            Stage::E2e => "E2E",
            Stage::Docs => "DOCS",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == upper)
            .ok_or_else(|| crate::Error::Validation(format!("Unknown stage: {}", s)))
    }
}

/// Lifecycle status of a stage within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting on dependencies or delegation.
    #[default]
    Pending,
    /// Dependencies satisfied; the stage is expected to be delegated or is running.
    Active,
    /// Reported done.
    Completed,
    /// Satisfied without running (carried over from a previous pipeline).
    Skipped,
    /// Reported a failing verdict and is queued to run again.
    Failed,
}

impl StageStatus {
    /// Whether a dependency in this status unblocks its dependents.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }

    /// Whether the stage still has to run before the pipeline can finish.
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self,
            StageStatus::Pending | StageStatus::Active | StageStatus::Failed
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Active => write!(f, "active"),
            StageStatus::Completed => write!(f, "completed"),
            StageStatus::Skipped => write!(f, "skipped"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Pass/fail outcome reported by a stage's capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail => write!(f, "fail"),
        }
    }
}

/// Severity attached to a verdict, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
        }
    }
}

/// Outcome handed to the DAG engine when a stage reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOutcome {
    pub verdict: Verdict,
    pub severity: Option<Severity>,
}

impl StageOutcome {
    pub fn pass() -> Self {
        Self {
            verdict: Verdict::Pass,
            severity: None,
        }
    }

    pub fn fail(severity: Option<Severity>) -> Self {
        Self {
            verdict: Verdict::Fail,
            severity,
        }
    }
}

/// Per-session record of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Rollbacks of this stage requested by failing dependents (or itself).
    #[serde(default)]
    pub retries: u32,
    /// Failing verdicts this stage reported since it last completed.
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    pub fn skipped() -> Self {
        Self {
            status: StageStatus::Skipped,
            ..Self::default()
        }
    }

    pub fn complete(&mut self, outcome: StageOutcome, at: DateTime<Utc>) {
        self.status = StageStatus::Completed;
        self.verdict = Some(outcome.verdict);
        self.severity = outcome.severity;
        self.consecutive_failures = 0;
        self.completed_at = Some(at);
    }

    pub fn fail(&mut self, outcome: StageOutcome) {
        self.status = StageStatus::Failed;
        self.verdict = Some(outcome.verdict);
        self.severity = outcome.severity;
        self.consecutive_failures += 1;
        self.completed_at = None;
    }

    /// Explicit retry transition: the only way a stage moves back to pending.
    pub fn reopen(&mut self) {
        self.status = StageStatus::Pending;
        self.completed_at = None;
        self.retries += 1;
    }
}
