//! Core data structures for pipeline stages and their dependency graph.

pub mod dag;
pub mod stage;

pub use dag::{AdvanceReport, DagNode, RetryExhausted, RetryScheduled, StageGraph};
pub use stage::{Severity, Stage, StageOutcome, StageRecord, StageStatus, Verdict};
