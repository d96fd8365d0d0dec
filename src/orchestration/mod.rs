//! Orchestration layer for stagehand.
//!
//! The catalog resolves task kinds to stage templates, the classifier picks
//! the template for a session, the gate decides which actions may run, and
//! the controller ties them to persisted session state.

pub mod catalog;
pub mod classifier;
pub mod controller;
pub mod gate;
pub mod replay;
pub mod verdict;

pub use catalog::{
    bare_capability_id, Capability, CapabilityKind, CapabilityRegistry, ManifestRegistry,
    PipelineCatalog, PipelineTemplate, StageBinding, StageSpec, StaticRegistry,
};
pub use classifier::{classify, ClassifyOutcome, Directive, Intent};
pub use controller::{Controller, DelegateOutcome, StageReport, TurnEndOutcome};
pub use gate::{evaluate, ActionKind, BlockReason, Decision, GateDecision};
pub use replay::{apply, replay, Applied};
pub use verdict::{parse_verdict, CompletionAck};
