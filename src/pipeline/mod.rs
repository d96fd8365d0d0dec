//! Session pipeline state and classification types.

mod state;
mod types;

pub use state::{PipelineMeta, SessionPipelineState, SCHEMA_VERSION};
pub use types::{Classification, ClassificationSource, ClassificationTransition, TaskKind};
