pub mod config;
pub mod core;
pub mod error;
pub mod hook;
pub mod log;
pub mod orchestration;
pub mod pipeline;
pub mod state;

pub use error::{Error, Result};
pub use orchestration::{Controller, PipelineCatalog};
pub use pipeline::SessionPipelineState;
