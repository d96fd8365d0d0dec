use std::path::PathBuf;

use thiserror::Error;

use crate::core::Stage;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("State file {path} is corrupt: {reason}")]
    StateCorrupt { path: PathBuf, reason: String },

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Stage {stage} is waiting on: {}", join_stages(.missing))]
    DependencyUnsatisfied { stage: Stage, missing: Vec<Stage> },

    #[error("Dependency cycle detected at stage {0}")]
    Cycle(Stage),

    #[error("Timed out after {waited:?} waiting for lock {path}")]
    LockTimeout {
        path: PathBuf,
        waited: std::time::Duration,
    },
}

fn join_stages(stages: &[Stage]) -> String {
    stages
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
