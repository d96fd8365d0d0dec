//! Persistence for session snapshots and event journals.
//!
//! The snapshot is the sole source of truth between hook invocations. Every
//! read-modify-write goes through `StateStore::transaction`, which the file
//! adapter guards with a per-session lock file and an atomic rename.

pub mod journal;
mod store;

pub use journal::PipelineEvent;
pub use store::{sanitize_session_id, FileStateStore, MemoryStateStore, StateStore};
