//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Controllers backed by a temporary state directory
//! - The DEV -> [REVIEW, TEST] -> DOCS review-loop template
//! - Delegating and reporting stages in one call

use std::collections::BTreeMap;
use std::path::PathBuf;

use tempfile::TempDir;

use stagehand::config::Config;
use stagehand::core::Stage;
use stagehand::orchestration::{
    Controller, PipelineCatalog, PipelineTemplate, StageReport, StageSpec,
};
use stagehand::pipeline::TaskKind;
use stagehand::state::FileStateStore;

/// Template id used by the review-loop fixture.
pub const REVIEW_LOOP: &str = "review-loop";

/// A controller whose state lives in a temporary directory.
pub struct TestHarness {
    /// Keeps the state directory alive.
    pub temp_dir: TempDir,
    pub controller: Controller<FileStateStore>,
}

impl TestHarness {
    /// Harness with the built-in catalog.
    pub fn new() -> Self {
        Self::with_catalog(PipelineCatalog::builtin().expect("built-in catalog"))
    }

    /// Harness whose refactor kind is rebound to DEV -> [REVIEW, TEST] -> DOCS.
    pub fn review_loop() -> Self {
        Self::with_catalog(review_loop_catalog())
    }

    pub fn with_catalog(catalog: PipelineCatalog) -> Self {
        Self::with_config(catalog, Config::default())
    }

    pub fn with_config(catalog: PipelineCatalog, config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileStateStore::new(temp_dir.path());
        let controller = Controller::new(store, catalog, config);
        Self {
            temp_dir,
            controller,
        }
    }

    /// Another controller over the same state directory, as a second hook process would see it.
    pub fn sibling_process(&self) -> Controller<FileStateStore> {
        Controller::new(
            FileStateStore::new(self.temp_dir.path()),
            self.controller.catalog().clone(),
            self.controller.config().clone(),
        )
    }

    pub fn snapshot_path(&self, session: &str) -> PathBuf {
        self.controller.store().snapshot_path(session)
    }

    pub fn journal_path(&self, session: &str) -> PathBuf {
        self.controller.store().journal_path(session)
    }

    /// Delegate the capability and report it back with `message`.
    pub fn run_stage(&self, session: &str, capability: &str, message: &str) -> Option<String> {
        let outcome = self.controller.on_delegate(session, capability, None);
        assert!(outcome.allow, "delegation to {} was blocked: {:?}", capability, outcome.message);
        self.controller.on_stage_complete(session, &report(capability, message))
    }
}

pub fn report<'a>(capability: &'a str, message: &'a str) -> StageReport<'a> {
    StageReport {
        agent_type: capability,
        last_message: Some(message),
        ..Default::default()
    }
}

pub fn review_loop_catalog() -> PipelineCatalog {
    let template = PipelineTemplate::materialize(
        REVIEW_LOOP,
        TaskKind::Refactor,
        &[
            StageSpec::new(Stage::Dev, &[]),
            StageSpec::new(Stage::Review, &[Stage::Dev]).fixed_by(Stage::Dev),
            StageSpec::new(Stage::Test, &[Stage::Dev]).fixed_by(Stage::Dev),
            StageSpec::new(Stage::Docs, &[Stage::Review, Stage::Test]),
        ],
        &BTreeMap::new(),
        |_| true,
    )
    .expect("review-loop template");
    PipelineCatalog::builtin()
        .expect("built-in catalog")
        .with_template(template)
}
