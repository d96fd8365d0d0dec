//! Pipeline catalog: templates, stage bindings and capability discovery.
//!
//! The catalog never scans anything itself. It asks a `CapabilityRegistry`
//! which agents and skills are installed and intersects that with the static
//! per-task-kind stage lists below. A stage whose capability is missing is
//! dropped and its dependents inherit its dependencies.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{DagNode, Stage, StageGraph};
use crate::error::{Error, Result};
use crate::pipeline::TaskKind;
use crate::{shlog_debug, shlog_trace};

/// Whether a capability is a sub-agent or a skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Agent,
    Skill,
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityKind::Agent => write!(f, "agent"),
            CapabilityKind::Skill => write!(f, "skill"),
        }
    }
}

/// An installed agent or skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Bare identifier, namespace stripped.
    pub id: String,
    pub kind: CapabilityKind,
    /// Plugin that provides it, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl Capability {
    pub fn agent(id: &str) -> Self {
        Self {
            id: bare_capability_id(id),
            kind: CapabilityKind::Agent,
            provider: None,
        }
    }

    pub fn skill(id: &str) -> Self {
        Self {
            id: bare_capability_id(id),
            kind: CapabilityKind::Skill,
            provider: None,
        }
    }
}

/// Source of installed capabilities.
pub trait CapabilityRegistry {
    fn discover(&self) -> Result<Vec<Capability>>;
}

/// Fixed capability list.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    capabilities: Vec<Capability>,
}

impl StaticRegistry {
    pub fn new(capabilities: Vec<Capability>) -> Self {
        Self { capabilities }
    }

    /// Every capability the built-in templates bind to.
    pub fn builtin() -> Self {
        Self::new(
            Stage::ALL
                .into_iter()
                .map(|stage| default_binding(stage).capability())
                .collect(),
        )
    }
}

impl CapabilityRegistry for StaticRegistry {
    fn discover(&self) -> Result<Vec<Capability>> {
        Ok(self.capabilities.clone())
    }
}

/// Scans plugin directories for agent and skill manifests.
///
/// Each root is treated both as a plugin and as a directory of plugins:
/// `<root>/agents/<name>.md`, `<root>/skills/<name>/SKILL.md` and the same
/// layout one level down under `<root>/<plugin>/`.
#[derive(Debug, Clone)]
pub struct ManifestRegistry {
    roots: Vec<PathBuf>,
}

impl ManifestRegistry {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    fn scan_plugin(dir: &Path, provider: Option<&str>, out: &mut Vec<Capability>) -> Result<()> {
        let agents = dir.join("agents");
        if agents.is_dir() {
            for entry in fs::read_dir(&agents)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                let name = manifest_name(&path).or_else(|| {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(|s| s.to_string())
                });
                if let Some(name) = name {
                    shlog_trace!("catalog: agent {} at {}", name, path.display());
                    out.push(Capability {
                        id: bare_capability_id(&name),
                        kind: CapabilityKind::Agent,
                        provider: provider.map(|p| p.to_string()),
                    });
                }
            }
        }

        let skills = dir.join("skills");
        if skills.is_dir() {
            for entry in fs::read_dir(&skills)? {
                let path = entry?.path();
                let manifest = path.join("SKILL.md");
                if !manifest.is_file() {
                    continue;
                }
                let name = manifest_name(&manifest).or_else(|| {
                    path.file_name()
                        .and_then(|s| s.to_str())
                        .map(|s| s.to_string())
                });
                if let Some(name) = name {
                    shlog_trace!("catalog: skill {} at {}", name, manifest.display());
                    out.push(Capability {
                        id: bare_capability_id(&name),
                        kind: CapabilityKind::Skill,
                        provider: provider.map(|p| p.to_string()),
                    });
                }
            }
        }
        Ok(())
    }
}

impl CapabilityRegistry for ManifestRegistry {
    fn discover(&self) -> Result<Vec<Capability>> {
        let mut found = Vec::new();
        for root in &self.roots {
            if !root.is_dir() {
                shlog_debug!("catalog: plugin root {} missing, skipping", root.display());
                continue;
            }
            Self::scan_plugin(root, None, &mut found)?;
            for entry in fs::read_dir(root)? {
                let path = entry?.path();
                if path.is_dir() {
                    let provider = path.file_name().and_then(|n| n.to_str()).map(str::to_string);
                    Self::scan_plugin(&path, provider.as_deref(), &mut found)?;
                }
            }
        }
        shlog_debug!("catalog: discovered {} capabilities", found.len());
        Ok(found)
    }
}

/// Reads `name:` from a manifest's YAML front matter.
fn manifest_name(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    let mut lines = contents.lines();
    if lines.next()?.trim() != "---" {
        return None;
    }
    lines
        .take_while(|line| line.trim() != "---")
        .find_map(|line| line.trim().strip_prefix("name:"))
        .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|v| !v.is_empty())
}

/// Strip a `plugin:` namespace and normalise case.
pub fn bare_capability_id(id: &str) -> String {
    id.rsplit(':').next().unwrap_or(id).trim().to_ascii_lowercase()
}

/// Capability bound to a stage, with its display label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageBinding {
    pub required_capability: String,
    pub kind: CapabilityKind,
    pub display_label: String,
}

impl StageBinding {
    fn new(kind: CapabilityKind, capability: &str, label: &str) -> Self {
        Self {
            required_capability: capability.to_string(),
            kind,
            display_label: label.to_string(),
        }
    }

    pub fn capability(&self) -> Capability {
        Capability {
            id: self.required_capability.clone(),
            kind: self.kind,
            provider: None,
        }
    }
}

fn default_binding(stage: Stage) -> StageBinding {
    use CapabilityKind::{Agent, Skill};
    match stage {
        Stage::Plan => StageBinding::new(Agent, "planner", "Planning"),
        Stage::Arch => StageBinding::new(Agent, "architect", "Architecture"),
        Stage::Dev => StageBinding::new(Agent, "developer", "Implementation"),
        Stage::Review => StageBinding::new(Agent, "code-reviewer", "Code review"),
        Stage::Test => StageBinding::new(Agent, "test-engineer", "Testing"),
        Stage::Qa => StageBinding::new(Agent, "qa-engineer", "Quality assurance"),
        Stage::E2e => StageBinding::new(Skill, "e2e-testing", "End-to-end tests"),
        Stage::Docs => StageBinding::new(Agent, "tech-writer", "Documentation"),
    }
}

/// One stage of a template blueprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub stage: Stage,
    pub deps: Vec<Stage>,
    pub fix_target: Option<Stage>,
}

impl StageSpec {
    pub fn new(stage: Stage, deps: &[Stage]) -> Self {
        Self {
            stage,
            deps: deps.to_vec(),
            fix_target: None,
        }
    }

    pub fn fixed_by(mut self, target: Stage) -> Self {
        self.fix_target = Some(target);
        self
    }
}

/// Static stage list for each task kind, in dependency order.
fn blueprint(kind: TaskKind) -> Vec<StageSpec> {
    use Stage::*;
    match kind {
        TaskKind::Research => Vec::new(),
        TaskKind::Quickfix => vec![StageSpec::new(Dev, &[])],
        TaskKind::Test => vec![StageSpec::new(Test, &[])],
        TaskKind::Bugfix => vec![
            StageSpec::new(Dev, &[]),
            StageSpec::new(Test, &[Dev]).fixed_by(Dev),
        ],
        TaskKind::Refactor => vec![
            StageSpec::new(Arch, &[]),
            StageSpec::new(Dev, &[Arch]),
            StageSpec::new(Review, &[Dev]).fixed_by(Dev),
            StageSpec::new(Test, &[Dev]).fixed_by(Dev),
        ],
        TaskKind::Tdd => vec![
            StageSpec::new(Plan, &[]),
            StageSpec::new(Test, &[Plan]),
            StageSpec::new(Dev, &[Test]),
            StageSpec::new(Review, &[Dev]).fixed_by(Dev),
        ],
        TaskKind::Feature => vec![
            StageSpec::new(Plan, &[]),
            StageSpec::new(Arch, &[Plan]),
            StageSpec::new(Dev, &[Arch]),
            StageSpec::new(Review, &[Dev]).fixed_by(Dev),
            StageSpec::new(Test, &[Dev]).fixed_by(Dev),
            StageSpec::new(Qa, &[Review, Test]).fixed_by(Dev),
            StageSpec::new(E2e, &[Qa]).fixed_by(Dev),
            StageSpec::new(Docs, &[E2e]),
        ],
    }
}

/// A named, immutable DAG of stages for a task kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTemplate {
    pub id: String,
    pub task_kind: TaskKind,
    /// Stages in topological order.
    pub stages: Vec<Stage>,
    pub bindings: BTreeMap<Stage, StageBinding>,
    pub dag: BTreeMap<Stage, DagNode>,
}

impl PipelineTemplate {
    /// Materialize a blueprint, keeping only stages for which `installed` holds.
    ///
    /// Specs must be listed so that every dependency precedes its dependents.
    ///
    /// # Errors
    /// `Error::Validation` for an out-of-order or unknown dependency and
    /// `Error::Cycle` if the resulting graph is cyclic.
    pub fn materialize(
        id: &str,
        task_kind: TaskKind,
        specs: &[StageSpec],
        bindings: &BTreeMap<Stage, StageBinding>,
        installed: impl Fn(Stage) -> bool,
    ) -> Result<Self> {
        let mut effective: HashMap<Stage, Vec<Stage>> = HashMap::new();
        let mut dag = BTreeMap::new();

        for spec in specs {
            let mut deps = Vec::new();
            for dep in &spec.deps {
                if dag.contains_key(dep) {
                    deps.push(*dep);
                } else {
                    let inherited = effective.get(dep).ok_or_else(|| {
                        Error::Validation(format!(
                            "Template {}: stage {} depends on {} which is not declared before it",
                            id, spec.stage, dep
                        ))
                    })?;
                    deps.extend(inherited.iter().copied());
                }
            }
            deps.sort();
            deps.dedup();
            effective.insert(spec.stage, deps.clone());

            if installed(spec.stage) {
                dag.insert(
                    spec.stage,
                    DagNode {
                        deps,
                        fix_target: spec.fix_target,
                    },
                );
            } else {
                shlog_debug!(
                    "catalog: template {} omits {} (capability not installed)",
                    id,
                    spec.stage
                );
            }
        }

        let present: Vec<Stage> = dag.keys().copied().collect();
        for node in dag.values_mut() {
            node.fix_target = node.fix_target.filter(|t| present.contains(t));
        }

        let stages = StageGraph::from_nodes(&dag)?.topological_order()?;
        let bindings = stages
            .iter()
            .map(|s| (*s, bindings.get(s).cloned().unwrap_or_else(|| default_binding(*s))))
            .collect();

        Ok(Self {
            id: id.to_string(),
            task_kind,
            stages,
            bindings,
            dag,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn label(&self, stage: Stage) -> String {
        self.bindings
            .get(&stage)
            .map(|b| b.display_label.clone())
            .unwrap_or_else(|| stage.to_string())
    }
}

/// Registry of templates and stage bindings.
#[derive(Debug, Clone)]
pub struct PipelineCatalog {
    templates: BTreeMap<TaskKind, PipelineTemplate>,
    bindings: BTreeMap<Stage, StageBinding>,
}

impl PipelineCatalog {
    /// Build the catalog from whatever the registry reports as installed.
    pub fn discover(registry: &dyn CapabilityRegistry) -> Result<Self> {
        let installed: Vec<String> = registry.discover()?.into_iter().map(|c| c.id).collect();
        let bindings: BTreeMap<Stage, StageBinding> =
            Stage::ALL.into_iter().map(|s| (s, default_binding(s))).collect();

        let mut templates = BTreeMap::new();
        for kind in TaskKind::ALL {
            let template = PipelineTemplate::materialize(
                kind.as_str(),
                kind,
                &blueprint(kind),
                &bindings,
                |stage| {
                    bindings
                        .get(&stage)
                        .map(|b| installed.contains(&b.required_capability))
                        .unwrap_or(false)
                },
            )?;
            shlog_trace!("catalog: template {} -> {:?}", template.id, template.stages);
            templates.insert(kind, template);
        }
        Ok(Self {
            templates,
            bindings,
        })
    }

    /// Catalog with every built-in capability installed.
    pub fn builtin() -> Result<Self> {
        Self::discover(&StaticRegistry::builtin())
    }

    /// Replace the template for its task kind.
    pub fn with_template(mut self, template: PipelineTemplate) -> Self {
        for (stage, binding) in &template.bindings {
            self.bindings.insert(*stage, binding.clone());
        }
        self.templates.insert(template.task_kind, template);
        self
    }

    pub fn list_templates(&self) -> Vec<&PipelineTemplate> {
        self.templates.values().collect()
    }

    pub fn resolve_template(&self, kind: TaskKind) -> Result<&PipelineTemplate> {
        self.templates
            .get(&kind)
            .ok_or_else(|| Error::Validation(format!("No template for task kind {}", kind)))
    }

    pub fn template_by_id(&self, id: &str) -> Option<&PipelineTemplate> {
        self.templates.values().find(|t| t.id.eq_ignore_ascii_case(id))
    }

    pub fn binding(&self, stage: Stage) -> Option<&StageBinding> {
        self.bindings.get(&stage)
    }

    /// Resolve a (possibly namespaced) capability id to the stage bound to it.
    ///
    /// Only bindings count: an agent merely named after a stage (`Plan`,
    /// `test`) is not part of the pipeline.
    pub fn stage_for_capability(&self, name: &str) -> Option<Stage> {
        let bare = bare_capability_id(name);
        if bare.is_empty() {
            return None;
        }
        self.bindings
            .iter()
            .find(|(_, b)| b.required_capability == bare)
            .map(|(s, _)| *s)
    }
}
