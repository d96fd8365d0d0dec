use std::io::{self, Read};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use stagehand::config::Config;
use stagehand::hook::{self, HookEvent, HookPayload};
use stagehand::orchestration::{CapabilityRegistry, Controller, ManifestRegistry, PipelineCatalog};
use stagehand::state::{journal, FileStateStore};
use stagehand::{shlog, shlog_error, Result};

/// Stagehand - pipeline orchestration hooks for agent-delegated coding sessions
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    STAGEHAND_DEBUG=1   Enable debug logging (alternative to --debug)\n    STAGEHAND_HOME      Base directory (default ~/.stagehand)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.stagehand/stagehand.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file to use instead of ~/.stagehand/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Handle a lifecycle hook (JSON payload on stdin, JSON response on stdout)
    Hook {
        #[arg(value_enum)]
        event: HookEvent,
    },

    /// Show the pipeline state of a session
    Status {
        session: String,

        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Clear a session's pipeline progress
    Reset {
        session: String,

        /// Restart the same template instead of clearing the classification
        #[arg(long)]
        keep_classification: bool,
    },

    /// Stop enforcing the pipeline of a session
    Cancel { session: String },

    /// List pipeline templates for the installed capabilities
    Templates,

    /// Rebuild a snapshot from an event journal and print it
    Replay {
        journal: PathBuf,

        /// Session id (defaults to the journal's file name)
        #[arg(long)]
        session: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    stagehand::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Hook { event } => run_hook(event, cli.config.as_deref()),
        Command::Status { session, json } => run_status(&session, json, cli.config.as_deref()),
        Command::Reset {
            session,
            keep_classification,
        } => run_reset(&session, keep_classification, cli.config.as_deref()),
        Command::Cancel { session } => run_cancel(&session, cli.config.as_deref()),
        Command::Templates => run_templates(cli.config.as_deref()),
        Command::Replay { journal, session } => {
            run_replay(&journal, session.as_deref(), cli.config.as_deref())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn build_catalog(config: &Config) -> Result<PipelineCatalog> {
    let roots = config.plugin_roots();
    if roots.is_empty() {
        return PipelineCatalog::builtin();
    }
    let registry = ManifestRegistry::new(roots);
    let found = registry.discover()?;
    if found.is_empty() {
        shlog!("No capabilities found under plugin_dirs, using the built-in set");
        return PipelineCatalog::builtin();
    }
    PipelineCatalog::discover(&registry)
}

fn build_controller(config_path: Option<&Path>) -> Result<Controller<FileStateStore>> {
    let config = load_config(config_path)?;
    let store = FileStateStore::from_config(&config)?;
    let catalog = build_catalog(&config)?;
    Ok(Controller::new(store, catalog, config))
}

/// Hooks never fail the host session: any error yields an empty response.
fn run_hook(event: HookEvent, config_path: Option<&Path>) -> Result<()> {
    let mut input = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut input) {
        shlog_error!("hook {:?}: failed to read stdin: {}", event, e);
        println!("{{}}");
        return Ok(());
    }

    let result = HookPayload::parse(&input).and_then(|payload| {
        let controller = build_controller(config_path)?;
        Ok(hook::dispatch(&controller, event, &payload))
    });

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            shlog_error!("hook {:?}: failing open: {}", event, e);
            println!("{{}}");
            return Ok(());
        }
    };

    println!("{}", serde_json::to_string(&result.response)?);
    if let Some(message) = &result.stderr {
        eprintln!("{}", message);
    }
    if result.exit_code != 0 {
        std::process::exit(result.exit_code);
    }
    Ok(())
}

fn run_status(session: &str, json: bool, config_path: Option<&Path>) -> Result<()> {
    let controller = build_controller(config_path)?;
    let Some(state) = controller.status(session) else {
        println!("No pipeline state for session {}", session);
        return Ok(());
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("{}", controller.render_status(&state));
    }
    Ok(())
}

fn run_reset(session: &str, keep_classification: bool, config_path: Option<&Path>) -> Result<()> {
    let controller = build_controller(config_path)?;
    if controller.reset(session, keep_classification) {
        println!("Session {} reset", session);
    } else {
        println!("Nothing to reset for session {}", session);
    }
    Ok(())
}

fn run_cancel(session: &str, config_path: Option<&Path>) -> Result<()> {
    let controller = build_controller(config_path)?;
    match controller.cancel(session) {
        Some(message) => println!("{}", message),
        None => println!("No active pipeline for session {}", session),
    }
    Ok(())
}

fn run_templates(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let catalog = build_catalog(&config)?;
    for template in catalog.list_templates() {
        println!("{} (rank {})", template.id, template.task_kind.rank());
        if template.is_empty() {
            println!("    no stages");
            continue;
        }
        for stage in &template.stages {
            let deps = template
                .dag
                .get(stage)
                .map(|n| {
                    n.deps
                        .iter()
                        .map(|d| d.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            let capability = template
                .bindings
                .get(stage)
                .map(|b| b.required_capability.as_str())
                .unwrap_or("-");
            if deps.is_empty() {
                println!("    {:<6} {}", stage.as_str(), capability);
            } else {
                println!("    {:<6} {} (after {})", stage.as_str(), capability, deps);
            }
        }
    }
    Ok(())
}

fn run_replay(path: &Path, session: Option<&str>, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let catalog = build_catalog(&config)?;
    let events = journal::read(path)?;

    let session = match session {
        Some(id) => id.to_string(),
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.trim_end_matches(".jsonl").trim_end_matches(".events").to_string())
            .unwrap_or_else(|| "default".to_string()),
    };

    match stagehand::orchestration::replay(&session, &events, &catalog, &config) {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => println!("Journal {} holds no session events", path.display()),
    }
    Ok(())
}
