//! # lobster-agent
//!
//! g3lobster binary: loads settings, wires the event emitter, memory and
//! runtime crates together, and runs the agent pool until Ctrl-C.

#![deny(unsafe_code)]

mod shutdown;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lobster_events::EventEmitter;
use lobster_memory::{CliSummarizer, GlobalMemoryManager};
use lobster_runtime::{AgentRegistry, CapabilityResolver, CliWorkerFactory, RegistryConfig, RunStatus};
use lobster_settings::{LobsterSettings, load_settings_from_path};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::shutdown::ShutdownCoordinator;

/// Session used by `delegate` when none is given.
const CLI_SESSION: &str = "cli";

/// g3lobster agent pool.
#[derive(Parser, Debug)]
#[command(name = "lobster-agent", about = "Run and inspect a pool of named AI agents")]
struct Cli {
    /// Settings file (JSON). Missing file means defaults.
    #[arg(long, global = true, default_value = "config/settings.json")]
    config: PathBuf,

    /// Log level override (`trace`..`error`).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Start every enabled agent and run until Ctrl-C.
    Serve,
    /// Print agent status as JSON without starting anything.
    Status,
    /// Run one delegation and print the resulting run.
    Delegate {
        /// Delegating agent.
        #[arg(long = "from")]
        parent: String,
        /// Agent that does the work.
        #[arg(long = "to")]
        child: String,
        /// Parent session id.
        #[arg(long, default_value = CLI_SESSION)]
        session: String,
        /// Seconds before the run counts as timed out.
        #[arg(long)]
        timeout: Option<f64>,
        /// Task prompt.
        prompt: String,
    },
    /// Print persisted delegation runs, newest first.
    Runs {
        /// Only runs started by this agent.
        #[arg(long)]
        parent: Option<String>,
    },
}

fn init_logging(cli: &Cli, settings: &LobsterSettings) {
    let level = cli.log_level.as_deref().unwrap_or(&settings.logging.level);
    if cli.json_logs || settings.logging.json {
        lobster_core::logging::init_json_subscriber(level);
    } else {
        lobster_core::logging::init_subscriber(level);
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Build the emitter from settings. History goes to `<dataDir>/events`.
fn build_emitter(settings: &LobsterSettings) -> Arc<EventEmitter> {
    let events_dir = settings.events.persist.then(|| settings.agents.data_dir.join("events"));
    Arc::new(EventEmitter::new(events_dir, settings.events.max_recent))
}

/// Wire the registry and everything it depends on.
fn build_registry(settings: &LobsterSettings, emitter: Arc<EventEmitter>) -> Result<Arc<AgentRegistry>> {
    ensure_dir(&settings.agents.data_dir)?;

    let resolver = Arc::new(
        CapabilityResolver::load(&settings.mcp.config_dir)
            .with_context(|| format!("Failed to load MCP servers from {}", settings.mcp.config_dir.display()))?,
    );

    let summary_timeout = Duration::try_from_secs_f64(settings.backend.summary_timeout_s.max(5.0))
        .unwrap_or(Duration::from_secs(45));
    let summarizer = Arc::new(CliSummarizer::new(
        settings.backend.command.clone(),
        settings.backend.args.clone(),
        Some(settings.backend.workspace_dir.clone()),
        summary_timeout,
    ));
    let factory = Arc::new(CliWorkerFactory::new(&settings.backend, resolver, Arc::clone(&emitter)));
    let global = Arc::new(
        GlobalMemoryManager::new(&settings.agents.data_dir).context("Failed to open global memory")?,
    );

    let registry = AgentRegistry::new(RegistryConfig::from_settings(settings), factory, summarizer, emitter)
        .context("Failed to open agent registry")?
        .with_global_memory(global);
    Ok(Arc::new(registry))
}

/// Log the live event feed at debug level until `cancel` fires.
fn spawn_event_logger(emitter: &EventEmitter, cancel: CancellationToken) -> JoinHandle<()> {
    let mut feed = emitter.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = feed.recv() => match received {
                    Ok(event) => debug!(
                        agent_id = %event.agent_id,
                        stream = %event.stream,
                        event_type = %event.event_type,
                        seq = event.seq,
                        "event"
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event feed lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

async fn serve(registry: Arc<AgentRegistry>, emitter: &EventEmitter) -> Result<()> {
    let coordinator = ShutdownCoordinator::new();
    let logger = spawn_event_logger(emitter, coordinator.token());

    registry.start_all().await.context("Failed to start agents")?;
    let running = registry.running_agents();
    info!(agents = running.len(), ids = ?running, "g3lobster running");

    coordinator.wait_for_signal().await;
    info!("shutting down");
    registry.stop_all().await;
    coordinator.drain(vec![logger], None).await;
    info!("shutdown complete");
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = load_settings_from_path(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    init_logging(&cli, &settings);

    let emitter = build_emitter(&settings);
    let registry = build_registry(&settings, Arc::clone(&emitter))?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(registry, &emitter).await?,
        Command::Status => print_json(&registry.status()?)?,
        Command::Runs { parent } => print_json(&registry.list_runs(parent.as_deref()))?,
        Command::Delegate {
            parent,
            child,
            session,
            timeout,
            prompt,
        } => {
            let timeout_s = timeout.unwrap_or(settings.agents.delegation_timeout_s);
            let outcome = registry.delegate_task(&parent, &child, &prompt, &session, timeout_s).await;
            registry.stop_all().await;
            let run = outcome?;
            print_json(&run)?;
            if run.status != RunStatus::Completed {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    run(Cli::parse()).await
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lobster_runtime::Persona;

    #[test]
    fn defaults_to_serve() {
        let cli = Cli::parse_from(["lobster-agent"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("config/settings.json"));
        assert!(!cli.json_logs);
    }

    #[test]
    fn parses_delegate() {
        let cli = Cli::parse_from([
            "lobster-agent",
            "--log-level",
            "debug",
            "delegate",
            "--from",
            "alpha",
            "--to",
            "beta",
            "--timeout",
            "12.5",
            "summarize the logs",
        ]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(
            cli.command,
            Some(Command::Delegate {
                parent: "alpha".into(),
                child: "beta".into(),
                session: CLI_SESSION.into(),
                timeout: Some(12.5),
                prompt: "summarize the logs".into(),
            })
        );
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["lobster-agent", "runs", "--parent", "alpha", "--json-logs"]);
        assert!(cli.json_logs);
        assert_eq!(cli.command, Some(Command::Runs { parent: Some("alpha".into()) }));
    }

    fn settings_in(dir: &Path) -> LobsterSettings {
        let mut settings = LobsterSettings::default();
        settings.agents.data_dir = dir.join("data");
        settings.mcp.config_dir = dir.join("mcp");
        settings.backend.workspace_dir = dir.to_path_buf();
        settings
    }

    #[test]
    fn emitter_persists_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_in(dir.path());
        let emitter = build_emitter(&settings);
        assert_eq!(emitter.events_dir(), Some(dir.path().join("data/events").as_path()));

        settings.events.persist = false;
        assert!(build_emitter(&settings).events_dir().is_none());
    }

    #[tokio::test]
    async fn status_lists_personas_as_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let registry = build_registry(&settings, Arc::new(EventEmitter::in_memory())).unwrap();
        let persona = Persona::new("alpha", "Alpha").unwrap();
        let _ = registry.personas().save(&persona).unwrap();

        let rows = registry.status().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "stopped");
        assert!(registry.list_runs(None).is_empty());
    }

    #[tokio::test]
    async fn delegating_to_missing_agent_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let registry = build_registry(&settings, Arc::new(EventEmitter::in_memory())).unwrap();

        let run = registry.delegate_task("alpha", "ghost", "hi", CLI_SESSION, 5.0).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(registry.list_runs(Some("alpha")).len(), 1);
    }
}
