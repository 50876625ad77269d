//! Conductor
//!
//! Command-line front end for the orchestrator: runs agent sessions and
//! workflows in the foreground and streams their events to stdout as JSON
//! lines. Logs go to stderr.

use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};

use conductor_core::config::{database_path, load_config};
use conductor_core::tracing_init::{default_filter, init_tracing};
use conductor_daemon::Orchestrator;
use conductor_daemon::events::Event;
use conductor_daemon::session::StartRequest;
use conductor_daemon::storage::Database;
use conductor_daemon::subprocess::ClaudeCliRunner;
use conductor_daemon::workflow::StepDefinition;

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about = "Conductor - run and orchestrate agent CLI sessions")]
struct Cli {
    /// Database file path
    #[arg(long, env = "CONDUCTOR_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Project directory (config lookup and default working directory)
    #[arg(long, env = "CONDUCTOR_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Path to the agent CLI binary
    #[arg(long, env = "CONDUCTOR_CLAUDE_BIN")]
    claude_bin: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, env = "CONDUCTOR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long, env = "CONDUCTOR_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a session and stream its events until it ends.
    Run {
        prompt: String,
        /// Agent definition to run; empty uses the CLI's default agent.
        #[arg(short, long, default_value = "")]
        agent: String,
        #[arg(short, long)]
        model: Option<String>,
        #[arg(short = 'd', long)]
        working_dir: Option<PathBuf>,
    },
    /// Continue a previous session's conversation with a new prompt.
    Resume {
        session_id: String,
        prompt: String,
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Stop a session.
    Stop { session_id: String },
    /// List sessions, most recent first.
    Sessions,
    /// Print a session's stored log entries.
    Logs {
        session_id: String,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = 1000)]
        limit: u32,
    },
    /// Manage and run workflows.
    #[command(subcommand)]
    Workflow(WorkflowAction),
}

#[derive(Subcommand, Debug)]
enum WorkflowAction {
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    AddStep {
        workflow_id: String,
        #[arg(long)]
        agent: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "")]
        model: String,
        /// Append upstream results to this step's prompt.
        #[arg(long)]
        pass_context: bool,
    },
    /// `target` waits for `source`.
    AddEdge {
        workflow_id: String,
        source: String,
        target: String,
    },
    Validate { workflow_id: String },
    /// Start a workflow and stream its events until it ends.
    Run { workflow_id: String },
    List,
    /// Print a workflow with its steps and edges.
    Show { workflow_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.project_dir.as_deref())?;
    if let Some(bin) = cli.claude_bin {
        config.daemon.claude_bin = bin;
    }
    if let Some(level) = cli.log_level {
        config.daemon.log_level = level;
    }
    if let Some(dir) = &cli.project_dir {
        config.daemon.working_directory = Some(dir.clone());
    }
    init_tracing(&default_filter(&config.daemon.log_level), cli.log_json);

    let db_path = cli
        .db_path
        .or_else(|| config.daemon.database_path.clone())
        .or_else(database_path)
        .or_else(fallback_db_path)
        .context("Cannot determine database path; pass --db-path")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        path = %db_path.display(),
        "Opening database"
    );
    let db = Database::open(&db_path).await?;

    let orchestrator = Orchestrator::new(&config, db, Arc::new(ClaudeCliRunner::new()));
    let result = tokio::select! {
        result = execute(&orchestrator, cli.command) => result,
        () = shutdown_signal() => Ok(()),
    };
    orchestrator.shutdown().await;
    result
}

async fn execute(orchestrator: &Orchestrator, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run {
            prompt,
            agent,
            model,
            working_dir,
        } => {
            let rx = orchestrator.bus.subscribe();
            let id = orchestrator
                .sessions
                .start(StartRequest {
                    agent_name: agent,
                    model,
                    prompt,
                    working_directory: working_dir,
                })
                .await?;
            stream_session(rx, &id).await
        }
        Command::Resume {
            session_id,
            prompt,
            model,
        } => {
            let rx = orchestrator.bus.subscribe();
            let id = orchestrator
                .sessions
                .resume(&session_id, &prompt, model)
                .await?;
            stream_session(rx, &id).await
        }
        Command::Stop { session_id } => {
            let session = orchestrator.sessions.stop(&session_id).await?;
            print_json(&session)
        }
        Command::Sessions => {
            for session in orchestrator.sessions.list().await? {
                print_json(&session)?;
            }
            Ok(())
        }
        Command::Logs {
            session_id,
            offset,
            limit,
        } => {
            for entry in orchestrator.sessions.logs(&session_id, offset, limit).await? {
                print_json(&entry)?;
            }
            Ok(())
        }
        Command::Workflow(action) => execute_workflow(orchestrator, action).await,
    }
}

async fn execute_workflow(orchestrator: &Orchestrator, action: WorkflowAction) -> anyhow::Result<()> {
    let engine = &orchestrator.workflows;
    match action {
        WorkflowAction::Create { name, description } => {
            let workflow = engine.create_workflow(&name, description.as_deref()).await?;
            print_json(&workflow)
        }
        WorkflowAction::AddStep {
            workflow_id,
            agent,
            prompt,
            model,
            pass_context,
        } => {
            let step = engine
                .add_step(
                    &workflow_id,
                    StepDefinition {
                        agent_name: agent,
                        model,
                        prompt,
                        pass_context,
                        ..StepDefinition::default()
                    },
                )
                .await?;
            print_json(&step)
        }
        WorkflowAction::AddEdge {
            workflow_id,
            source,
            target,
        } => {
            let edge = engine.add_edge(&workflow_id, &source, &target).await?;
            print_json(&edge)
        }
        WorkflowAction::Validate { workflow_id } => {
            let workflow = engine.validate(&workflow_id).await?;
            print_json(&workflow)
        }
        WorkflowAction::Run { workflow_id } => {
            let mut rx = orchestrator.bus.subscribe();
            engine.start(&workflow_id).await?;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        print_json(&event)?;
                        if let Event::WorkflowStatus {
                            workflow_id: id,
                            status,
                        } = &event
                            && *id == workflow_id
                            && status.is_terminal()
                        {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
        WorkflowAction::List => {
            for workflow in engine.list_workflows().await? {
                print_json(&workflow)?;
            }
            Ok(())
        }
        WorkflowAction::Show { workflow_id } => {
            let workflow = engine.get_workflow(&workflow_id).await?;
            let steps = engine.list_steps(&workflow_id).await?;
            let edges = engine.list_edges(&workflow_id).await?;
            print_json(&serde_json::json!({
                "workflow": workflow,
                "steps": steps,
                "edges": edges,
            }))
        }
    }
}

/// Print every event for `session_id` until it reaches a terminal status.
async fn stream_session(mut rx: broadcast::Receiver<Event>, session_id: &str) -> anyhow::Result<()> {
    loop {
        match rx.recv().await {
            Ok(event) if event.session_id() == Some(session_id) => {
                print_json(&event)?;
                if let Event::SessionStatus { status, .. } = &event
                    && status.is_terminal()
                {
                    return Ok(());
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

/// `~/.conductor/conductor.db`, for environments without `HOME` or
/// `XDG_CONFIG_HOME` set.
fn fallback_db_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".conductor").join("conductor.db"))
}

#[allow(clippy::print_stdout)]
fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                None
            }
        };

    #[cfg(unix)]
    let sigterm_future = async {
        match sigterm.as_mut() {
            Some(signal) => {
                signal.recv().await;
            }
            None => pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let sigterm_future = pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        () = sigterm_future => info!("Received SIGTERM shutdown signal"),
    }
}
