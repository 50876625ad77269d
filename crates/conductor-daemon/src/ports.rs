//! Capability ports.
//!
//! Domain logic (session manager, pipeline, workflow engine) depends only on
//! these traits. Concrete adapters are plugged in at startup:
//!
//! | Port            | Production adapter                         | Test adapter                          |
//! |-----------------|--------------------------------------------|---------------------------------------|
//! | `ProcessRunner` | [`ClaudeCliRunner`](crate::subprocess::ClaudeCliRunner) | [`FakeRunner`](crate::subprocess::FakeRunner) |
//! | `EventSink`     | [`EventBus`](crate::events::EventBus)      | `EventBus` + subscriber               |
//! | `*Store`        | [`Database`](crate::storage::Database)     | `Database::open_in_memory()`          |

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use conductor_core::db::DatabaseError;

use crate::events::Event;
use crate::models::{
    LogEntry, Session, StepStatus, Workflow, WorkflowEdge, WorkflowStatus, WorkflowStep,
};
use crate::subprocess::SubprocessError;

// =========================================================================
// Process runner
// =========================================================================

/// Everything needed to launch one child process. Arguments are always a
/// discrete vector; nothing is ever interpreted by a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Complete environment. The parent environment is not inherited.
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
}

/// One line of child output, tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Signals the session manager can deliver to a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Graceful termination request (SIGTERM on Unix).
    Terminate,
    /// Forceful kill.
    Kill,
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
}

/// Control handle for a spawned child.
///
/// Adapters own the OS handle on a monitor task and talk to it through
/// channels, so the handle is cheap to clone and never blocks a caller while
/// another caller is waiting for exit.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    signal_tx: mpsc::UnboundedSender<ProcessSignal>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    pub const fn new(
        pid: Option<u32>,
        signal_tx: mpsc::UnboundedSender<ProcessSignal>,
        exit_rx: watch::Receiver<Option<ProcessExit>>,
    ) -> Self {
        Self {
            pid,
            signal_tx,
            exit_rx,
        }
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Deliver a signal. Returns `false` if the monitor is gone, which
    /// means the process has already exited.
    pub fn signal(&self, signal: ProcessSignal) -> bool {
        self.signal_tx.send(signal).is_ok()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.unwrap_or(ProcessExit { code: None }),
            // Monitor dropped without reporting: treat as killed.
            Err(_) => ProcessExit { code: None },
        }
    }
}

/// A running child: its merged output stream and its control handle.
///
/// `output` closes once both stdout and stderr have reached EOF.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub output: mpsc::Receiver<OutputLine>,
    pub handle: ProcessHandle,
}

/// Capability to start child processes.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn spawn(&self, spec: ProcessSpec) -> Result<SpawnedProcess, SubprocessError>;

    /// Signal a process by pid, typically one spawned by another conductor
    /// process sharing the database. Returns `false` if it no longer exists.
    fn signal_pid(&self, pid: u32, signal: ProcessSignal) -> bool;

    /// Whether a process with `pid` still exists.
    fn is_alive(&self, pid: u32) -> bool;
}

// =========================================================================
// Event sink
// =========================================================================

/// Push-only event delivery to any number of subscribers. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

// =========================================================================
// Storage
// =========================================================================

/// Durable session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace the full record.
    async fn save_session(&self, session: &Session) -> Result<(), DatabaseError>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>, DatabaseError>;
    /// All sessions, most recent first.
    async fn list_sessions(&self) -> Result<Vec<Session>, DatabaseError>;
}

/// Append-only log history.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_logs(&self, entries: &[LogEntry]) -> Result<(), DatabaseError>;
    /// Entries in arrival order.
    async fn list_logs(
        &self,
        session_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<LogEntry>, DatabaseError>;
    async fn count_logs(&self, session_id: &str) -> Result<u64, DatabaseError>;
}

/// Workflow, step and edge records.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), DatabaseError>;
    async fn get_workflow(&self, id: &str) -> Result<Workflow, DatabaseError>;
    async fn list_workflows(&self) -> Result<Vec<Workflow>, DatabaseError>;
    /// Cascades to the workflow's steps and edges.
    async fn delete_workflow(&self, id: &str) -> Result<(), DatabaseError>;
    async fn set_workflow_status(
        &self,
        id: &str,
        status: WorkflowStatus,
    ) -> Result<(), DatabaseError>;

    /// Insert or replace a step definition.
    async fn save_step(&self, step: &WorkflowStep) -> Result<(), DatabaseError>;
    async fn get_step(&self, id: &str) -> Result<WorkflowStep, DatabaseError>;
    /// Steps in creation order.
    async fn list_steps(&self, workflow_id: &str) -> Result<Vec<WorkflowStep>, DatabaseError>;
    /// Cascades to edges touching the step.
    async fn delete_step(&self, id: &str) -> Result<(), DatabaseError>;
    /// Update only the execution-owned fields of a step.
    async fn set_step_run(
        &self,
        id: &str,
        status: StepStatus,
        session_id: Option<&str>,
        result_output: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn insert_edge(&self, edge: &WorkflowEdge) -> Result<(), DatabaseError>;
    async fn delete_edge(&self, id: &str) -> Result<(), DatabaseError>;
    async fn list_edges(&self, workflow_id: &str) -> Result<Vec<WorkflowEdge>, DatabaseError>;
}
