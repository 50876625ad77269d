//! Events pushed to collaborators, and the broadcast bus that fans them out.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{LogEntry, SessionStatus, StepStatus, WorkflowStatus};
use crate::ports::EventSink;

/// Default number of events a slow subscriber may lag behind before it
/// starts missing events.
pub const DEFAULT_BUS_CAPACITY: usize = 4096;

/// Everything the orchestrator reports to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A session changed status. Never batched.
    SessionStatus {
        session_id: String,
        agent_name: String,
        model: String,
        status: SessionStatus,
        ended_at: Option<i64>,
        error_reason: Option<String>,
    },
    /// Log entries for one session, in arrival order.
    Logs {
        session_id: String,
        entries: Vec<LogEntry>,
    },
    /// Running token and cost totals for a session.
    Usage {
        session_id: String,
        input_tokens: i64,
        output_tokens: i64,
        cost_usd: f64,
    },
    /// The agent hit an account usage or rate limit.
    RateLimited {
        session_id: String,
        reset_at: Option<String>,
        message: String,
    },
    WorkflowStatus {
        workflow_id: String,
        status: WorkflowStatus,
    },
    StepStatus {
        workflow_id: String,
        step_id: String,
        status: StepStatus,
        session_id: Option<String>,
    },
}

impl Event {
    /// Session the event belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionStatus { session_id, .. }
            | Self::Logs { session_id, .. }
            | Self::Usage { session_id, .. }
            | Self::RateLimited { session_id, .. } => Some(session_id),
            Self::StepStatus { session_id, .. } => session_id.as_deref(),
            Self::WorkflowStatus { .. } => None,
        }
    }
}

/// In-process event bus backed by a tokio broadcast channel.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: Event) {
        if let Ok(count) = self.tx.send(event) {
            debug!(receivers = count, "Event broadcast");
        } else {
            debug!("No receivers for event");
        }
    }
}
