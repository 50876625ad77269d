//! Multi-step agent workflows: DAG validation, scheduling and execution.

mod engine;
mod scheduler;

pub use engine::{StepDefinition, WorkflowEngine};
pub use scheduler::{DagScheduler, GraphError, StepState, validate_graph};

use conductor_core::db::DatabaseError;

use crate::session::SessionError;

/// Errors from workflow operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Edge not found: {0}")]
    EdgeNotFound(String),

    #[error("Invalid workflow graph: {0}")]
    Graph(#[from] GraphError),

    /// Definitions are frozen while a run is active.
    #[error("Workflow {0} is running")]
    Running(String),

    #[error("Workflow {0} is not running")]
    NotRunning(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}
