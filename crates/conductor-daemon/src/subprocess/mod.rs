//! Process-runner adapters and the agent CLI invocation contract.

pub mod command;
pub mod fake;
pub mod runner;

pub use command::{Invocation, build_args, filtered_env};
pub use fake::{FakeProcess, FakeRunner, Script, assistant_line, init_line, result_line};
pub use runner::ClaudeCliRunner;

/// Errors from process-runner operations.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    /// No process ever ran: missing executable, bad working directory,
    /// unusable arguments.
    #[error("Failed to spawn subprocess: {reason}")]
    SpawnFailed { reason: String },

    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
}
