//! Agent session lifecycle: start, stop, resume, and the per-session reader
//! task that feeds the stream pipeline.

mod manager;
mod rate_limit;

pub use manager::{SessionManager, SessionSettings, StartRequest};
pub use rate_limit::{RateLimit, detect_rate_limit};

use conductor_core::db::DatabaseError;

/// `error_reason` recorded when the process could not be spawned.
pub const REASON_SPAWN_FAILED: &str = "spawn_failed";
/// `error_reason` recorded when the process ended without a `result` message.
pub const REASON_NO_RESULT: &str = "no_result";
/// `error_reason` recorded when the final `result` reported failure.
pub const REASON_RESULT_ERROR: &str = "result_error";

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    /// The session row exists (status `error`, reason `spawn_failed`) but no
    /// process ever ran.
    #[error("Failed to spawn session {session_id}: {reason}")]
    SpawnFailed { session_id: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

impl SessionError {
    /// The session this error left behind, if one was recorded.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SpawnFailed { session_id, .. } => Some(session_id.as_str()),
            Self::NotFound(_) | Self::Storage(_) => None,
        }
    }
}
