//! Domain records shared by the session manager, pipeline, workflow engine
//! and storage adapters.
//!
//! Status enums are stored as their snake_case names; rows decode them via
//! `TryFrom<String>`.

use serde::{Deserialize, Serialize};

/// A stored status string did not name any known variant.
#[derive(Debug, thiserror::Error)]
#[error("Unknown {kind} value: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, UnknownVariant> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownVariant;

            fn try_from(value: String) -> Result<Self, UnknownVariant> {
                value.parse()
            }
        }
    };
}

// =========================================================================
// Sessions
// =========================================================================

string_enum! {
    /// Lifecycle of one agent session.
    SessionStatus {
        Idle => "idle",
        Starting => "starting",
        Running => "running",
        Completed => "completed",
        Error => "error",
        Stopped => "stopped",
    }
}

impl SessionStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }

    /// Forward-only: idle -> starting -> running -> terminal. A session that
    /// never produced output may go from starting straight to terminal.
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Idle => matches!(next, Self::Starting),
            Self::Starting => matches!(next, Self::Running) || next.is_terminal(),
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Error | Self::Stopped => false,
        }
    }
}

/// One spawned (or resumed) conversation with an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub agent_name: String,
    pub model: String,
    pub prompt: String,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub working_directory: String,
    /// Conversation reference passed to `--resume` when this session is
    /// continued. Starts as the session id and follows the agent's
    /// `system/init` report.
    pub conversation_id: Option<String>,
    pub resumed_from: Option<String>,
    /// Machine-readable cause of an `error` status.
    pub error_reason: Option<String>,
    /// Final `result` text reported by the agent.
    pub result_text: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    /// OS process id while the agent process is live; cleared once the
    /// session is terminal.
    pub pid: Option<i64>,
}

// =========================================================================
// Log entries
// =========================================================================

string_enum! {
    /// Classification of one captured output line.
    MessageType {
        System => "system",
        Assistant => "assistant",
        User => "user",
        Result => "result",
        Stderr => "stderr",
        /// Stdout line that was not a recognised protocol message.
        Raw => "raw",
    }
}

impl MessageType {
    /// Cumulative-snapshot types whose consecutive runs collapse in the live
    /// view. `stderr` and `raw` lines are independent and always kept.
    pub const fn collapses(self) -> bool {
        !matches!(self, Self::Stderr | Self::Raw)
    }
}

/// One classified, redacted unit of process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LogEntry {
    pub session_id: String,
    /// 1-based arrival order within the session.
    pub sequence: i64,
    #[sqlx(try_from = "String")]
    pub message_type: MessageType,
    pub content: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

// =========================================================================
// Workflows
// =========================================================================

string_enum! {
    WorkflowStatus {
        Draft => "draft",
        Ready => "ready",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl WorkflowStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

string_enum! {
    StepStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Skipped => "skipped",
    }
}

impl StepStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// A named, reusable pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: WorkflowStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One node of a workflow DAG, run as one agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowStep {
    pub id: String,
    pub workflow_id: String,
    pub agent_name: String,
    pub model: String,
    pub prompt: String,
    pub spec_path: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: StepStatus,
    /// Bound once the step is dispatched.
    pub session_id: Option<String>,
    /// Layout hint only.
    pub position_x: f64,
    pub position_y: f64,
    /// Append upstream `result_output` values to this step's prompt.
    pub pass_context: bool,
    pub result_output: Option<String>,
    pub created_at: i64,
}

/// Directed dependency: `target_step_id` waits for `source_step_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowEdge {
    pub id: String,
    pub workflow_id: String,
    pub source_step_id: String,
    pub target_step_id: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn session_status_is_forward_only() {
        use SessionStatus::*;
        assert!(Idle.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Idle.can_transition_to(Running));
    }

    #[test]
    fn terminal_session_status_is_immutable() {
        for terminal in [SessionStatus::Completed, SessionStatus::Error, SessionStatus::Stopped] {
            for next in [
                SessionStatus::Idle,
                SessionStatus::Starting,
                SessionStatus::Running,
                SessionStatus::Completed,
                SessionStatus::Error,
                SessionStatus::Stopped,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn status_strings_roundtrip_through_storage_form() {
        assert_eq!(SessionStatus::try_from("stopped".to_string()).unwrap(), SessionStatus::Stopped);
        assert_eq!(StepStatus::Skipped.as_str(), "skipped");
        assert_eq!("cancelled".parse::<WorkflowStatus>().unwrap(), WorkflowStatus::Cancelled);
        assert!("paused".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_string(&MessageType::Stderr).unwrap();
        assert_eq!(json, "\"stderr\"");
    }

    #[test]
    fn stderr_and_raw_never_collapse() {
        assert!(MessageType::Assistant.collapses());
        assert!(MessageType::User.collapses());
        assert!(!MessageType::Stderr.collapses());
        assert!(!MessageType::Raw.collapses());
    }
}
