//! Message types for the agent NDJSON protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Canonical message types emitted on the agent's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    System(SystemMessage),
    Assistant(AssistantMessage),
    User(UserMessage),
    Result(SessionResult),
    Unknown { msg_type: String, payload: Value },
}

impl Message {
    /// The top-level `type` discriminator this message was parsed from.
    pub fn type_name(&self) -> &str {
        match self {
            Self::System(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::Result(_) => "result",
            Self::Unknown { msg_type, .. } => msg_type,
        }
    }
}

/// `system` message. Subtype `init` marks the start of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub subtype: String,
    pub session_id: String,
    pub model: String,
    pub cwd: PathBuf,
    pub tools: Vec<String>,
}

impl SystemMessage {
    pub fn is_init(&self) -> bool {
        self.subtype == "init"
    }
}

/// Assistant turn. The protocol sends cumulative snapshots, so `content`
/// may repeat blocks seen in earlier messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl AssistantMessage {
    /// Concatenated text of every `text` block.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolUse { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Content block in an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// Reason the assistant stopped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    /// Still streaming (`stop_reason: null`).
    #[default]
    None,
    Unknown(String),
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    pub const fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// User message: tool results echoed back into the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub content: Vec<ToolResult>,
}

/// Tool execution result, linked to its `tool_use` block by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Final `result` message of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub subtype: ResultSubtype,
    pub is_error: bool,
    /// Final answer text.
    pub result: Option<String>,
    pub session_id: String,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub cost_usd: Option<f64>,
    pub usage: Usage,
}

impl SessionResult {
    /// Whether the agent reported success. This, not the process exit code,
    /// decides the session outcome.
    pub fn succeeded(&self) -> bool {
        self.subtype == ResultSubtype::Success && !self.is_error
    }
}

/// Result subtype.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultSubtype {
    #[default]
    Success,
    /// `error`, or any `error_*` variant such as `error_max_turns`.
    Error(String),
    Unknown(String),
}
