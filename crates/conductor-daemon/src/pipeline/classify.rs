//! Turn one raw output line into a redacted, typed log entry body.

use tracing::{debug, warn};

use conductor_core::ndjson::{self, Message};
use conductor_core::redact_secrets;

use crate::models::MessageType;
use crate::ports::OutputLine;

/// A redacted line with its classification. `message` holds the parsed
/// protocol message for stdout lines that parsed as one.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub message_type: MessageType,
    pub content: String,
    pub message: Option<Message>,
}

/// Redact, then classify. Redaction happens first so nothing downstream,
/// including the parsed message, ever sees the secret.
///
/// Stdout lines that are not valid protocol JSON, or carry an unrecognised
/// `type`, are kept verbatim as `raw`.
pub fn classify(line: &OutputLine) -> Classified {
    match line {
        OutputLine::Stderr(text) => Classified {
            message_type: MessageType::Stderr,
            content: redact_secrets(text).into_owned(),
            message: None,
        },
        OutputLine::Stdout(text) => {
            let content = redact_secrets(text).into_owned();
            match ndjson::parse_line(&content) {
                Ok(message) => match known_type(&message) {
                    Some(message_type) => Classified {
                        message_type,
                        content,
                        message: Some(message),
                    },
                    None => {
                        debug!(msg_type = message.type_name(), "Unrecognised message type");
                        Classified {
                            message_type: MessageType::Raw,
                            content,
                            message: None,
                        }
                    }
                },
                Err(e) => {
                    if !content.trim().is_empty() {
                        warn!(error = %e, "Unparseable stdout line kept as raw");
                    }
                    Classified {
                        message_type: MessageType::Raw,
                        content,
                        message: None,
                    }
                }
            }
        }
    }
}

const fn known_type(message: &Message) -> Option<MessageType> {
    match message {
        Message::System(_) => Some(MessageType::System),
        Message::Assistant(_) => Some(MessageType::Assistant),
        Message::User(_) => Some(MessageType::User),
        Message::Result(_) => Some(MessageType::Result),
        Message::Unknown { .. } => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use conductor_core::REDACTED;

    #[test]
    fn protocol_lines_are_typed_and_parsed() {
        let c = classify(&OutputLine::Stdout(
            r#"{"type":"result","subtype":"success","is_error":false,"result":"ok"}"#.to_string(),
        ));
        assert_eq!(c.message_type, MessageType::Result);
        assert!(matches!(c.message, Some(Message::Result(_))));
    }

    #[test]
    fn garbage_is_raw_and_preserved() {
        let c = classify(&OutputLine::Stdout("not json {".to_string()));
        assert_eq!(c.message_type, MessageType::Raw);
        assert_eq!(c.content, "not json {");
        assert!(c.message.is_none());
    }

    #[test]
    fn unknown_type_is_raw() {
        let line = r#"{"type":"stream_event","delta":"x"}"#;
        let c = classify(&OutputLine::Stdout(line.to_string()));
        assert_eq!(c.message_type, MessageType::Raw);
        assert_eq!(c.content, line);
    }

    #[test]
    fn json_without_type_is_raw() {
        let c = classify(&OutputLine::Stdout(r#"{"hello":1}"#.to_string()));
        assert_eq!(c.message_type, MessageType::Raw);
    }

    #[test]
    fn stderr_is_redacted_and_typed() {
        let c = classify(&OutputLine::Stderr(
            "using key sk-ant-REDACTED".to_string(),
        ));
        assert_eq!(c.message_type, MessageType::Stderr);
        assert!(c.content.contains(REDACTED));
        assert!(!c.content.contains("sk-ant-"));
    }

    #[test]
    fn secrets_inside_protocol_messages_are_redacted_before_parsing() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"key is sk-ant-REDACTED"}]}}"#;
        let c = classify(&OutputLine::Stdout(line.to_string()));
        assert_eq!(c.message_type, MessageType::Assistant);
        assert!(!c.content.contains("sk-ant-api03"));
        let Some(Message::Assistant(msg)) = c.message else {
            panic!("expected assistant message");
        };
        assert!(msg.text().contains(REDACTED));
    }
}
