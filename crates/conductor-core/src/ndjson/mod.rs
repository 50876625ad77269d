//! NDJSON parser for the agent stream-json protocol.
//!
//! Parses newline-delimited JSON from the agent's stdout into canonical
//! message types, implementing a tolerant reader pattern: unknown fields are
//! ignored and unknown `type` values come back as [`Message::Unknown`].

mod parser;
mod types;

pub use parser::{parse_line, parse_value};
pub use types::*;
