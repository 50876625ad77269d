//! Conductor Core Library
//!
//! Shared functionality for the Conductor orchestrator:
//! - NDJSON parsing for the agent stream-json protocol
//! - Secret redaction applied to every captured line
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and common error types

pub mod config;
pub mod db;
pub mod error;
pub mod ndjson;
pub mod redact;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use redact::{REDACTED, redact_secrets};
