//! Conductor Daemon Library
//!
//! Orchestration core for agent CLI sessions:
//! - Session lifecycle (start, stop, resume) over a pluggable process runner
//! - Streaming pipeline: redaction, ring buffer, dedup view, batched events
//! - `SQLite` storage for sessions, logs and workflows
//! - DAG workflows that run each step as an agent session

pub mod events;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod ports;
pub mod session;
pub mod storage;
pub mod subprocess;
pub mod workflow;

pub use orchestrator::Orchestrator;
