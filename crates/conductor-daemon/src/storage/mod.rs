//! `SQLite` storage for the Conductor daemon.
//!
//! Provides persistence for sessions, log entries and workflow definitions.
//! [`Database`] implements every storage port.

mod db;
mod queries;
mod queries_workflows;

pub use db::{Database, DatabaseError};
