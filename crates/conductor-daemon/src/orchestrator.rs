//! Wires the adapters into a running system.
//!
//! One [`Database`] backs all three storage ports, one [`EventBus`] receives
//! every event, and the process runner is injected so tests can use
//! [`FakeRunner`](crate::subprocess::FakeRunner).

use std::sync::Arc;

use tracing::info;

use conductor_core::Config;

use crate::events::{DEFAULT_BUS_CAPACITY, EventBus};
use crate::pipeline::StreamPipeline;
use crate::ports::ProcessRunner;
use crate::session::{SessionManager, SessionSettings};
use crate::storage::Database;
use crate::workflow::WorkflowEngine;

pub struct Orchestrator {
    pub bus: Arc<EventBus>,
    pub pipeline: Arc<StreamPipeline>,
    pub sessions: Arc<SessionManager>,
    pub workflows: Arc<WorkflowEngine>,
    db: Database,
}

impl Orchestrator {
    pub fn new(config: &Config, db: Database, runner: Arc<dyn ProcessRunner>) -> Self {
        Self::with_settings(config, SessionSettings::from_config(config), db, runner)
    }

    /// Like [`new`](Self::new) but with explicit session settings instead of
    /// ones resolved from the process environment.
    pub fn with_settings(
        config: &Config,
        settings: SessionSettings,
        db: Database,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(DEFAULT_BUS_CAPACITY));
        let pipeline = Arc::new(StreamPipeline::new(
            &config.pipeline,
            Arc::new(db.clone()),
            bus.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            settings,
            runner,
            Arc::clone(&pipeline),
            Arc::new(db.clone()),
            bus.clone(),
        ));
        let workflows = Arc::new(WorkflowEngine::new(
            Arc::new(db.clone()),
            Arc::clone(&sessions),
            bus.clone(),
        ));

        Self {
            bus,
            pipeline,
            sessions,
            workflows,
            db,
        }
    }

    /// Cancel active workflows, stop every live session, flush logs and
    /// close the database.
    pub async fn shutdown(&self) {
        self.workflows.stop_all().await;
        self.sessions.shutdown().await;
        self.pipeline.shutdown().await;
        self.db.close().await;
        info!("Orchestrator shut down");
    }
}
