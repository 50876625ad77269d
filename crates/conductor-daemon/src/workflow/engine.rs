//! Workflow engine: definition CRUD plus event-driven execution.
//!
//! A run holds a [`DagScheduler`] behind a per-workflow mutex. Each
//! dispatched step gets a watcher task that waits for its session to end
//! and feeds the outcome back, which re-evaluates only that step's
//! dependents. There is no polling loop.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conductor_core::db::{DatabaseError, unix_timestamp};

use super::WorkflowError;
use super::scheduler::{DagScheduler, StepState, validate_graph};
use crate::events::Event;
use crate::models::{
    Session, SessionStatus, StepStatus, Workflow, WorkflowEdge, WorkflowStatus, WorkflowStep,
};
use crate::ports::{EventSink, WorkflowStore};
use crate::session::{SessionManager, StartRequest};

/// User-editable fields of a step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepDefinition {
    pub agent_name: String,
    /// Empty means the configured default model.
    pub model: String,
    pub prompt: String,
    pub spec_path: Option<String>,
    pub pass_context: bool,
    pub position_x: f64,
    pub position_y: f64,
}

/// In-memory state of one executing workflow.
struct WorkflowRun {
    scheduler: DagScheduler,
    steps: HashMap<String, WorkflowStep>,
    /// `step_id` -> session id, for dispatched steps still running.
    running: HashMap<String, String>,
    cancelled: bool,
}

type StepWatch = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    sessions: Arc<SessionManager>,
    sink: Arc<dyn EventSink>,
    runs: RwLock<HashMap<String, Arc<Mutex<WorkflowRun>>>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        sessions: Arc<SessionManager>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            sessions,
            sink,
            runs: RwLock::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    pub async fn create_workflow(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<Workflow, WorkflowError> {
        let now = unix_timestamp();
        let workflow = Workflow {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            status: WorkflowStatus::Draft,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_workflow(&workflow).await?;
        info!(workflow_id = %workflow.id, name, "Workflow created");
        Ok(workflow)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, WorkflowError> {
        self.store
            .get_workflow(workflow_id)
            .await
            .map_err(|e| not_found(e, || WorkflowError::NotFound(workflow_id.to_string())))
    }

    /// Most recent first.
    pub async fn list_workflows(&self) -> Result<Vec<Workflow>, WorkflowError> {
        Ok(self.store.list_workflows().await?)
    }

    /// Delete a workflow with its steps and edges. Refused while running.
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<(), WorkflowError> {
        self.ensure_editable(workflow_id).await?;
        self.store
            .delete_workflow(workflow_id)
            .await
            .map_err(|e| not_found(e, || WorkflowError::NotFound(workflow_id.to_string())))?;
        info!(workflow_id, "Workflow deleted");
        Ok(())
    }

    pub async fn add_step(
        &self,
        workflow_id: &str,
        definition: StepDefinition,
    ) -> Result<WorkflowStep, WorkflowError> {
        let workflow = self.get_workflow(workflow_id).await?;
        self.ensure_editable(workflow_id).await?;

        let step = WorkflowStep {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            agent_name: definition.agent_name,
            model: definition.model,
            prompt: definition.prompt,
            spec_path: definition.spec_path,
            status: StepStatus::Pending,
            session_id: None,
            position_x: definition.position_x,
            position_y: definition.position_y,
            pass_context: definition.pass_context,
            result_output: None,
            created_at: unix_timestamp(),
        };
        self.store.save_step(&step).await?;
        self.mark_edited(&workflow).await?;
        debug!(workflow_id, step_id = %step.id, "Step added");
        Ok(step)
    }

    /// Replace a step's definition. Execution fields are left untouched.
    pub async fn update_step(
        &self,
        step_id: &str,
        definition: StepDefinition,
    ) -> Result<WorkflowStep, WorkflowError> {
        let mut step = self.get_step(step_id).await?;
        let workflow = self.get_workflow(&step.workflow_id).await?;
        self.ensure_editable(&workflow.id).await?;

        step.agent_name = definition.agent_name;
        step.model = definition.model;
        step.prompt = definition.prompt;
        step.spec_path = definition.spec_path;
        step.pass_context = definition.pass_context;
        step.position_x = definition.position_x;
        step.position_y = definition.position_y;
        self.store.save_step(&step).await?;
        self.mark_edited(&workflow).await?;
        Ok(step)
    }

    /// Remove a step and every edge touching it.
    pub async fn remove_step(&self, step_id: &str) -> Result<(), WorkflowError> {
        let step = self.get_step(step_id).await?;
        let workflow = self.get_workflow(&step.workflow_id).await?;
        self.ensure_editable(&workflow.id).await?;

        self.store
            .delete_step(step_id)
            .await
            .map_err(|e| not_found(e, || WorkflowError::StepNotFound(step_id.to_string())))?;
        self.mark_edited(&workflow).await?;
        debug!(workflow_id = %workflow.id, step_id, "Step removed");
        Ok(())
    }

    /// Steps in creation order.
    pub async fn list_steps(&self, workflow_id: &str) -> Result<Vec<WorkflowStep>, WorkflowError> {
        self.get_workflow(workflow_id).await?;
        Ok(self.store.list_steps(workflow_id).await?)
    }

    /// Add a dependency: `target_step_id` waits for `source_step_id`.
    ///
    /// Both steps must belong to the workflow. Cycles are caught by
    /// [`validate`](Self::validate), not here.
    pub async fn add_edge(
        &self,
        workflow_id: &str,
        source_step_id: &str,
        target_step_id: &str,
    ) -> Result<WorkflowEdge, WorkflowError> {
        let workflow = self.get_workflow(workflow_id).await?;
        self.ensure_editable(workflow_id).await?;

        for step_id in [source_step_id, target_step_id] {
            let step = self.get_step(step_id).await?;
            if step.workflow_id != workflow_id {
                return Err(super::GraphError::DanglingEdge {
                    from: source_step_id.to_string(),
                    to: target_step_id.to_string(),
                    missing: step_id.to_string(),
                }
                .into());
            }
        }
        if source_step_id == target_step_id {
            return Err(super::GraphError::SelfLoop(source_step_id.to_string()).into());
        }

        let edge = WorkflowEdge {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            source_step_id: source_step_id.to_string(),
            target_step_id: target_step_id.to_string(),
        };
        self.store.insert_edge(&edge).await?;
        self.mark_edited(&workflow).await?;
        debug!(
            workflow_id,
            source = source_step_id,
            target = target_step_id,
            "Edge added"
        );
        Ok(edge)
    }

    pub async fn remove_edge(&self, workflow_id: &str, edge_id: &str) -> Result<(), WorkflowError> {
        let workflow = self.get_workflow(workflow_id).await?;
        self.ensure_editable(workflow_id).await?;

        let edges = self.store.list_edges(workflow_id).await?;
        if !edges.iter().any(|e| e.id == edge_id) {
            return Err(WorkflowError::EdgeNotFound(edge_id.to_string()));
        }
        self.store.delete_edge(edge_id).await?;
        self.mark_edited(&workflow).await?;
        Ok(())
    }

    /// Edges in insertion order.
    pub async fn list_edges(&self, workflow_id: &str) -> Result<Vec<WorkflowEdge>, WorkflowError> {
        self.get_workflow(workflow_id).await?;
        Ok(self.store.list_edges(workflow_id).await?)
    }

    /// Check the graph for dangling edges and cycles. A valid `draft`
    /// becomes `ready`.
    pub async fn validate(&self, workflow_id: &str) -> Result<Workflow, WorkflowError> {
        let mut workflow = self.get_workflow(workflow_id).await?;
        let (step_ids, pairs) = self.graph(workflow_id).await?;
        validate_graph(&step_ids, &pairs)?;

        if workflow.status == WorkflowStatus::Draft {
            self.set_status(workflow_id, WorkflowStatus::Ready).await?;
            workflow.status = WorkflowStatus::Ready;
        }
        Ok(workflow)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Validate and start a run. Every step is reset to `pending`, then the
    /// root steps are dispatched.
    pub async fn start(self: &Arc<Self>, workflow_id: &str) -> Result<(), WorkflowError> {
        self.get_workflow(workflow_id).await?;
        if self.runs.read().await.contains_key(workflow_id) {
            return Err(WorkflowError::Running(workflow_id.to_string()));
        }

        let mut steps = self.store.list_steps(workflow_id).await?;
        let edges = self.store.list_edges(workflow_id).await?;
        let scheduler = DagScheduler::new(
            steps.iter().map(|s| s.id.clone()).collect(),
            &edge_pairs(&edges),
        )?;

        let run = Arc::new(Mutex::new(WorkflowRun {
            scheduler,
            steps: HashMap::new(),
            running: HashMap::new(),
            cancelled: false,
        }));
        {
            let mut runs = self.runs.write().await;
            if runs.contains_key(workflow_id) {
                return Err(WorkflowError::Running(workflow_id.to_string()));
            }
            runs.insert(workflow_id.to_string(), Arc::clone(&run));
        }

        let mut guard = run.lock().await;
        for step in &mut steps {
            step.status = StepStatus::Pending;
            step.session_id = None;
            step.result_output = None;
            if let Err(e) = self
                .store
                .set_step_run(&step.id, StepStatus::Pending, None, None)
                .await
            {
                drop(guard);
                self.runs.write().await.remove(workflow_id);
                return Err(e.into());
            }
        }
        guard.steps = steps.into_iter().map(|s| (s.id.clone(), s)).collect();

        if let Err(e) = self.set_status(workflow_id, WorkflowStatus::Running).await {
            drop(guard);
            self.runs.write().await.remove(workflow_id);
            return Err(e);
        }
        info!(
            workflow_id,
            steps = guard.scheduler.total_steps(),
            "Workflow started"
        );

        let ready = guard.scheduler.next_ready();
        self.dispatch(workflow_id, &mut guard, ready).await;
        drop(guard);
        Ok(())
    }

    /// Cancel a run: stop every running step's session (those steps end
    /// `failed`), skip everything not yet dispatched, and mark the workflow
    /// `cancelled`.
    pub async fn stop(self: &Arc<Self>, workflow_id: &str) -> Result<Workflow, WorkflowError> {
        let run = self.runs.read().await.get(workflow_id).cloned();
        let Some(run) = run else {
            let workflow = self.get_workflow(workflow_id).await?;
            if workflow.status == WorkflowStatus::Running {
                // Left running by a previous process; nothing to stop.
                self.set_status(workflow_id, WorkflowStatus::Cancelled)
                    .await?;
                return self.get_workflow(workflow_id).await;
            }
            return Err(WorkflowError::NotRunning(workflow_id.to_string()));
        };

        let running = {
            let mut guard = run.lock().await;
            if guard.cancelled {
                return Err(WorkflowError::NotRunning(workflow_id.to_string()));
            }
            guard.cancelled = true;
            guard.running.clone()
        };

        let mut stops = JoinSet::new();
        for (step_id, session_id) in running {
            let sessions = Arc::clone(&self.sessions);
            stops.spawn(async move {
                let outcome = sessions.stop(&session_id).await;
                (step_id, session_id, outcome)
            });
        }
        let mut stopped = Vec::new();
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok(result) => stopped.push(result),
                Err(e) => warn!(workflow_id, error = %e, "Step stop task failed"),
            }
        }

        let mut guard = run.lock().await;
        for (step_id, session_id, outcome) in stopped {
            let session = match outcome {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(workflow_id, step_id, session_id, error = %e, "Failed to stop step session");
                    None
                }
            };
            self.settle_step(workflow_id, &mut guard, &step_id, &session_id, session.as_ref())
                .await;
        }
        guard.running.clear();
        for step_id in guard.scheduler.skip_remaining() {
            self.set_step(workflow_id, &mut guard, &step_id, StepStatus::Skipped, None)
                .await;
        }
        drop(guard);

        self.runs.write().await.remove(workflow_id);
        if let Err(e) = self.set_status(workflow_id, WorkflowStatus::Cancelled).await {
            warn!(workflow_id, error = %e, "Failed to record workflow cancellation");
        }
        info!(workflow_id, "Workflow cancelled");
        self.get_workflow(workflow_id).await
    }

    /// Stop every active run concurrently.
    pub async fn stop_all(self: &Arc<Self>) {
        let ids = self.active_runs().await;
        let mut stops = JoinSet::new();
        for id in ids {
            let engine = Arc::clone(self);
            stops.spawn(async move {
                if let Err(e) = engine.stop(&id).await {
                    debug!(workflow_id = %id, error = %e, "Workflow already finished");
                }
            });
        }
        while stops.join_next().await.is_some() {}
    }

    /// Ids of workflows with an active run in this process.
    pub async fn active_runs(&self) -> Vec<String> {
        self.runs.read().await.keys().cloned().collect()
    }

    /// Dispatch `ready` steps, then finish the run if nothing is left.
    async fn dispatch(self: &Arc<Self>, workflow_id: &str, run: &mut WorkflowRun, ready: Vec<String>) {
        for step_id in ready {
            if run.cancelled {
                break;
            }
            let Some(step) = run.steps.get(&step_id).cloned() else {
                continue;
            };

            let prompt = compose_prompt(&step, run);
            run.scheduler.mark_running(&step_id);
            let request = StartRequest {
                agent_name: step.agent_name.clone(),
                model: Some(step.model.clone()).filter(|m| !m.is_empty()),
                prompt,
                working_directory: None,
            };

            match self.sessions.start(request).await {
                Ok(session_id) => {
                    info!(workflow_id, step_id, session_id, "Step dispatched");
                    run.running.insert(step_id.clone(), session_id.clone());
                    self.set_step(
                        workflow_id,
                        run,
                        &step_id,
                        StepStatus::Running,
                        Some(&session_id),
                    )
                    .await;
                    tokio::spawn(Arc::clone(self).watch_step(
                        workflow_id.to_string(),
                        step_id,
                        session_id,
                    ));
                }
                Err(e) => {
                    warn!(workflow_id, step_id, error = %e, "Step failed to start");
                    self.fail_step(workflow_id, run, &step_id, e.session_id())
                        .await;
                }
            }
        }
        self.finish_if_complete(workflow_id, run).await;
    }

    /// Wait for a step's session to end and apply the outcome.
    fn watch_step(self: Arc<Self>, workflow_id: String, step_id: String, session_id: String) -> StepWatch {
        Box::pin(async move {
            let session = match self.sessions.wait(&session_id).await {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(%workflow_id, %step_id, %session_id, error = %e, "Lost track of step session");
                    None
                }
            };
            self.on_step_finished(&workflow_id, &step_id, &session_id, session.as_ref())
                .await;
        })
    }

    async fn on_step_finished(
        self: &Arc<Self>,
        workflow_id: &str,
        step_id: &str,
        session_id: &str,
        session: Option<&Session>,
    ) {
        let run = self.runs.read().await.get(workflow_id).cloned();
        let Some(run) = run else {
            return;
        };
        let mut guard = run.lock().await;
        if guard.cancelled || guard.running.get(step_id).map(String::as_str) != Some(session_id) {
            return;
        }
        guard.running.remove(step_id);

        let ready = self
            .settle_step(workflow_id, &mut guard, step_id, session_id, session)
            .await;
        self.dispatch(workflow_id, &mut guard, ready).await;
    }

    /// Mirror a finished session onto its step. Returns dependents that
    /// became ready.
    async fn settle_step(
        &self,
        workflow_id: &str,
        run: &mut WorkflowRun,
        step_id: &str,
        session_id: &str,
        session: Option<&Session>,
    ) -> Vec<String> {
        match session {
            Some(session) if session.status == SessionStatus::Completed => {
                if let Some(step) = run.steps.get_mut(step_id) {
                    step.result_output.clone_from(&session.result_text);
                }
                self.set_step(
                    workflow_id,
                    run,
                    step_id,
                    StepStatus::Completed,
                    Some(session_id),
                )
                .await;
                info!(workflow_id, step_id, "Step completed");
                run.scheduler.mark_completed(step_id)
            }
            _ => {
                self.fail_step(workflow_id, run, step_id, Some(session_id))
                    .await;
                Vec::new()
            }
        }
    }

    /// Mark a step failed and skip its transitive dependents.
    async fn fail_step(
        &self,
        workflow_id: &str,
        run: &mut WorkflowRun,
        step_id: &str,
        session_id: Option<&str>,
    ) {
        self.set_step(workflow_id, run, step_id, StepStatus::Failed, session_id)
            .await;
        info!(workflow_id, step_id, "Step failed");
        for skipped in run.scheduler.mark_failed(step_id) {
            self.set_step(workflow_id, run, &skipped, StepStatus::Skipped, None)
                .await;
        }
    }

    async fn finish_if_complete(&self, workflow_id: &str, run: &WorkflowRun) {
        if run.cancelled || !run.scheduler.is_complete() {
            return;
        }
        let status = if run.scheduler.has_failures() {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        let counts = run.scheduler.counts();
        self.runs.write().await.remove(workflow_id);
        if let Err(e) = self.set_status(workflow_id, status).await {
            warn!(workflow_id, error = %e, "Failed to record workflow outcome");
        }
        info!(
            workflow_id,
            %status,
            completed = counts.get(&StepState::Completed).copied().unwrap_or(0),
            failed = counts.get(&StepState::Failed).copied().unwrap_or(0),
            skipped = counts.get(&StepState::Skipped).copied().unwrap_or(0),
            "Workflow finished"
        );
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn get_step(&self, step_id: &str) -> Result<WorkflowStep, WorkflowError> {
        self.store
            .get_step(step_id)
            .await
            .map_err(|e| not_found(e, || WorkflowError::StepNotFound(step_id.to_string())))
    }

    async fn graph(
        &self,
        workflow_id: &str,
    ) -> Result<(Vec<String>, Vec<(String, String)>), WorkflowError> {
        let steps = self.store.list_steps(workflow_id).await?;
        let edges = self.store.list_edges(workflow_id).await?;
        Ok((
            steps.into_iter().map(|s| s.id).collect(),
            edge_pairs(&edges),
        ))
    }

    async fn ensure_editable(&self, workflow_id: &str) -> Result<(), WorkflowError> {
        if self.runs.read().await.contains_key(workflow_id) {
            return Err(WorkflowError::Running(workflow_id.to_string()));
        }
        Ok(())
    }

    /// Any structural edit invalidates a previous validation.
    async fn mark_edited(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        if workflow.status != WorkflowStatus::Draft {
            self.set_status(&workflow.id, WorkflowStatus::Draft).await?;
        }
        Ok(())
    }

    async fn set_status(&self, workflow_id: &str, status: WorkflowStatus) -> Result<(), WorkflowError> {
        self.store
            .set_workflow_status(workflow_id, status)
            .await
            .map_err(|e| not_found(e, || WorkflowError::NotFound(workflow_id.to_string())))?;
        self.sink.emit(Event::WorkflowStatus {
            workflow_id: workflow_id.to_string(),
            status,
        });
        Ok(())
    }

    /// Record a step transition in memory and storage, then emit it.
    async fn set_step(
        &self,
        workflow_id: &str,
        run: &mut WorkflowRun,
        step_id: &str,
        status: StepStatus,
        session_id: Option<&str>,
    ) {
        let Some(step) = run.steps.get_mut(step_id) else {
            return;
        };
        step.status = status;
        if let Some(session_id) = session_id {
            step.session_id = Some(session_id.to_string());
        }

        if let Err(e) = self
            .store
            .set_step_run(
                step_id,
                status,
                step.session_id.as_deref(),
                step.result_output.as_deref(),
            )
            .await
        {
            warn!(workflow_id, step_id, error = %e, "Failed to persist step status");
        }
        self.sink.emit(Event::StepStatus {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            status,
            session_id: step.session_id.clone(),
        });
    }
}

/// The step's prompt, followed by upstream results when `pass_context` is
/// set.
fn compose_prompt(step: &WorkflowStep, run: &WorkflowRun) -> String {
    let mut prompt = step.prompt.clone();
    if !step.pass_context {
        return prompt;
    }
    for upstream_id in run.scheduler.dependencies(&step.id) {
        let Some(upstream) = run.steps.get(upstream_id) else {
            continue;
        };
        if let Some(output) = &upstream.result_output {
            let _ = write!(
                prompt,
                "\n\n[Context from step {} ({})]:\n{output}",
                upstream.agent_name, upstream.id
            );
        }
    }
    prompt
}

fn edge_pairs(edges: &[WorkflowEdge]) -> Vec<(String, String)> {
    edges
        .iter()
        .map(|e| (e.source_step_id.clone(), e.target_step_id.clone()))
        .collect()
}

fn not_found(err: DatabaseError, missing: impl FnOnce() -> WorkflowError) -> WorkflowError {
    match err {
        DatabaseError::NotFound(_) => missing(),
        other => other.into(),
    }
}
