//! Session manager: the single owner of every agent process.
//!
//! Each live session has exactly one reader task. It moves the session to
//! `running` on first output, feeds every line through the
//! [`StreamPipeline`], tracks usage and the last `result` message, and on
//! exit decides the terminal status from that result rather than the exit
//! code.
//!
//! A session leaves the in-memory table once it is terminal; later reads go
//! to the store. Sessions started by another conductor process sharing the
//! database are stopped through the pid recorded on their row.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use conductor_core::Config;
use conductor_core::db::unix_timestamp;
use conductor_core::ndjson::{Message, SessionResult, Usage};

use super::rate_limit::detect_rate_limit;
use super::{REASON_NO_RESULT, REASON_RESULT_ERROR, REASON_SPAWN_FAILED, SessionError};
use crate::events::Event;
use crate::models::{LogEntry, Session, SessionStatus};
use crate::pipeline::StreamPipeline;
use crate::ports::{
    EventSink, OutputLine, ProcessHandle, ProcessRunner, ProcessSignal, ProcessSpec,
    SessionStore,
};
use crate::subprocess::{Invocation, build_args, filtered_env};

/// How often a pid owned by another process is checked after signalling it.
const PID_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Launch settings shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub program: PathBuf,
    pub default_model: String,
    pub working_directory: PathBuf,
    /// Complete child environment, already filtered through the allowlist.
    pub env: Vec<(String, String)>,
    /// Grace period between terminate and kill.
    pub terminate_timeout: Duration,
}

impl SessionSettings {
    /// Resolve settings from configuration and the current process
    /// environment.
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.daemon.claude_bin.clone(),
            default_model: config.sessions.default_model.clone(),
            working_directory: config
                .daemon
                .working_directory
                .clone()
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_else(|| PathBuf::from(".")),
            env: filtered_env(&config.sessions.env_allowlist, |key| {
                std::env::var(key).ok()
            }),
            terminate_timeout: Duration::from_secs(config.sessions.terminate_timeout_secs),
        }
    }
}

/// Parameters for a fresh session.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub agent_name: String,
    /// Falls back to the configured default model when `None` or empty.
    pub model: Option<String>,
    pub prompt: String,
    /// Falls back to the configured working directory.
    pub working_directory: Option<PathBuf>,
}

struct LiveProcess {
    handle: ProcessHandle,
    reader: Option<JoinHandle<()>>,
    stop_requested: bool,
}

struct SessionSlot {
    record: Session,
    live: Option<LiveProcess>,
    /// Set once, to the final record.
    outcome: watch::Sender<Option<Session>>,
}

struct Launch {
    id: String,
    agent_name: String,
    model: String,
    prompt: String,
    working_directory: PathBuf,
    conversation_id: String,
    resumed_from: Option<String>,
    args: Vec<String>,
}

/// Owns the table of sessions started by this process.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionSlot>>,
    runner: Arc<dyn ProcessRunner>,
    pipeline: Arc<StreamPipeline>,
    store: Arc<dyn SessionStore>,
    sink: Arc<dyn EventSink>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        runner: Arc<dyn ProcessRunner>,
        pipeline: Arc<StreamPipeline>,
        store: Arc<dyn SessionStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            runner,
            pipeline,
            store,
            sink,
            settings,
        }
    }

    /// Start a fresh session and return its id.
    ///
    /// A spawn failure still leaves a session record behind, in status
    /// `error` with reason `spawn_failed`, and the error carries its id.
    pub async fn start(self: &Arc<Self>, request: StartRequest) -> Result<String, SessionError> {
        let model = request
            .model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.settings.default_model.clone());
        let id = Uuid::new_v4().to_string();
        let args = build_args(
            Invocation::Fresh {
                session_id: &id,
                agent_name: &request.agent_name,
                model: &model,
            },
            &request.prompt,
        );

        self.launch(Launch {
            conversation_id: id.clone(),
            id,
            agent_name: request.agent_name,
            model,
            prompt: request.prompt,
            working_directory: request
                .working_directory
                .unwrap_or_else(|| self.settings.working_directory.clone()),
            resumed_from: None,
            args,
        })
        .await
    }

    /// Continue a prior session's conversation in a new session.
    ///
    /// The prior session is stopped first if it is still live. The new
    /// session inherits the agent, working directory and (unless overridden)
    /// the model.
    pub async fn resume(
        self: &Arc<Self>,
        session_id: &str,
        prompt: &str,
        model: Option<String>,
    ) -> Result<String, SessionError> {
        let prior = self.get(session_id).await?;
        let prior = if prior.status.is_terminal() {
            prior
        } else {
            self.stop(session_id).await?
        };

        let conversation_id = prior
            .conversation_id
            .clone()
            .unwrap_or_else(|| prior.id.clone());
        let model = model.filter(|m| !m.is_empty()).unwrap_or(prior.model);
        let args = build_args(
            Invocation::Resume {
                conversation_id: &conversation_id,
                model: &model,
            },
            prompt,
        );

        info!(prior = session_id, conversation_id, "Resuming session");
        self.launch(Launch {
            id: Uuid::new_v4().to_string(),
            agent_name: prior.agent_name,
            model,
            prompt: prompt.to_string(),
            working_directory: PathBuf::from(prior.working_directory),
            conversation_id,
            resumed_from: Some(prior.id),
            args,
        })
        .await
    }

    async fn launch(self: &Arc<Self>, launch: Launch) -> Result<String, SessionError> {
        let record = Session {
            id: launch.id.clone(),
            agent_name: launch.agent_name,
            model: launch.model,
            prompt: launch.prompt,
            status: SessionStatus::Starting,
            working_directory: launch.working_directory.display().to_string(),
            conversation_id: Some(launch.conversation_id),
            resumed_from: launch.resumed_from,
            error_reason: None,
            result_text: None,
            started_at: unix_timestamp(),
            ended_at: None,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            pid: None,
        };
        let session_id = launch.id;

        // Like every later record write, a failure here is logged and the
        // session runs regardless.
        self.save(&record).await;
        self.pipeline.open(&session_id).await;
        self.sessions.write().await.insert(
            session_id.clone(),
            SessionSlot {
                record: record.clone(),
                live: None,
                outcome: watch::Sender::new(None),
            },
        );
        self.emit_status(&record);
        info!(session_id, agent = %record.agent_name, model = %record.model, "Session starting");

        let spec = ProcessSpec {
            program: self.settings.program.clone(),
            args: launch.args,
            env: self.settings.env.clone(),
            working_dir: launch.working_directory,
        };

        let spawned = match self.runner.spawn(spec).await {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(session_id, error = %e, "Failed to spawn agent");
                self.finish(&session_id, SessionStatus::Error, Some(REASON_SPAWN_FAILED))
                    .await;
                return Err(SessionError::SpawnFailed {
                    session_id,
                    reason: e.to_string(),
                });
            }
        };

        let record = {
            let mut sessions = self.sessions.write().await;
            let Some(slot) = sessions
                .get_mut(&session_id)
                .filter(|slot| !slot.record.status.is_terminal())
            else {
                // Stopped while the spawn was in flight.
                spawned.handle.signal(ProcessSignal::Kill);
                return Ok(session_id);
            };
            let reader = tokio::spawn(Arc::clone(self).run_reader(
                session_id.clone(),
                spawned.output,
                spawned.handle.clone(),
            ));
            slot.record.pid = spawned.handle.pid().map(i64::from);
            slot.live = Some(LiveProcess {
                handle: spawned.handle,
                reader: Some(reader),
                stop_requested: false,
            });
            slot.record.clone()
        };
        self.save(&record).await;

        Ok(session_id)
    }

    async fn run_reader(
        self: Arc<Self>,
        session_id: String,
        mut output: mpsc::Receiver<OutputLine>,
        handle: ProcessHandle,
    ) {
        let mut seen_output = false;
        let mut last_result: Option<SessionResult> = None;

        while let Some(line) = output.recv().await {
            if !seen_output {
                seen_output = true;
                self.transition(&session_id, SessionStatus::Running, None)
                    .await;
            }
            let Some(ingested) = self.pipeline.ingest(&session_id, &line).await else {
                continue;
            };
            match ingested.message {
                Some(Message::System(system))
                    if system.is_init() && !system.session_id.is_empty() =>
                {
                    self.record_conversation(&session_id, &system.session_id)
                        .await;
                }
                Some(Message::Assistant(assistant)) if !assistant.usage.is_empty() => {
                    self.add_usage(&session_id, assistant.usage).await;
                }
                Some(Message::Result(result)) => {
                    self.record_result(&session_id, &result).await;
                    last_result = Some(result);
                }
                _ => {}
            }
        }

        let exit = handle.wait().await;
        if self.stop_requested(&session_id).await {
            debug!(session_id, "Reader finished after stop request");
            return;
        }
        if self.stopped_elsewhere(&session_id).await {
            info!(session_id, exit_code = ?exit.code, "Session was stopped by another process");
            self.finish(&session_id, SessionStatus::Stopped, None).await;
            return;
        }

        let (status, reason) = match &last_result {
            Some(result) if result.succeeded() => (SessionStatus::Completed, None),
            Some(_) => (SessionStatus::Error, Some(REASON_RESULT_ERROR)),
            None => (SessionStatus::Error, Some(REASON_NO_RESULT)),
        };
        info!(session_id, exit_code = ?exit.code, %status, "Agent process exited");
        self.finish(&session_id, status, reason).await;
    }

    async fn stop_requested(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|slot| slot.live.as_ref())
            .is_some_and(|live| live.stop_requested)
    }

    /// Whether another process recorded this session as `stopped`.
    async fn stopped_elsewhere(&self, session_id: &str) -> bool {
        match self.store.get_session(session_id).await {
            Ok(Some(stored)) => stored.status == SessionStatus::Stopped,
            Ok(None) => false,
            Err(e) => {
                warn!(session_id, error = %e, "Failed to read stored session status");
                false
            }
        }
    }

    /// Stop a session: terminate, escalate to kill after the grace period,
    /// drain its reader, flush its log entries and mark it `stopped`.
    ///
    /// Stopping a session that already ended returns it unchanged. A session
    /// owned by another process is stopped through its recorded pid.
    pub async fn stop(&self, session_id: &str) -> Result<Session, SessionError> {
        let (handle, reader) = {
            let mut sessions = self.sessions.write().await;
            let Some(slot) = sessions.get_mut(session_id) else {
                drop(sessions);
                return match self.store.get_session(session_id).await? {
                    Some(record) if record.status.is_terminal() => Ok(record),
                    Some(record) => self.stop_detached(record).await,
                    None => Err(SessionError::NotFound(session_id.to_string())),
                };
            };
            if slot.record.status.is_terminal() {
                return Ok(slot.record.clone());
            }
            match slot.live.as_mut() {
                Some(live) => {
                    live.stop_requested = true;
                    (Some(live.handle.clone()), live.reader.take())
                }
                None => (None, None),
            }
        };

        if let Some(handle) = handle {
            self.terminate(session_id, &handle).await;
        }
        if let Some(mut reader) = reader
            && tokio::time::timeout(self.settings.terminate_timeout, &mut reader)
                .await
                .is_err()
        {
            warn!(session_id, "Reader did not drain in time, aborting it");
            reader.abort();
        }

        let stopped = self.finish(session_id, SessionStatus::Stopped, None).await;
        info!(session_id, "Session stopped");
        match stopped {
            Some(record) => Ok(record),
            None => self.get(session_id).await,
        }
    }

    async fn terminate(&self, session_id: &str, handle: &ProcessHandle) {
        let grace = self.settings.terminate_timeout;
        handle.signal(ProcessSignal::Terminate);
        if tokio::time::timeout(grace, handle.wait()).await.is_ok() {
            return;
        }
        warn!(session_id, pid = ?handle.pid(), "Graceful termination timed out, killing");
        handle.signal(ProcessSignal::Kill);
        if tokio::time::timeout(grace, handle.wait()).await.is_err() {
            warn!(session_id, pid = ?handle.pid(), "Process did not report exit after kill");
        }
    }

    /// Record the stop first so the owning process adopts it when its child
    /// exits, then signal the recorded pid. A row without a pid (its owner
    /// died before spawning) is only marked.
    async fn stop_detached(&self, mut record: Session) -> Result<Session, SessionError> {
        let pid = record.pid.and_then(|pid| u32::try_from(pid).ok());
        record.status = SessionStatus::Stopped;
        record.ended_at.get_or_insert_with(unix_timestamp);
        record.error_reason = None;
        record.pid = None;
        self.store.save_session(&record).await?;
        self.emit_status(&record);

        match pid {
            Some(pid) => self.terminate_pid(&record.id, pid).await,
            None => debug!(session_id = %record.id, "No process recorded for session"),
        }
        info!(session_id = %record.id, ?pid, "Session stopped through the store");
        Ok(record)
    }

    async fn terminate_pid(&self, session_id: &str, pid: u32) {
        if !self.runner.signal_pid(pid, ProcessSignal::Terminate) {
            debug!(session_id, pid, "Process already gone");
            return;
        }
        if self.pid_gone_within_grace(pid).await {
            return;
        }
        warn!(session_id, pid, "Graceful termination timed out, killing");
        self.runner.signal_pid(pid, ProcessSignal::Kill);
        if !self.pid_gone_within_grace(pid).await {
            warn!(session_id, pid, "Process still present after kill");
        }
    }

    async fn pid_gone_within_grace(&self, pid: u32) -> bool {
        tokio::time::timeout(self.settings.terminate_timeout, async {
            while self.runner.is_alive(pid) {
                tokio::time::sleep(PID_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok()
    }

    /// Resolve once the session is terminal and return its final record.
    pub async fn wait(&self, session_id: &str) -> Result<Session, SessionError> {
        let outcome = self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|slot| slot.outcome.subscribe());
        if let Some(mut outcome) = outcome {
            let record = outcome
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|done| done.clone());
            if let Some(record) = record {
                return Ok(record);
            }
        }
        self.get(session_id).await
    }

    /// Current record, from memory for sessions of this process, otherwise
    /// from the store.
    pub async fn get(&self, session_id: &str) -> Result<Session, SessionError> {
        if let Some(slot) = self.sessions.read().await.get(session_id) {
            return Ok(slot.record.clone());
        }
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Every known session, most recent first.
    pub async fn list(&self) -> Result<Vec<Session>, SessionError> {
        let mut sessions = self.store.list_sessions().await?;
        let live = self.sessions.read().await;
        for session in &mut sessions {
            if let Some(slot) = live.get(&session.id) {
                session.clone_from(&slot.record);
            }
        }
        drop(live);
        Ok(sessions)
    }

    /// Durable log history.
    pub async fn logs(
        &self,
        session_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<LogEntry>, SessionError> {
        Ok(self.pipeline.history(session_id, offset, limit).await?)
    }

    pub async fn count_logs(&self, session_id: &str) -> Result<u64, SessionError> {
        Ok(self.pipeline.count(session_id).await?)
    }

    /// Deduplicated view of the session's most recent output.
    pub async fn view(&self, session_id: &str) -> Result<Vec<LogEntry>, SessionError> {
        Ok(self.pipeline.view(session_id).await?)
    }

    /// Ids of sessions with a live process.
    pub async fn live_sessions(&self) -> Vec<String> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.live.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Stop every live session concurrently, then flush the pipeline.
    pub async fn shutdown(self: &Arc<Self>) {
        let ids = self.live_sessions().await;
        let mut stops = JoinSet::new();
        for id in ids {
            let manager = Arc::clone(self);
            stops.spawn(async move {
                if let Err(e) = manager.stop(&id).await {
                    warn!(session_id = %id, error = %e, "Failed to stop session during shutdown");
                }
            });
        }
        let stopped = stops.len();
        while stops.join_next().await.is_some() {}
        self.pipeline.flush_all().await;
        info!(stopped, "Session manager shut down");
    }

    // =========================================================================
    // Record updates
    // =========================================================================

    /// Close the session's stream (emitting and persisting pending entries)
    /// and move it to a terminal status.
    async fn finish(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: Option<&str>,
    ) -> Option<Session> {
        self.pipeline.close(session_id).await;
        self.transition(session_id, status, reason).await
    }

    /// Apply a status transition if it is legal. Terminal transitions set
    /// `ended_at` once, drop the session from the table and wake waiters.
    async fn transition(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: Option<&str>,
    ) -> Option<Session> {
        let record = {
            let mut sessions = self.sessions.write().await;
            let slot = sessions.get_mut(session_id)?;
            if !slot.record.status.can_transition_to(status) {
                debug!(session_id, from = %slot.record.status, to = %status, "Ignoring transition");
                return None;
            }
            slot.record.status = status;
            if status.is_terminal() {
                slot.record.ended_at.get_or_insert_with(unix_timestamp);
                slot.record.error_reason = reason.map(str::to_string);
                slot.record.pid = None;
                slot.live = None;
            }
            slot.record.clone()
        };

        self.save(&record).await;
        self.emit_status(&record);
        // Removed only after the terminal record is stored, so readers never
        // fall back to a stale row.
        if status.is_terminal() {
            let slot = self.sessions.write().await.remove(session_id);
            if let Some(slot) = slot {
                slot.outcome.send_replace(Some(record.clone()));
            }
        }
        info!(session_id, %status, "Session status changed");
        Some(record)
    }

    async fn update(&self, session_id: &str, f: impl FnOnce(&mut Session)) -> Option<Session> {
        let record = {
            let mut sessions = self.sessions.write().await;
            let slot = sessions.get_mut(session_id)?;
            f(&mut slot.record);
            slot.record.clone()
        };
        self.save(&record).await;
        Some(record)
    }

    async fn record_conversation(&self, session_id: &str, conversation_id: &str) {
        debug!(session_id, conversation_id, "Agent reported conversation id");
        self.update(session_id, |s| {
            s.conversation_id = Some(conversation_id.to_string());
        })
        .await;
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn add_usage(&self, session_id: &str, usage: Usage) {
        if let Some(record) = self
            .update(session_id, |s| {
                s.input_tokens += usage.input_tokens as i64;
                s.output_tokens += usage.output_tokens as i64;
            })
            .await
        {
            self.emit_usage(&record);
        }
    }

    async fn record_result(&self, session_id: &str, result: &SessionResult) {
        let Some(record) = self
            .update(session_id, |s| {
                if let Some(text) = &result.result {
                    s.result_text = Some(text.clone());
                }
                if let Some(cost) = result.cost_usd {
                    s.cost_usd = cost;
                }
            })
            .await
        else {
            return;
        };
        self.emit_usage(&record);

        if !result.succeeded()
            && let Some(limit) = result.result.as_deref().and_then(detect_rate_limit)
        {
            warn!(session_id, reset_at = ?limit.reset_at, "Agent hit a rate limit");
            self.sink.emit(Event::RateLimited {
                session_id: session_id.to_string(),
                reset_at: limit.reset_at,
                message: limit.message,
            });
        }
    }

    async fn save(&self, record: &Session) {
        if let Err(e) = self.store.save_session(record).await {
            warn!(session_id = %record.id, error = %e, "Failed to persist session record");
        }
    }

    fn emit_status(&self, record: &Session) {
        self.sink.emit(Event::SessionStatus {
            session_id: record.id.clone(),
            agent_name: record.agent_name.clone(),
            model: record.model.clone(),
            status: record.status,
            ended_at: record.ended_at,
            error_reason: record.error_reason.clone(),
        });
    }

    fn emit_usage(&self, record: &Session) {
        self.sink.emit(Event::Usage {
            session_id: record.id.clone(),
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            cost_usd: record.cost_usd,
        });
    }
}
