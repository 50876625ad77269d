//! In-memory process runner for tests.
//!
//! Each `spawn` pops the next [`Script`]. Scripted runs replay their lines and
//! exit on their own; interactive runs stay alive until the test drives them
//! through the returned [`FakeProcess`] or the session manager signals them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::SubprocessError;
use crate::ports::{
    OutputLine, ProcessExit, ProcessHandle, ProcessRunner, ProcessSignal, ProcessSpec,
    SpawnedProcess,
};

const FAKE_OUTPUT_CAPACITY: usize = 1024;
/// Pid of the first fake child; later children count up from here.
const FAKE_PID_BASE: u32 = 40_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Behaviour of one fake child.
#[derive(Debug, Clone, Default)]
pub enum Script {
    /// Write `lines` in order, then exit with `exit_code`.
    Run {
        lines: Vec<OutputLine>,
        exit_code: Option<i32>,
    },
    /// Stay alive until driven by the test or signalled.
    #[default]
    Interactive,
    /// Like `Interactive`, but only `Kill` ends the process.
    IgnoreTerminate,
    /// `spawn` itself fails with this reason.
    FailSpawn(String),
}

impl Script {
    /// Scripted run that only writes to stdout.
    pub fn stdout<I, S>(lines: I, exit_code: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Run {
            lines: lines
                .into_iter()
                .map(|l| OutputLine::Stdout(l.into()))
                .collect(),
            exit_code: Some(exit_code),
        }
    }

    /// A well-behaved agent: init, one assistant message, a successful result.
    pub fn completes(conversation_id: &str, result: &str) -> Self {
        Self::stdout(
            [
                init_line(conversation_id),
                assistant_line(result),
                result_line(result, false),
            ],
            0,
        )
    }
}

/// `system/init` message reporting the agent's conversation id.
pub fn init_line(conversation_id: &str) -> String {
    serde_json::json!({
        "type": "system",
        "subtype": "init",
        "session_id": conversation_id,
        "model": "sonnet",
        "tools": [],
    })
    .to_string()
}

pub fn assistant_line(text: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "message": {
            "content": [{"type": "text", "text": text}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 5},
        },
    })
    .to_string()
}

/// Terminal `result` message.
pub fn result_line(result: &str, is_error: bool) -> String {
    serde_json::json!({
        "type": "result",
        "subtype": if is_error { "error_during_execution" } else { "success" },
        "is_error": is_error,
        "result": result,
        "duration_ms": 12,
        "num_turns": 1,
        "total_cost_usd": 0.01,
        "usage": {"input_tokens": 10, "output_tokens": 5},
    })
    .to_string()
}

/// Test-side handle on one fake child.
#[derive(Debug, Clone)]
pub struct FakeProcess {
    pid: u32,
    spec: Arc<ProcessSpec>,
    signal_tx: mpsc::UnboundedSender<ProcessSignal>,
    output: Arc<Mutex<Option<mpsc::Sender<OutputLine>>>>,
    exit: Arc<watch::Sender<Option<ProcessExit>>>,
    signals: Arc<Mutex<Vec<ProcessSignal>>>,
}

impl FakeProcess {
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// The positional prompt (last argument).
    pub fn prompt(&self) -> &str {
        self.spec.args.last().map_or("", String::as_str)
    }

    /// Value following `flag` in the argument vector.
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        let pos = self.spec.args.iter().position(|a| a == flag)?;
        self.spec.args.get(pos + 1).map(String::as_str)
    }

    pub async fn stdout(&self, line: impl Into<String>) {
        self.send(OutputLine::Stdout(line.into())).await;
    }

    pub async fn stderr(&self, line: impl Into<String>) {
        self.send(OutputLine::Stderr(line.into())).await;
    }

    async fn send(&self, line: OutputLine) {
        let tx = lock(&self.output).clone();
        if let Some(tx) = tx {
            let _ = tx.send(line).await;
        }
    }

    /// Close both output streams and report the exit status.
    pub fn exit(&self, code: Option<i32>) {
        lock(&self.output).take();
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(ProcessExit { code });
            true
        });
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Signals delivered so far, in order.
    pub fn signals(&self) -> Vec<ProcessSignal> {
        lock(&self.signals).clone()
    }
}

#[derive(Default)]
struct FakeState {
    scripts: VecDeque<Script>,
    specs: Vec<ProcessSpec>,
    processes: Vec<FakeProcess>,
}

/// [`ProcessRunner`] that never touches the OS.
pub struct FakeRunner {
    state: Mutex<FakeState>,
    spawned: watch::Sender<usize>,
    next_pid: AtomicU32,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            spawned: watch::Sender::new(0),
            next_pid: AtomicU32::new(FAKE_PID_BASE),
        }
    }

    /// Queue the behaviour of the next spawn. An empty queue means
    /// [`Script::Interactive`].
    pub fn push(&self, script: Script) {
        lock(&self.state).scripts.push_back(script);
    }

    /// Every spec passed to `spawn`, including failed ones.
    pub fn specs(&self) -> Vec<ProcessSpec> {
        lock(&self.state).specs.clone()
    }

    /// Successfully spawned processes, in spawn order.
    pub fn processes(&self) -> Vec<FakeProcess> {
        lock(&self.state).processes.clone()
    }

    /// Wait until the `index`th successful spawn (0-based) has happened.
    pub async fn process(&self, index: usize) -> FakeProcess {
        let mut rx = self.spawned.subscribe();
        let _ = rx.wait_for(|count| *count > index).await;
        lock(&self.state).processes[index].clone()
    }

    /// First spawned process whose prompt starts with `prefix`.
    fn find_by_pid(&self, pid: u32) -> Option<FakeProcess> {
        lock(&self.state)
            .processes
            .iter()
            .find(|p| p.pid == pid)
            .cloned()
    }

    pub fn find_by_prompt(&self, prefix: &str) -> Option<FakeProcess> {
        lock(&self.state)
            .processes
            .iter()
            .find(|p| p.prompt().starts_with(prefix))
            .cloned()
    }

    /// Wait until a process whose prompt starts with `prefix` is spawned.
    pub async fn wait_for_prompt(&self, prefix: &str) -> FakeProcess {
        let mut rx = self.spawned.subscribe();
        loop {
            if let Some(process) = self.find_by_prompt(prefix) {
                return process;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn spawn(&self, spec: ProcessSpec) -> Result<SpawnedProcess, SubprocessError> {
        let script = {
            let mut state = lock(&self.state);
            state.specs.push(spec.clone());
            state.scripts.pop_front().unwrap_or_default()
        };

        let ignore_terminate = match &script {
            Script::FailSpawn(reason) => {
                return Err(SubprocessError::SpawnFailed {
                    reason: reason.clone(),
                });
            }
            Script::IgnoreTerminate => true,
            Script::Run { .. } | Script::Interactive => false,
        };

        let (line_tx, line_rx) = mpsc::channel(FAKE_OUTPUT_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let process = FakeProcess {
            pid,
            spec: Arc::new(spec),
            signal_tx: signal_tx.clone(),
            output: Arc::new(Mutex::new(Some(line_tx))),
            exit: Arc::new(exit_tx),
            signals: Arc::new(Mutex::new(Vec::new())),
        };

        tokio::spawn(fake_monitor(process.clone(), signal_rx, ignore_terminate));

        if let Script::Run { lines, exit_code } = script {
            let driver = process.clone();
            tokio::spawn(async move {
                for line in lines {
                    driver.send(line).await;
                }
                driver.exit(exit_code);
            });
        }

        lock(&self.state).processes.push(process);
        self.spawned.send_modify(|count| *count += 1);

        Ok(SpawnedProcess {
            output: line_rx,
            handle: ProcessHandle::new(Some(pid), signal_tx, exit_rx),
        })
    }

    fn signal_pid(&self, pid: u32, signal: ProcessSignal) -> bool {
        self.find_by_pid(pid)
            .is_some_and(|process| !process.has_exited() && process.signal_tx.send(signal).is_ok())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.find_by_pid(pid)
            .is_some_and(|process| !process.has_exited())
    }
}

/// Apply signals until the process exits, then drop the receiver.
async fn fake_monitor(
    process: FakeProcess,
    mut signal_rx: mpsc::UnboundedReceiver<ProcessSignal>,
    ignore_terminate: bool,
) {
    let mut exit_rx = process.exit.subscribe();
    loop {
        tokio::select! {
            _ = exit_rx.wait_for(Option::is_some) => break,
            signal = signal_rx.recv() => {
                let Some(signal) = signal else { break };
                lock(&process.signals).push(signal);
                match signal {
                    ProcessSignal::Terminate if ignore_terminate => {}
                    ProcessSignal::Terminate | ProcessSignal::Kill => process.exit(None),
                }
            }
        }
    }
}
