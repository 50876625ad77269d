//! OS-backed process runner for the agent CLI.
//!
//! Each spawned child gets three tasks: a stdout reader, a stderr reader (both
//! forwarding lines into one channel) and a monitor that owns the `Child`,
//! delivers signals and publishes the exit status.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::SubprocessError;
use crate::ports::{
    OutputLine, ProcessExit, ProcessHandle, ProcessRunner, ProcessSignal, ProcessSpec,
    SpawnedProcess,
};

/// Lines buffered between the pipe readers and the session reader task.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Spawns real child processes with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClaudeCliRunner;

impl ClaudeCliRunner {
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for ClaudeCliRunner {
    async fn spawn(&self, spec: ProcessSpec) -> Result<SpawnedProcess, SubprocessError> {
        if !spec.working_dir.is_dir() {
            return Err(SubprocessError::SpawnFailed {
                reason: format!(
                    "working directory {} does not exist",
                    spec.working_dir.display()
                ),
            });
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            program = %spec.program.display(),
            working_dir = %spec.working_dir.display(),
            argc = spec.args.len(),
            "Spawning agent subprocess"
        );

        let mut child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
            reason: format!("{}: {e}", spec.program.display()),
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SubprocessError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SubprocessError::SpawnFailed {
                reason: "Failed to capture stderr".to_string(),
            })?;

        let (line_tx, line_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        let stdout_tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if stdout_tx.send(OutputLine::Stdout(line)).await.is_err() {
                            debug!(?pid, "stdout consumer gone");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(?pid, error = %e, "stdout read failed");
                        break;
                    }
                }
            }
            debug!(?pid, "stdout reader finished");
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(?pid, "stderr: {}", line);
                if line_tx.send(OutputLine::Stderr(line)).await.is_err() {
                    break;
                }
            }
            debug!(?pid, "stderr reader finished");
        });

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(child, pid, signal_rx, exit_tx));

        Ok(SpawnedProcess {
            output: line_rx,
            handle: ProcessHandle::new(pid, signal_tx, exit_rx),
        })
    }

    fn signal_pid(&self, pid: u32, signal: ProcessSignal) -> bool {
        match send_signal(pid, signal) {
            Ok(()) => true,
            Err(e) => {
                debug!(pid, error = %e, "Signal not delivered");
                false
            }
        }
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Some(pid) = raw_pid(pid) else {
            return false;
        };
        // SAFETY: signal 0 only checks that the pid exists.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid, 0) };
        ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

/// Own the child until it exits, applying signals as they arrive.
async fn monitor(
    mut child: Child,
    pid: Option<u32>,
    mut signal_rx: mpsc::UnboundedReceiver<ProcessSignal>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let mut signals_open = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            signal = signal_rx.recv(), if signals_open => match signal {
                Some(ProcessSignal::Terminate) => {
                    if let Err(e) = terminate(&mut child, pid) {
                        warn!(?pid, error = %e, "Failed to send termination signal");
                    }
                }
                Some(ProcessSignal::Kill) => {
                    if let Err(e) = child.start_kill() {
                        warn!(?pid, error = %e, "Failed to kill process");
                    }
                }
                None => signals_open = false,
            },
        }
    };

    let code = match status {
        Ok(status) => {
            info!(?pid, ?status, "Agent process exited");
            status.code()
        }
        Err(e) => {
            warn!(?pid, error = %e, "Error waiting for process");
            None
        }
    };
    let _ = exit_tx.send(Some(ProcessExit { code }));
}

#[cfg(unix)]
fn terminate(_child: &mut Child, pid: Option<u32>) -> Result<(), SubprocessError> {
    // The monitor still owns the child, so it has not been reaped and the
    // pid cannot have been reused.
    pid.map_or(Ok(()), |pid| send_signal(pid, ProcessSignal::Terminate))
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, pid: Option<u32>) -> Result<(), SubprocessError> {
    child.start_kill().map_err(|e| SubprocessError::SignalFailed {
        pid: pid.unwrap_or_default(),
        reason: e.to_string(),
    })
}

/// Positive pids only: 0 and negative values address process groups.
#[cfg(unix)]
fn raw_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: ProcessSignal) -> Result<(), SubprocessError> {
    let Some(raw) = raw_pid(pid) else {
        return Err(SubprocessError::SignalFailed {
            pid,
            reason: "not a process id".to_string(),
        });
    };
    let signo = match signal {
        ProcessSignal::Terminate => libc::SIGTERM,
        ProcessSignal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(raw, signo) };
    if ret == 0 {
        Ok(())
    } else {
        Err(SubprocessError::SignalFailed {
            pid,
            reason: std::io::Error::last_os_error().to_string(),
        })
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: ProcessSignal) -> Result<(), SubprocessError> {
    Err(SubprocessError::SignalFailed {
        pid,
        reason: "signalling by pid is only supported on Unix".to_string(),
    })
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![("MARKER".to_string(), "visible".to_string())],
            working_dir: std::env::temp_dir(),
        }
    }

    async fn collect(mut output: mpsc::Receiver<OutputLine>) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        while let Some(line) = output.recv().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn streams_stdout_and_stderr_and_reports_exit_code() {
        let spawned = ClaudeCliRunner::new()
            .spawn(sh("echo one; echo two; echo oops 1>&2; exit 3"))
            .await
            .unwrap();
        let lines = collect(spawned.output).await;
        let stdout: Vec<_> = lines
            .iter()
            .filter_map(|l| match l {
                OutputLine::Stdout(s) => Some(s.as_str()),
                OutputLine::Stderr(_) => None,
            })
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
        assert!(lines.contains(&OutputLine::Stderr("oops".to_string())));
        assert_eq!(spawned.handle.wait().await.code, Some(3));
    }

    #[tokio::test]
    async fn parent_environment_is_not_inherited() {
        let spawned = ClaudeCliRunner::new()
            .spawn(sh("echo \"$MARKER:${HOME:-unset}\""))
            .await
            .unwrap();
        let lines = collect(spawned.output).await;
        assert_eq!(lines, vec![OutputLine::Stdout("visible:unset".to_string())]);
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_failure() {
        let mut spec = sh("true");
        spec.program = PathBuf::from("/definitely/not/here/claude");
        let err = ClaudeCliRunner::new().spawn(spec).await.unwrap_err();
        assert!(matches!(err, SubprocessError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn terminate_ends_a_running_process() {
        let spawned = ClaudeCliRunner::new().spawn(sh("exec sleep 30")).await.unwrap();
        assert!(spawned.handle.signal(ProcessSignal::Terminate));
        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.handle.wait())
            .await
            .expect("process should exit after SIGTERM");
        assert_eq!(exit.code, None);
    }

    #[tokio::test]
    async fn kill_ends_a_process_that_ignores_terminate() {
        let spawned = ClaudeCliRunner::new()
            .spawn(sh("trap '' TERM; echo ready; while true; do sleep 1; done"))
            .await
            .unwrap();
        let mut output = spawned.output;
        assert_eq!(output.recv().await, Some(OutputLine::Stdout("ready".to_string())));
        spawned.handle.signal(ProcessSignal::Terminate);
        let still_running =
            tokio::time::timeout(Duration::from_millis(300), spawned.handle.wait()).await;
        assert!(still_running.is_err());
        spawned.handle.signal(ProcessSignal::Kill);
        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.handle.wait())
            .await
            .expect("process should exit after SIGKILL");
        assert_eq!(exit.code, None);
    }

    #[tokio::test]
    async fn signal_by_pid_reaches_a_process_spawned_elsewhere() {
        let runner = ClaudeCliRunner::new();
        let spawned = runner.spawn(sh("exec sleep 30")).await.unwrap();
        let pid = spawned.handle.pid().unwrap();
        assert!(runner.is_alive(pid));

        // A second runner stands in for another conductor process.
        assert!(ClaudeCliRunner::new().signal_pid(pid, ProcessSignal::Terminate));
        tokio::time::timeout(Duration::from_secs(5), spawned.handle.wait())
            .await
            .expect("process should exit after SIGTERM by pid");
        assert!(!runner.is_alive(pid));
    }

    #[test]
    fn group_addressing_pids_are_refused() {
        let runner = ClaudeCliRunner::new();
        assert!(!runner.signal_pid(0, ProcessSignal::Terminate));
        assert!(!runner.signal_pid(u32::MAX, ProcessSignal::Kill));
        assert!(!runner.is_alive(0));
    }
}
