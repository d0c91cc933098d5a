//! A single owned agent process and its lifecycle state machine.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio_util::sync::CancellationToken;

use super::{InvocationId, ProcessEntry};

/// Why a process ended without a usable exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessFailure {
    TimedOut(Duration),
    /// Killed by a signal it did not receive from us.
    Signaled(i32),
    Spawn(String),
    Wait(String),
}

impl fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessFailure::TimedOut(d) => write!(f, "timed out after {:.1}s", d.as_secs_f64()),
            ProcessFailure::Signaled(sig) => write!(f, "killed by signal {sig}"),
            ProcessFailure::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            ProcessFailure::Wait(msg) => write!(f, "wait failed: {msg}"),
        }
    }
}

/// `Spawning → Running → (Completed | Failed | Cancelled)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Spawning,
    Running,
    Completed(i32),
    Failed(ProcessFailure),
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed(_) | ProcessState::Failed(_) | ProcessState::Cancelled
        )
    }

    fn can_advance_to(&self, next: &ProcessState) -> bool {
        match self {
            ProcessState::Spawning => *next == ProcessState::Running || next.is_terminal(),
            ProcessState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Apply a transition if the state machine allows it.
pub(super) fn advance(state: &Mutex<ProcessState>, next: ProcessState) -> bool {
    let mut current = state.lock().unwrap();
    if current.can_advance_to(&next) {
        *current = next;
        true
    } else {
        false
    }
}

/// Owns one spawned process.
///
/// The process runs in its own process group. Every way out of the handle
/// (natural exit, timeout, cancel, drop) signals the whole group, so no
/// descendant outlives it.
pub struct ProcessHandle {
    pub(super) id: InvocationId,
    pub(super) program: String,
    pub(super) child: Child,
    pub(super) pid: Option<u32>,
    pub(super) stdout: Option<ChildStdout>,
    pub(super) stderr: Option<ChildStderr>,
    pub(super) state: Arc<Mutex<ProcessState>>,
    pub(super) cancel: CancellationToken,
    pub(super) timeout: Option<Duration>,
    pub(super) deadline: Option<tokio::time::Instant>,
    pub(super) started: Instant,
    pub(super) entries: Arc<Mutex<HashMap<InvocationId, ProcessEntry>>>,
}

enum Wake {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

impl ProcessHandle {
    pub fn id(&self) -> &InvocationId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    pub fn state(&self) -> ProcessState {
        self.state.lock().unwrap().clone()
    }

    /// Request termination. Idempotent; does nothing once terminal.
    pub fn cancel(&self) {
        if !self.state().is_terminal() {
            self.cancel.cancel();
        }
    }

    /// Suspend until the process reaches a terminal state and return it.
    ///
    /// Calling again after that returns the same state.
    pub async fn wait(&mut self) -> ProcessState {
        let current = self.state();
        if current.is_terminal() {
            return current;
        }

        let deadline = self.deadline;
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        // An exit that already happened wins over a cancel or deadline that
        // arrived after it.
        let wake = tokio::select! {
            biased;
            status = self.child.wait() => Wake::Exited(status),
            _ = self.cancel.cancelled() => Wake::Cancelled,
            _ = expiry => Wake::TimedOut,
        };

        let outcome = match wake {
            Wake::Exited(Ok(status)) => match status.code() {
                Some(code) => ProcessState::Completed(code),
                None => ProcessState::Failed(ProcessFailure::Signaled(status.signal().unwrap_or(0))),
            },
            Wake::Exited(Err(e)) => ProcessState::Failed(ProcessFailure::Wait(e.to_string())),
            Wake::Cancelled => ProcessState::Cancelled,
            Wake::TimedOut => ProcessState::Failed(ProcessFailure::TimedOut(
                self.timeout.unwrap_or_default(),
            )),
        };

        // Descendants may still hold the group open after the leader exits.
        self.kill_group();
        if !matches!(outcome, ProcessState::Completed(_) | ProcessState::Failed(ProcessFailure::Signaled(_))) {
            let _ = self.child.wait().await;
        }

        let elapsed = self.started.elapsed().as_secs_f64();
        match &outcome {
            ProcessState::Completed(code) => {
                tracing::info!(id = %self.id, program = %self.program, exit_code = code, elapsed_secs = elapsed, "Process exited");
            }
            ProcessState::Cancelled => {
                tracing::info!(id = %self.id, program = %self.program, elapsed_secs = elapsed, "Process cancelled");
            }
            ProcessState::Failed(reason) => {
                tracing::warn!(id = %self.id, program = %self.program, %reason, elapsed_secs = elapsed, "Process failed");
            }
            ProcessState::Spawning | ProcessState::Running => {}
        }

        advance(&self.state, outcome);
        self.state()
    }

    /// SIGKILL the whole process group.
    fn kill_group(&self) {
        if let Some(pid) = self.pid {
            let pgid = nix::unistd::Pid::from_raw(pid as i32);
            let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.state().is_terminal() {
            tracing::warn!(id = %self.id, program = %self.program, "Process handle released while running; killing group");
            self.kill_group();
            let _ = self.child.start_kill();
            advance(&self.state, ProcessState::Cancelled);
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&self.id);
        }
    }
}
