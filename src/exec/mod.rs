//! Agent process spawning and lifecycle.
//!
//! [`ProcessManager`] is the registry of every live agent process. It hands
//! out a [`ProcessHandle`] per spawn and keeps the control half (state and
//! cancellation token) so any task can cancel or inspect a process by id.
//!
//! **Cancellation model:** the manager holds a root [`CancellationToken`];
//! each process gets a child of it. [`ProcessManager::child_scope`] derives a
//! manager whose root is a child of this one, sharing the same registry, so
//! cancelling a scope cascades to everything spawned through it.

pub mod handle;
pub mod output;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use handle::{ProcessFailure, ProcessHandle, ProcessState};
pub use output::OutputTail;

use crate::error::SpawnError;
use crate::invocation::InvocationSpec;

/// Unique identifier for one spawned process (UUID v4 string).
pub type InvocationId = String;

/// Read-only view of a registered process.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub id: InvocationId,
    pub program: String,
    pub pid: Option<u32>,
    pub state: ProcessState,
    /// ISO 8601 spawn time.
    pub spawned_at: String,
}

pub(crate) struct ProcessEntry {
    program: String,
    pid: Option<u32>,
    state: Arc<Mutex<ProcessState>>,
    cancel: CancellationToken,
    spawned_at: String,
}

#[derive(Clone)]
pub struct ProcessManager {
    entries: Arc<Mutex<HashMap<InvocationId, ProcessEntry>>>,
    root_cancel_token: CancellationToken,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl ProcessManager {
    pub fn new(root_cancel_token: CancellationToken) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            root_cancel_token,
        }
    }

    /// A manager sharing this registry whose cancellation is nested under
    /// this one.
    pub fn child_scope(&self) -> ProcessManager {
        Self {
            entries: self.entries.clone(),
            root_cancel_token: self.root_cancel_token.child_token(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.root_cancel_token
    }

    /// Spawn `spec` in `working_dir`.
    ///
    /// `env` is the execution environment; `spec.env` is layered on top. The
    /// stdin payload, if any, is written on a background task and the pipe is
    /// closed afterwards. `timeout` is measured from this call.
    pub fn spawn(
        &self,
        spec: &InvocationSpec,
        working_dir: &Path,
        env: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<ProcessHandle, SpawnError> {
        let id: InvocationId = Uuid::new_v4().to_string();
        let cancel = self.root_cancel_token.child_token();
        let state = Arc::new(Mutex::new(ProcessState::Spawning));
        let spawned_at = Utc::now().to_rfc3339();

        self.entries.lock().unwrap().insert(
            id.clone(),
            ProcessEntry {
                program: spec.program.clone(),
                pid: None,
                state: state.clone(),
                cancel: cancel.clone(),
                spawned_at,
            },
        );

        // process_group(0) requires the CommandExt trait on Unix.
        #[allow(unused_imports)]
        use std::os::unix::process::CommandExt;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(working_dir)
            .envs(env)
            .envs(&spec.env)
            .process_group(0)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = SpawnError::from_io(&spec.program, e);
                tracing::warn!(id = %id, program = %spec.program, error = %err, "Spawn failed");
                handle::advance(
                    &state,
                    ProcessState::Failed(ProcessFailure::Spawn(err.to_string())),
                );
                self.entries.lock().unwrap().remove(&id);
                return Err(err);
            }
        };

        let pid = child.id();
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            entry.pid = pid;
        }
        handle::advance(&state, ProcessState::Running);
        tracing::info!(
            id = %id,
            pid = pid.unwrap_or(0),
            command = %spec,
            working_dir = %working_dir.display(),
            timeout_secs = timeout.map(|t| t.as_secs_f64()),
            "Process spawned"
        );

        if let (Some(payload), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            let stdin_id = id.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    tracing::debug!(id = %stdin_id, error = %e, "Stdin write failed");
                    return;
                }
                if let Err(e) = stdin.shutdown().await {
                    tracing::debug!(id = %stdin_id, error = %e, "Stdin close failed");
                }
            });
        }

        Ok(ProcessHandle {
            program: spec.program.clone(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            pid,
            state,
            cancel,
            timeout,
            deadline: timeout.map(|t| tokio::time::Instant::now() + t),
            started: Instant::now(),
            entries: self.entries.clone(),
            id,
        })
    }

    /// Cancel one process by id.
    ///
    /// Returns `true` if the process was found still running. Cancelling a
    /// finished or unknown process does nothing.
    pub fn cancel(&self, id: &InvocationId) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(id) {
            Some(entry) if !entry.state.lock().unwrap().is_terminal() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every process spawned through this scope, including ones
    /// spawned after this call.
    pub fn cancel_all(&self) {
        self.root_cancel_token.cancel();
    }

    pub fn state(&self, id: &InvocationId) -> Option<ProcessState> {
        let entries = self.entries.lock().unwrap();
        entries.get(id).map(|e| e.state.lock().unwrap().clone())
    }

    pub fn get_info(&self, id: &InvocationId) -> Option<ProcessInfo> {
        let entries = self.entries.lock().unwrap();
        entries.get(id).map(|e| info(id, e))
    }

    pub fn list_all(&self) -> Vec<ProcessInfo> {
        let entries = self.entries.lock().unwrap();
        entries.iter().map(|(id, e)| info(id, e)).collect()
    }

    /// Number of registered processes not yet in a terminal state.
    pub fn active_count(&self) -> usize {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .filter(|e| !e.state.lock().unwrap().is_terminal())
            .count()
    }

    /// Cancel this scope and wait up to `grace` for every process to reach a
    /// terminal state. Returns `true` if none remain active.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.cancel_all();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.active_count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(active = self.active_count(), "Processes still active after shutdown grace");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn info(id: &InvocationId, entry: &ProcessEntry) -> ProcessInfo {
    ProcessInfo {
        id: id.clone(),
        program: entry.program.clone(),
        pid: entry.pid,
        state: entry.state.lock().unwrap().clone(),
        spawned_at: entry.spawned_at.clone(),
    }
}
