//! Shared vocabulary of the workflow engine: tasks, statuses and reports.
//!
//! All report types derive [`serde::Serialize`] so the CLI can emit them as
//! JSON.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::invocation::AgentInvocationConfig;
use crate::stream::{StreamEvent, StreamSummary};

/// Caller-chosen task identifier, unique within a graph.
pub type TaskId = String;

/// Why a task did not complete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The invocation could not be built.
    Configuration(String),
    /// The agent process could not be started.
    Spawn(String),
    NonZeroExit(i32),
    Timeout(Duration),
    /// Killed by a signal or lost track of.
    Crashed(String),
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Configuration(msg) => write!(f, "configuration error: {msg}"),
            FailureReason::Spawn(msg) => write!(f, "spawn error: {msg}"),
            FailureReason::NonZeroExit(code) => write!(f, "exited with code {code}"),
            FailureReason::Timeout(d) => write!(f, "timed out after {:.1}s", d.as_secs_f64()),
            FailureReason::Crashed(msg) => write!(f, "crashed: {msg}"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle of a task within one workflow run.
///
/// `Pending → Ready → Running → (Completed | Failed)`, or `Pending → Skipped`
/// when an upstream task did not complete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed(FailureReason),
    Skipped {
        /// The dependency that caused the skip, or `None` when the run was
        /// cancelled before this task started.
        upstream: Option<TaskId>,
    },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed(_) | TaskStatus::Skipped { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskStatus::Failed(FailureReason::Cancelled))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed(FailureReason::Cancelled) => write!(f, "cancelled"),
            TaskStatus::Failed(reason) => write!(f, "failed ({reason})"),
            TaskStatus::Skipped { upstream: Some(up) } => write!(f, "skipped (upstream `{up}`)"),
            TaskStatus::Skipped { upstream: None } => write!(f, "skipped"),
        }
    }
}

/// One unit of work: a single agent invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowTask {
    pub id: TaskId,
    pub name: String,
    pub agent: AgentInvocationConfig,
    pub prompt: String,
    /// Ids this task waits for. Duplicates are collapsed by the graph.
    pub depends_on: Vec<TaskId>,
    /// Overrides the engine's default timeout.
    pub timeout: Option<Duration>,
    /// Overrides the engine's working directory.
    pub working_dir: Option<PathBuf>,
    /// Continue an earlier agent session instead of starting a new one.
    pub resume_session: Option<String>,
}

impl WorkflowTask {
    pub fn new(id: impl Into<TaskId>, prompt: impl Into<String>, agent: AgentInvocationConfig) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent,
            prompt: prompt.into(),
            depends_on: Vec::new(),
            timeout: None,
            working_dir: None,
            resume_session: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn resuming(mut self, session: impl Into<String>) -> Self {
        self.resume_session = Some(session.into());
        self
    }
}

/// Outcome of one task.
#[derive(Clone, Debug, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub invocation_id: Option<String>,
    pub exit_code: Option<i32>,
    /// Session announced by the agent's init record.
    pub session_id: Option<String>,
    pub terminal_event: Option<StreamEvent>,
    pub stream: Option<StreamSummary>,
    /// Last lines of the agent's stderr.
    pub stderr_tail: Vec<String>,
    /// Upstream transcript prepended to the prompt, if chaining applied.
    pub chained_context: Option<String>,
    pub elapsed: Duration,
}

impl TaskReport {
    /// Report for a task that never reached a process.
    pub fn unstarted(task: &WorkflowTask, status: TaskStatus) -> Self {
        Self {
            task_id: task.id.clone(),
            name: task.name.clone(),
            status,
            invocation_id: None,
            exit_code: None,
            session_id: None,
            terminal_event: None,
            stream: None,
            stderr_tail: Vec::new(),
            chained_context: None,
            elapsed: Duration::ZERO,
        }
    }
}

/// Outcome of a whole workflow run, tasks in declaration order.
#[derive(Clone, Debug, Serialize)]
pub struct WorkflowReport {
    pub tasks: Vec<TaskReport>,
    /// The run was cancelled before it finished on its own.
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl WorkflowReport {
    /// `true` iff every task completed.
    pub fn success(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }

    pub fn task(&self, id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task_id == id)
    }

    pub fn status(&self, id: &str) -> Option<&TaskStatus> {
        self.task(id).map(|t| &t.status)
    }

    /// Tasks that failed for a reason other than cancellation.
    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed(_)) && !t.status.is_cancelled())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Skipped { .. }))
    }
}

impl fmt::Display for WorkflowReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let completed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let outcome = if self.cancelled {
            "cancelled"
        } else if self.success() {
            "succeeded"
        } else {
            "failed"
        };
        writeln!(
            f,
            "Workflow {outcome}: {completed}/{} tasks completed in {:.1}s",
            self.tasks.len(),
            self.elapsed.as_secs_f64()
        )?;
        for task in &self.tasks {
            write!(f, "  {:<20} {}", task.task_id, task.status)?;
            if let Some(session) = &task.session_id {
                write!(f, " [session {session}]")?;
            }
            writeln!(f)?;
            if matches!(task.status, TaskStatus::Failed(_)) {
                if let Some(event) = task.terminal_event.as_ref().filter(|e| !e.raw_line.is_empty()) {
                    writeln!(f, "      terminal: {}", event.raw_line)?;
                }
                for line in &task.stderr_tail {
                    writeln!(f, "      stderr: {line}")?;
                }
            }
        }
        Ok(())
    }
}
