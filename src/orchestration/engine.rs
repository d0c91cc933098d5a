//! Dependency-ordered workflow execution.
//!
//! [`WorkflowEngine::start`] spawns one scheduler task per run. The scheduler
//! is the only code that mutates task statuses: workers run one task each and
//! report back over an mpsc channel, and observers read status snapshots from
//! a `watch` channel. Each run gets its own [`ProcessManager`] scope, so
//! cancelling a run kills exactly the processes it started.
//!
//! ## Per-task worker
//!
//! ```text
//! compose prompt → build invocation → spawn → stream stdout → forward to sink
//!                                           ↘ collect stderr tail
//! wait for exit → drain stream (bounded) → report
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::exec::{OutputTail, ProcessFailure, ProcessManager, ProcessState};
use crate::exec::output::SUMMARY_TAIL_LINES;
use crate::invocation::AgentProgram;
use crate::stream::{StreamFormat, StreamProcessor};

use super::chaining::{ChainedContext, ChainingPolicy};
use super::graph::WorkflowGraph;
use super::sink::{MessageSink, NullSink};
use super::types::{FailureReason, TaskId, TaskReport, TaskStatus, WorkflowReport, WorkflowTask};

/// Status of every task, in declaration order.
pub type StatusSnapshot = Vec<(TaskId, TaskStatus)>;

/// Engine-wide knobs. Per-task fields on [`WorkflowTask`] override
/// `default_timeout` and `working_dir`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound on simultaneously running tasks. Zero is treated as one.
    pub max_concurrency: usize,
    pub default_timeout: Option<Duration>,
    /// Base directory; relative task directories are joined onto it.
    pub working_dir: PathBuf,
    /// Environment given to every agent process.
    pub env: BTreeMap<String, String>,
    pub chaining: ChainingPolicy,
    /// How long to keep reading output after the process has exited.
    pub stream_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_timeout: None,
            working_dir: PathBuf::from("."),
            env: BTreeMap::new(),
            chaining: ChainingPolicy::default(),
            stream_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    program: Arc<dyn AgentProgram>,
    processes: ProcessManager,
    settings: Arc<EngineSettings>,
    sink: Arc<dyn MessageSink>,
}

impl WorkflowEngine {
    pub fn new(program: Arc<dyn AgentProgram>, settings: EngineSettings) -> Self {
        Self {
            program,
            processes: ProcessManager::default(),
            settings: Arc::new(settings),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run processes under `processes` instead of a private manager.
    pub fn with_process_manager(mut self, processes: ProcessManager) -> Self {
        self.processes = processes;
        self
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Begin executing `graph` in the background.
    pub fn start(&self, graph: WorkflowGraph) -> WorkflowRun {
        let graph = Arc::new(graph);
        let scope = self.processes.child_scope();
        let cancel = scope.cancel_token().clone();

        let initial: StatusSnapshot = graph
            .tasks()
            .iter()
            .map(|t| (t.id.clone(), TaskStatus::Pending))
            .collect();
        let (publish, statuses) = watch::channel(initial);

        let engine = WorkflowEngine {
            processes: scope,
            ..self.clone()
        };
        let scheduler = Scheduler::new(engine, graph.clone(), publish);
        tracing::info!(
            tasks = graph.len(),
            max_concurrency = self.settings.max_concurrency.max(1),
            program = %self.program.name(),
            "Workflow started"
        );
        let task = tokio::spawn(scheduler.run());

        WorkflowRun {
            graph,
            cancel,
            statuses,
            task,
            started: Instant::now(),
        }
    }

    /// Execute `graph` to completion.
    pub async fn run(&self, graph: WorkflowGraph) -> WorkflowReport {
        self.start(graph).wait().await
    }
}

/// A workflow executing in the background.
pub struct WorkflowRun {
    graph: Arc<WorkflowGraph>,
    cancel: CancellationToken,
    statuses: watch::Receiver<StatusSnapshot>,
    task: JoinHandle<WorkflowReport>,
    started: Instant,
}

impl WorkflowRun {
    /// Kill running tasks and skip the ones not started yet. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn statuses(&self) -> StatusSnapshot {
        self.statuses.borrow().clone()
    }

    /// Receiver that is notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.statuses.clone()
    }

    pub async fn wait(self) -> WorkflowReport {
        let WorkflowRun {
            graph,
            statuses,
            task,
            started,
            cancel,
        } = self;
        match task.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Workflow scheduler ended abnormally");
                cancel.cancel();
                let last = statuses.borrow().clone();
                let tasks = graph
                    .tasks()
                    .iter()
                    .zip(last)
                    .map(|(task, (_, status))| {
                        let status = if status.is_terminal() {
                            status
                        } else {
                            TaskStatus::Failed(FailureReason::Crashed("scheduler stopped".into()))
                        };
                        TaskReport::unstarted(task, status)
                    })
                    .collect();
                WorkflowReport {
                    tasks,
                    cancelled: cancel.is_cancelled(),
                    elapsed: started.elapsed(),
                }
            }
        }
    }
}

struct WorkerOutcome {
    report: TaskReport,
    transcript: String,
}

struct Scheduler {
    engine: WorkflowEngine,
    graph: Arc<WorkflowGraph>,
    statuses: Vec<TaskStatus>,
    reports: Vec<Option<TaskReport>>,
    transcripts: Vec<Option<String>>,
    running: usize,
    cancelled: bool,
    publish: watch::Sender<StatusSnapshot>,
    started: Instant,
}

impl Scheduler {
    fn new(engine: WorkflowEngine, graph: Arc<WorkflowGraph>, publish: watch::Sender<StatusSnapshot>) -> Self {
        let n = graph.len();
        Self {
            engine,
            graph,
            statuses: vec![TaskStatus::Pending; n],
            reports: (0..n).map(|_| None).collect(),
            transcripts: vec![None; n],
            running: 0,
            cancelled: false,
            publish,
            started: Instant::now(),
        }
    }

    async fn run(mut self) -> WorkflowReport {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(usize, WorkerOutcome)>();
        let cancel = self.engine.processes.cancel_token().clone();

        loop {
            if !self.cancelled && cancel.is_cancelled() {
                self.apply_cancel();
            }
            if !self.cancelled {
                self.promote();
                self.launch(&done_tx);
            }
            self.publish();

            if self.running == 0 {
                if self.statuses.iter().all(TaskStatus::is_terminal) {
                    break;
                }
                self.fail_unschedulable();
                self.publish();
                break;
            }

            tokio::select! {
                Some((idx, outcome)) = done_rx.recv() => self.complete(idx, outcome),
                _ = cancel.cancelled(), if !self.cancelled => {}
                else => break,
            }
        }

        let report = self.into_report();
        tracing::info!(
            success = report.success(),
            cancelled = report.cancelled,
            elapsed_secs = report.elapsed.as_secs_f64(),
            "Workflow finished"
        );
        report
    }

    /// Pending tasks become Ready once every dependency completed, or Skipped
    /// as soon as one did not. Repeats until nothing changes so skips
    /// propagate through the whole graph in one tick.
    fn promote(&mut self) {
        let graph = self.graph.clone();
        loop {
            let mut changed = false;
            for (i, task) in graph.tasks().iter().enumerate() {
                if self.statuses[i] != TaskStatus::Pending {
                    continue;
                }
                let mut ready = true;
                let mut blocked_by = None;
                for dep in &task.depends_on {
                    let Some(pos) = graph.position(dep) else {
                        continue;
                    };
                    match &self.statuses[pos] {
                        TaskStatus::Completed => {}
                        TaskStatus::Failed(_) | TaskStatus::Skipped { .. } => {
                            blocked_by = Some(dep.clone());
                            break;
                        }
                        _ => ready = false,
                    }
                }

                if let Some(upstream) = blocked_by {
                    tracing::info!(task_id = %task.id, upstream = %upstream, "Task skipped");
                    self.statuses[i] = TaskStatus::Skipped {
                        upstream: Some(upstream),
                    };
                    changed = true;
                } else if ready {
                    tracing::debug!(task_id = %task.id, "Task ready");
                    self.statuses[i] = TaskStatus::Ready;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Start Ready tasks in declaration order while capacity remains.
    fn launch(&mut self, done_tx: &mpsc::UnboundedSender<(usize, WorkerOutcome)>) {
        let limit = self.engine.settings.max_concurrency.max(1);
        let graph = self.graph.clone();
        for (i, task) in graph.tasks().iter().enumerate() {
            if self.running >= limit {
                break;
            }
            if self.statuses[i] != TaskStatus::Ready {
                continue;
            }

            let context = self.context_for(task);
            self.statuses[i] = TaskStatus::Running;
            self.running += 1;
            tracing::info!(
                task_id = %task.id,
                running = self.running,
                limit,
                chained = context.is_some(),
                "Task launched"
            );

            let worker = tokio::spawn(run_task(self.engine.clone(), task.clone(), context));
            let fallback = task.clone();
            let tx = done_tx.clone();
            tokio::spawn(async move {
                let outcome = match worker.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(task_id = %fallback.id, error = %e, "Task worker ended abnormally");
                        WorkerOutcome {
                            report: TaskReport::unstarted(
                                &fallback,
                                TaskStatus::Failed(FailureReason::Crashed(e.to_string())),
                            ),
                            transcript: String::new(),
                        }
                    }
                };
                let _ = tx.send((i, outcome));
            });
        }
    }

    /// Upstream context for a chaining task, upstreams in declaration order.
    fn context_for(&self, task: &WorkflowTask) -> Option<ChainedContext> {
        if !task.agent.chaining_enabled() || task.depends_on.is_empty() {
            return None;
        }
        let mut upstream: Vec<(usize, &TaskId)> = task
            .depends_on
            .iter()
            .filter_map(|d| self.graph.position(d).map(|p| (p, d)))
            .collect();
        upstream.sort_by_key(|(p, _)| *p);

        self.engine.settings.chaining.context(
            upstream
                .into_iter()
                .map(|(p, id)| (id.clone(), self.transcripts[p].clone().unwrap_or_default())),
        )
    }

    fn complete(&mut self, idx: usize, outcome: WorkerOutcome) {
        self.running = self.running.saturating_sub(1);
        let status = outcome.report.status.clone();
        tracing::info!(
            task_id = %outcome.report.task_id,
            status = %status,
            elapsed_secs = outcome.report.elapsed.as_secs_f64(),
            "Task finished"
        );
        self.statuses[idx] = status;
        self.transcripts[idx] = Some(outcome.transcript);
        self.reports[idx] = Some(outcome.report);
    }

    /// Skip everything not yet started and kill everything running through
    /// this run's process scope.
    fn apply_cancel(&mut self) {
        self.cancelled = true;
        let mut skipped = 0;
        for status in &mut self.statuses {
            if matches!(status, TaskStatus::Pending | TaskStatus::Ready) {
                *status = TaskStatus::Skipped { upstream: None };
                skipped += 1;
            }
        }
        self.engine.processes.cancel_all();
        tracing::warn!(running = self.running, skipped, "Workflow cancelled");
    }

    /// Nothing is running and nothing can start. Any task still waiting at
    /// this point can never run.
    fn fail_unschedulable(&mut self) {
        for (i, status) in self.statuses.iter_mut().enumerate() {
            if !status.is_terminal() {
                tracing::error!(task_id = %self.graph.tasks()[i].id, "Task can never be scheduled");
                *status = TaskStatus::Failed(FailureReason::Crashed("unschedulable".into()));
            }
        }
    }

    fn publish(&self) {
        let snapshot: StatusSnapshot = self
            .graph
            .tasks()
            .iter()
            .zip(&self.statuses)
            .map(|(t, s)| (t.id.clone(), s.clone()))
            .collect();
        self.publish.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn into_report(self) -> WorkflowReport {
        let Scheduler {
            graph,
            statuses,
            reports,
            cancelled,
            started,
            ..
        } = self;
        let tasks = graph
            .tasks()
            .iter()
            .zip(statuses)
            .zip(reports)
            .map(|((task, status), report)| match report {
                Some(mut report) => {
                    report.status = status;
                    report
                }
                None => TaskReport::unstarted(task, status),
            })
            .collect();
        WorkflowReport {
            tasks,
            cancelled,
            elapsed: started.elapsed(),
        }
    }
}

/// Execute one task from prompt to report. Never fails: every problem becomes
/// the report's status.
async fn run_task(engine: WorkflowEngine, task: WorkflowTask, context: Option<ChainedContext>) -> WorkerOutcome {
    let started = Instant::now();
    let settings = engine.settings.clone();
    let mut report = TaskReport::unstarted(&task, TaskStatus::Running);
    report.chained_context = context.as_ref().map(|c| c.text.clone());

    let prompt = match &context {
        Some(ctx) => ctx.compose(&task.prompt),
        None => task.prompt.clone(),
    };

    let spec = match engine
        .program
        .invocation(&task.agent, &prompt, task.resume_session.as_deref())
    {
        Ok(spec) => spec,
        Err(e) => {
            tracing::warn!(task_id = %task.id, error = %e, "Invalid agent invocation");
            report.status = TaskStatus::Failed(FailureReason::Configuration(e.to_string()));
            report.elapsed = started.elapsed();
            return WorkerOutcome {
                report,
                transcript: String::new(),
            };
        }
    };

    let working_dir = match &task.working_dir {
        Some(dir) => settings.working_dir.join(dir),
        None => settings.working_dir.clone(),
    };
    let timeout = task.timeout.or(settings.default_timeout);

    let mut handle = match engine.processes.spawn(&spec, &working_dir, &settings.env, timeout) {
        Ok(handle) => handle,
        Err(e) => {
            report.status = TaskStatus::Failed(FailureReason::Spawn(e.to_string()));
            report.elapsed = started.elapsed();
            return WorkerOutcome {
                report,
                transcript: String::new(),
            };
        }
    };
    let invocation_id = handle.id().clone();
    report.invocation_id = Some(invocation_id.clone());

    let format = if engine.program.emits_ndjson(&task.agent) {
        StreamFormat::Ndjson
    } else {
        StreamFormat::PlainText
    };
    let stream = match handle.take_stdout() {
        Some(stdout) => StreamProcessor::process(stdout, format),
        None => StreamProcessor::process(tokio::io::empty(), format),
    };
    let feed = stream.feed().clone();

    let stderr = handle.take_stderr().map(OutputTail::collect);

    let forwarder = {
        let mut subscription = stream.subscribe();
        let sink = engine.sink.clone();
        let task_id = task.id.clone();
        let invocation_id = invocation_id.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                sink.record(&task_id, &invocation_id, &event);
            }
        })
    };

    let state = handle.wait().await;
    let summary = stream.finish_within(settings.stream_grace).await;
    if let Err(e) = forwarder.await {
        tracing::warn!(task_id = %task.id, error = %e, "Sink forwarder ended abnormally");
    }
    engine.sink.finish(&task.id, &invocation_id, &summary);

    if let Some((tail, mut reader)) = stderr {
        if tokio::time::timeout(settings.stream_grace, &mut reader).await.is_err() {
            reader.abort();
        }
        report.stderr_tail = tail.tail(SUMMARY_TAIL_LINES);
    }
    drop(handle);

    let events = feed.snapshot();
    report.session_id = events.iter().find_map(|e| e.session_id()).map(str::to_string);
    report.terminal_event = feed.terminal().map(|e| (*e).clone());
    report.stream = Some(summary);

    report.exit_code = match state {
        ProcessState::Completed(code) => Some(code),
        _ => None,
    };
    report.status = match &state {
        ProcessState::Completed(0) => TaskStatus::Completed,
        ProcessState::Completed(code) => TaskStatus::Failed(FailureReason::NonZeroExit(*code)),
        ProcessState::Failed(ProcessFailure::TimedOut(d)) => TaskStatus::Failed(FailureReason::Timeout(*d)),
        ProcessState::Failed(failure) => TaskStatus::Failed(FailureReason::Crashed(failure.to_string())),
        ProcessState::Cancelled => TaskStatus::Failed(FailureReason::Cancelled),
        ProcessState::Spawning | ProcessState::Running => {
            TaskStatus::Failed(FailureReason::Crashed("process state lost".into()))
        }
    };
    report.elapsed = started.elapsed();

    let transcript = settings.chaining.transcript(&events);
    WorkerOutcome { report, transcript }
}
