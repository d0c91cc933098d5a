use chainflow::invocation::{
    AgentInvocationConfig, AgentVariant, ClaudeFlowProgram, InvocationOptions, ProgramCommands,
};
use chainflow::orchestration::{
    EngineSettings, FailureReason, JsonlSink, MemorySink, TaskStatus, WorkflowDocument,
    WorkflowEngine, WorkflowGraph, WorkflowTask,
};
use chainflow::error::WorkflowError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ─── Helper ───────────────────────────────────────────────────────────

/// A workspace whose "agent program" is a shell dispatcher that runs
/// `agents/<agent_id>.sh` for each invocation.
struct Harness {
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        std::fs::create_dir(dir.path().join("agents")).unwrap();
        let dispatcher = format!(
            r#"agent=""
while [ $# -gt 0 ]; do
  case "$1" in
    --agent) agent="$2"; shift 2 ;;
    *) shift ;;
  esac
done
exec sh "{}/agents/$agent.sh"
"#,
            dir.path().display()
        );
        std::fs::write(dir.path().join("dispatch.sh"), dispatcher).unwrap();
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn agent(&self, id: &str, script: &str) {
        std::fs::write(self.path().join("agents").join(format!("{id}.sh")), script).unwrap();
    }

    fn program(&self) -> ClaudeFlowProgram {
        let command = format!("sh {}", self.path().join("dispatch.sh").display());
        ClaudeFlowProgram::new(ProgramCommands {
            interactive: command.clone(),
            automation: command,
        })
    }

    fn engine(&self, max_concurrency: usize) -> WorkflowEngine {
        WorkflowEngine::new(
            Arc::new(self.program()),
            EngineSettings {
                max_concurrency,
                working_dir: self.path().to_path_buf(),
                stream_grace: Duration::from_millis(500),
                ..Default::default()
            },
        )
    }

    fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.path().join(name)).unwrap_or_default()
    }
}

fn agent_config(variant: AgentVariant, agent_id: &str) -> AgentInvocationConfig {
    AgentInvocationConfig::with_options(
        variant,
        InvocationOptions {
            agent_id: Some(agent_id.to_string()),
            task_prompt: Some(format!("work as {agent_id}")),
            ..Default::default()
        },
    )
}

fn task(id: &str, deps: &[&str]) -> WorkflowTask {
    WorkflowTask::new(id, format!("prompt for {id}"), agent_config(AgentVariant::Automation, id))
        .depends_on(deps.iter().copied())
}

fn chaining_task(id: &str, deps: &[&str]) -> WorkflowTask {
    WorkflowTask::new(id, format!("prompt for {id}"), agent_config(AgentVariant::Swarm, id))
        .depends_on(deps.iter().copied())
}

fn message(text: &str) -> String {
    format!("echo '{{\"type\":\"message\",\"role\":\"assistant\",\"content\":\"{text}\"}}'\n")
}

/// Whether `pid` is still a live (non-zombie) process.
fn is_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => match stat.rsplit_once(") ") {
            Some((_, rest)) => !rest.starts_with('Z') && !rest.starts_with('X'),
            None => true,
        },
        Err(_) => false,
    }
}

async fn wait_until_dead(pid: i32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

// ============================================================
// Chaining
// ============================================================

#[tokio::test]
async fn test_linear_chain_injects_upstream_messages() {
    let h = Harness::new();
    h.agent(
        "a",
        &format!(
            "cat > /dev/null\necho '{{\"type\":\"init\",\"session_id\":\"sess-a\"}}'\n{}{}{}echo '{{\"type\":\"result\",\"result\":\"done\"}}'\n",
            message("alpha"),
            "echo '{\"type\":\"tool_use\",\"tool\":\"grep\",\"input\":{}}'\n",
            message("beta"),
        ),
    );
    h.agent("b", &format!("cat > b-stdin.txt\n{}", message("gamma")));
    h.agent("c", "cat > c-stdin.txt\n");

    let graph = WorkflowGraph::new(vec![
        task("a", &[]),
        chaining_task("b", &["a"]),
        task("c", &["b"]),
    ])
    .unwrap();

    let report = h.engine(2).run(graph).await;
    assert!(report.success(), "{report}");

    let b = report.task("b").unwrap();
    assert_eq!(b.chained_context.as_deref(), Some("alpha\nbeta"));
    assert_eq!(h.read("b-stdin.txt"), "alpha\nbeta\n\nprompt for b");

    // c does not chain, so it gets only its own prompt.
    assert!(report.task("c").unwrap().chained_context.is_none());
    assert_eq!(h.read("c-stdin.txt"), "prompt for c");
    assert_eq!(report.task("a").unwrap().session_id.as_deref(), Some("sess-a"));
}

#[tokio::test]
async fn test_multiple_upstreams_join_in_declaration_order() {
    let h = Harness::new();
    h.agent("first", &format!("sleep 0.2\n{}", message("one")));
    h.agent("second", &message("two"));
    h.agent("join", "cat > join-stdin.txt\n");

    let graph = WorkflowGraph::new(vec![
        task("first", &[]),
        task("second", &[]),
        chaining_task("join", &["second", "first"]),
    ])
    .unwrap();

    let report = h.engine(4).run(graph).await;
    assert!(report.success(), "{report}");
    assert_eq!(
        report.task("join").unwrap().chained_context.as_deref(),
        Some("one\ntwo")
    );
}

#[tokio::test]
async fn test_empty_upstream_transcript_runs_with_own_prompt() {
    let h = Harness::new();
    h.agent("quiet", "true\n");
    h.agent("next", "cat > next-stdin.txt\n");

    let graph = WorkflowGraph::new(vec![task("quiet", &[]), chaining_task("next", &["quiet"])]).unwrap();
    let report = h.engine(1).run(graph).await;

    assert!(report.success(), "{report}");
    assert!(report.task("next").unwrap().chained_context.is_none());
    assert_eq!(h.read("next-stdin.txt"), "prompt for next");
}

// ============================================================
// Failure propagation
// ============================================================

#[tokio::test]
async fn test_failed_upstream_skips_dependent_without_spawning() {
    let h = Harness::new();
    h.agent("build", "echo broken >&2\nexit 1\n");
    h.agent("deploy", "touch deploy-ran\n");

    let graph = WorkflowGraph::new(vec![task("build", &[]), task("deploy", &["build"])]).unwrap();
    let report = h.engine(2).run(graph).await;

    assert!(!report.success());
    let build = report.task("build").unwrap();
    assert_eq!(build.status, TaskStatus::Failed(FailureReason::NonZeroExit(1)));
    assert_eq!(build.exit_code, Some(1));
    assert_eq!(build.stderr_tail, vec!["broken".to_string()]);

    let deploy = report.task("deploy").unwrap();
    assert_eq!(
        deploy.status,
        TaskStatus::Skipped {
            upstream: Some("build".into())
        }
    );
    assert!(deploy.invocation_id.is_none());
    assert!(!h.path().join("deploy-ran").exists());
}

#[tokio::test]
async fn test_missing_task_source_is_configuration_failure() {
    let h = Harness::new();
    let bare = WorkflowTask::new(
        "bare",
        "prompt",
        AgentInvocationConfig::new(AgentVariant::Automation),
    );
    let graph = WorkflowGraph::new(vec![bare]).unwrap();
    let engine = h.engine(1);
    let report = engine.run(graph).await;

    assert!(matches!(
        report.status("bare"),
        Some(TaskStatus::Failed(FailureReason::Configuration(_)))
    ));
    assert!(report.task("bare").unwrap().invocation_id.is_none());
    assert!(engine.processes().list_all().is_empty());
}

#[tokio::test]
async fn test_spawn_error_is_reported() {
    let h = Harness::new();
    let program = ClaudeFlowProgram::new(ProgramCommands {
        interactive: "chainflow-no-such-agent".into(),
        automation: "chainflow-no-such-agent automation".into(),
    });
    let engine = WorkflowEngine::new(
        Arc::new(program),
        EngineSettings {
            working_dir: h.path().to_path_buf(),
            ..Default::default()
        },
    );
    let graph = WorkflowGraph::new(vec![task("x", &[]), task("y", &["x"])]).unwrap();
    let report = engine.run(graph).await;

    assert!(matches!(
        report.status("x"),
        Some(TaskStatus::Failed(FailureReason::Spawn(_)))
    ));
    assert_eq!(
        report.status("y"),
        Some(&TaskStatus::Skipped { upstream: Some("x".into()) })
    );
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_spawn() {
    let h = Harness::new();
    h.agent("a", "touch a-ran\n");
    h.agent("b", "touch b-ran\n");

    let err = WorkflowGraph::new(vec![task("a", &["b"]), task("b", &["a"])]).unwrap_err();
    assert!(matches!(err, WorkflowError::CyclicDependency { .. }));

    let doc = WorkflowDocument::from_toml_str(
        r#"
[[task]]
id = "a"
prompt = "p"
depends_on = ["b"]

[[task]]
id = "b"
prompt = "p"
depends_on = ["a"]
"#,
        Path::new("cycle.toml"),
    )
    .unwrap();
    assert!(matches!(
        doc.into_graph(),
        Err(WorkflowError::CyclicDependency { .. })
    ));
    assert!(!h.path().join("a-ran").exists());
    assert!(!h.path().join("b-ran").exists());
}

// ============================================================
// Timeout and cancellation
// ============================================================

#[tokio::test]
async fn test_timeout_fails_task_and_kills_descendants() {
    let h = Harness::new();
    h.agent("slow", "sleep 60 &\necho $! > child.pid\nwait\n");

    let graph = WorkflowGraph::new(vec![
        task("slow", &[]).with_timeout(Duration::from_millis(500)),
        task("after", &["slow"]),
    ])
    .unwrap();

    let engine = h.engine(1);
    let start = Instant::now();
    let report = engine.run(graph).await;
    assert!(start.elapsed() < Duration::from_secs(5), "took {:?}", start.elapsed());

    assert_eq!(
        report.status("slow"),
        Some(&TaskStatus::Failed(FailureReason::Timeout(Duration::from_millis(500))))
    );
    assert!(matches!(report.status("after"), Some(TaskStatus::Skipped { .. })));
    assert_eq!(engine.processes().active_count(), 0);

    let pid: i32 = h.read("child.pid").trim().parse().expect("child pid recorded");
    assert!(wait_until_dead(pid).await, "descendant {pid} survived the timeout");
}

#[tokio::test]
async fn test_cancel_kills_running_and_skips_pending() {
    let h = Harness::new();
    h.agent("long", "sleep 30 &\necho $! > long.pid\nwait\n");
    h.agent("other", "sleep 30\n");
    h.agent("later", "touch later-ran\n");

    let graph = WorkflowGraph::new(vec![
        task("long", &[]),
        task("other", &[]),
        task("later", &["long"]),
    ])
    .unwrap();

    let engine = h.engine(2);
    let run = engine.start(graph);
    let mut statuses = run.subscribe();
    statuses
        .wait_for(|s| s.iter().filter(|(_, st)| *st == TaskStatus::Running).count() == 2)
        .await
        .unwrap();
    // Let the first agent record its child before cancelling.
    let deadline = Instant::now() + Duration::from_secs(3);
    while h.read("long.pid").trim().is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let cancelled_at = Instant::now();
    run.cancel();
    run.cancel();
    let report = run.wait().await;
    assert!(cancelled_at.elapsed() < Duration::from_secs(3));

    assert!(report.cancelled);
    assert!(!report.success());
    assert!(report.status("long").unwrap().is_cancelled());
    assert!(report.status("other").unwrap().is_cancelled());
    assert_eq!(report.status("later"), Some(&TaskStatus::Skipped { upstream: None }));
    assert_eq!(report.failed().count(), 0, "cancellation is not failure");
    assert_eq!(engine.processes().active_count(), 0);
    assert!(!h.path().join("later-ran").exists());

    let pid: i32 = h.read("long.pid").trim().parse().expect("child pid recorded");
    assert!(wait_until_dead(pid).await, "descendant {pid} survived cancellation");
}

#[tokio::test]
async fn test_engine_wide_cancel_reaches_every_run() {
    let h = Harness::new();
    h.agent("a", "sleep 30\n");
    let engine = h.engine(1);
    let run = engine.start(WorkflowGraph::new(vec![task("a", &[])]).unwrap());
    run.subscribe()
        .wait_for(|s| s[0].1 == TaskStatus::Running)
        .await
        .unwrap();

    engine.processes().cancel_all();
    let report = run.wait().await;
    assert!(report.cancelled);
    assert!(report.status("a").unwrap().is_cancelled());
}

// ============================================================
// Scheduling
// ============================================================

#[tokio::test]
async fn test_concurrency_limit_one_serializes_tasks() {
    let h = Harness::new();
    for id in ["first", "second"] {
        h.agent(
            id,
            &format!("echo start {id} >> order.log\nsleep 0.3\necho end {id} >> order.log\n"),
        );
    }

    let graph = WorkflowGraph::new(vec![task("first", &[]), task("second", &[])]).unwrap();
    let report = h.engine(1).run(graph).await;
    assert!(report.success(), "{report}");

    let order: Vec<String> = h.read("order.log").lines().map(str::to_string).collect();
    assert_eq!(
        order,
        vec!["start first", "end first", "start second", "end second"]
    );
}

#[tokio::test]
async fn test_independent_tasks_overlap_when_allowed() {
    let h = Harness::new();
    for id in ["x", "y", "z"] {
        h.agent(id, "sleep 0.5\n");
    }
    let graph = WorkflowGraph::new(vec![task("x", &[]), task("y", &[]), task("z", &[])]).unwrap();

    let start = Instant::now();
    let report = h.engine(3).run(graph).await;
    assert!(report.success(), "{report}");
    assert!(
        start.elapsed() < Duration::from_millis(1400),
        "tasks should run concurrently, took {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn test_per_task_working_dir_is_relative_to_workspace() {
    let h = Harness::new();
    std::fs::create_dir(h.path().join("sub")).unwrap();
    h.agent("where", "pwd > here.txt\n");

    let graph = WorkflowGraph::new(vec![task("where", &[]).with_working_dir("sub")]).unwrap();
    let report = h.engine(1).run(graph).await;
    assert!(report.success(), "{report}");

    let recorded = std::fs::read_to_string(h.path().join("sub/here.txt")).unwrap();
    let expected = std::fs::canonicalize(h.path().join("sub")).unwrap();
    assert_eq!(PathBuf::from(recorded.trim()), expected);
}

// ============================================================
// Sinks
// ============================================================

#[tokio::test]
async fn test_sink_receives_every_event_in_order() {
    let h = Harness::new();
    h.agent(
        "talk",
        &format!("{}echo 'not json'\n{}", message("one"), message("two")),
    );

    let sink = Arc::new(MemorySink::default());
    let engine = h.engine(1).with_sink(sink.clone());
    let report = engine
        .run(WorkflowGraph::new(vec![task("talk", &[])]).unwrap())
        .await;
    assert!(report.success(), "{report}");

    let events = sink.events("talk");
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    assert!(events[1].is_parse_error());
    assert!(events[3].is_synthetic());
    assert_eq!(events.iter().filter(|e| e.terminal).count(), 1);

    let summary = sink.summary("talk").unwrap();
    assert_eq!(summary.total_events, 4);
    assert_eq!(summary.parse_error_count, 1);
    assert_eq!(report.task("talk").unwrap().stream.as_ref(), Some(&summary));
}

#[tokio::test]
async fn test_jsonl_sink_writes_one_file_per_invocation() {
    let h = Harness::new();
    h.agent("a", &message("hello"));
    h.agent("b", &message("world"));

    let sink = Arc::new(JsonlSink::new(h.path().join("logs")).unwrap());
    let engine = h.engine(2).with_sink(sink.clone());
    let report = engine
        .run(WorkflowGraph::new(vec![task("a", &[]), task("b", &[])]).unwrap())
        .await;
    assert!(report.success(), "{report}");

    for id in ["a", "b"] {
        let invocation = report.task(id).unwrap().invocation_id.clone().unwrap();
        let contents = std::fs::read_to_string(sink.log_path(id, &invocation)).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3, "message, synthetic result, end marker");
        assert_eq!(lines[0]["kind"], "message");
        assert_eq!(lines[2]["event_type"], "stream_end");
    }
}

// ============================================================
// Resubmission
// ============================================================

#[tokio::test]
async fn test_resubmission_reruns_only_unfinished_tasks() {
    let h = Harness::new();
    h.agent("ok", "echo run >> ok.log\n");
    h.agent("flaky", "if [ -f fixed ]; then exit 0; fi\nexit 2\n");
    h.agent("tail", "echo run >> tail.log\n");

    let graph = WorkflowGraph::new(vec![
        task("ok", &[]),
        task("flaky", &["ok"]),
        task("tail", &["flaky"]),
    ])
    .unwrap();
    let engine = h.engine(2);
    let first = engine.run(graph.clone()).await;
    assert!(!first.success());

    std::fs::write(h.path().join("fixed"), "").unwrap();
    let retry = first.resubmission(&graph).unwrap();
    assert_eq!(retry.len(), 2);
    let second = engine.run(retry).await;

    assert!(second.success(), "{second}");
    assert_eq!(h.read("ok.log").lines().count(), 1);
    assert_eq!(h.read("tail.log").lines().count(), 1);
}
