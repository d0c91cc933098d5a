use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use chainflow::cli::{Cli, Commands};
use chainflow::config;
use chainflow::invocation::AgentProgram;
use chainflow::orchestration::{JsonlSink, WorkflowDocument, WorkflowEngine};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli)?;
    tracing::debug!(workspace = %config.workspace.display(), "Config loaded");

    match &cli.command {
        Commands::Availability => {
            let program = config.program();
            let availability = program.availability();
            println!("{}", serde_json::to_string_pretty(&availability)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { workflow } => {
            let graph = match WorkflowDocument::load(workflow)?.into_graph() {
                Ok(graph) => graph,
                Err(e) => {
                    eprintln!("Invalid workflow: {e}");
                    return Ok(ExitCode::from(2));
                }
            };
            let program = config.program();
            let mut problems = 0;
            for task in graph.tasks() {
                if let Err(e) = program.invocation(&task.agent, &task.prompt, task.resume_session.as_deref()) {
                    eprintln!("  {}: {e}", task.id);
                    problems += 1;
                }
            }
            if problems > 0 {
                eprintln!("{problems} task(s) have invalid agent configuration");
                return Ok(ExitCode::from(2));
            }
            println!("Workflow OK: {} tasks", graph.len());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { workflow, json, .. } => {
            let document = WorkflowDocument::load(workflow)?;
            let graph = match document.into_graph() {
                Ok(graph) => graph,
                Err(e) => {
                    eprintln!("Invalid workflow: {e}");
                    return Ok(ExitCode::from(2));
                }
            };

            let sink = JsonlSink::new(&config.log_dir)
                .with_context(|| format!("Failed to create log dir {}", config.log_dir.display()))?;
            tracing::info!(
                workspace = %config.workspace.display(),
                log_dir = %sink.dir().display(),
                max_concurrency = config.max_concurrency,
                task_timeout_secs = config.task_timeout_secs,
                "Starting workflow"
            );

            let engine = WorkflowEngine::new(Arc::new(config.program()), config.engine_settings())
                .with_sink(Arc::new(sink));
            let wait = engine.run(graph);
            tokio::pin!(wait);
            let report = tokio::select! {
                report = &mut wait => report,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("Interrupted; cancelling workflow");
                    engine.processes().cancel_all();
                    wait.await
                }
            };

            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
            Ok(if report.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
