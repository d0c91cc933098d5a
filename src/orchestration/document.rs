//! Declarative workflow files.
//!
//! ```toml
//! [agents.planner]
//! variant = "automation"
//! agent_id = "planner"
//!
//! [agents.coder]
//! variant = "swarm"
//!
//! [[task]]
//! id = "plan"
//! prompt = "Outline the change"
//! agent = "planner"
//! task_prompt = "plan the refactor"
//!
//! [[task]]
//! id = "implement"
//! prompt = "Implement the plan"
//! agent = "coder"
//! depends_on = ["plan"]
//! task_prompt = "implement it"
//! timeout_secs = 900
//! ```
//!
//! A task without `agent` uses the default profile. Task-level
//! `task_prompt` overrides the profile's.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, WorkflowError};
use crate::invocation::AgentInvocationConfig;

use super::graph::WorkflowGraph;
use super::types::WorkflowTask;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDocument {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentInvocationConfig>,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEntry {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub prompt: String,
    pub agent: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub task_prompt: Option<String>,
    pub timeout_secs: Option<u64>,
    pub working_dir: Option<PathBuf>,
    pub resume_session: Option<String>,
}

impl WorkflowDocument {
    pub fn from_toml_str(contents: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let doc = Self::from_toml_str(&contents, path)?;
        tracing::info!(
            path = %path.display(),
            tasks = doc.tasks.len(),
            profiles = doc.agents.len(),
            "Loaded workflow document"
        );
        Ok(doc)
    }

    /// Resolve agent profiles and validate the result as a graph.
    pub fn into_graph(self) -> Result<WorkflowGraph, WorkflowError> {
        let WorkflowDocument { agents, tasks } = self;
        let mut resolved = Vec::with_capacity(tasks.len());

        for entry in tasks {
            let mut agent = match &entry.agent {
                Some(profile) => agents
                    .get(profile)
                    .cloned()
                    .ok_or_else(|| WorkflowError::UnknownAgentProfile {
                        task_id: entry.id.clone(),
                        profile: profile.clone(),
                    })?,
                None => AgentInvocationConfig::default(),
            };
            if entry.task_prompt.is_some() {
                agent.options.task_prompt = entry.task_prompt;
            }

            let mut task = WorkflowTask::new(entry.id, entry.prompt, agent).depends_on(entry.depends_on);
            if let Some(name) = entry.name {
                task = task.with_name(name);
            }
            if let Some(secs) = entry.timeout_secs {
                task = task.with_timeout(Duration::from_secs(secs));
            }
            if let Some(dir) = entry.working_dir {
                task = task.with_working_dir(dir);
            }
            if let Some(session) = entry.resume_session {
                task = task.resuming(session);
            }
            resolved.push(task);
        }

        WorkflowGraph::new(resolved)
    }
}
