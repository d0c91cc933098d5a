//! Capability interface for external agent programs.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;

use super::builder::{ProgramCommands, build_invocation};
use super::{AgentInvocationConfig, InvocationSpec};
use crate::error::ConfigurationError;

/// Whether an agent program looks installed and logged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Availability {
    /// A credentials/config file exists; `last_auth_timestamp` is its mtime.
    LoginDetected { last_auth_timestamp: i64 },
    InstallationFound,
    NotFound,
}

/// Anything the engine can launch as an agent.
///
/// Implementations must be pure in [`AgentProgram::invocation`]: same inputs,
/// same spec, no side effects.
pub trait AgentProgram: Send + Sync {
    /// Short name used in logs and reports.
    fn name(&self) -> &str;

    fn invocation(
        &self,
        config: &AgentInvocationConfig,
        prompt: &str,
        prior_session: Option<&str>,
    ) -> Result<InvocationSpec, ConfigurationError>;

    /// Whether stdout will be NDJSON for this config.
    fn emits_ndjson(&self, config: &AgentInvocationConfig) -> bool;

    fn availability(&self) -> Availability {
        Availability::NotFound
    }
}

/// The claude-flow CLI, run through `npx` unless reconfigured.
#[derive(Debug, Clone, Default)]
pub struct ClaudeFlowProgram {
    commands: ProgramCommands,
}

impl ClaudeFlowProgram {
    pub fn new(commands: ProgramCommands) -> Self {
        Self { commands }
    }

    pub fn commands(&self) -> &ProgramCommands {
        &self.commands
    }

    /// `~/.claude-flow/config.json`, when a home directory can be resolved.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".claude-flow").join("config.json"))
    }
}

impl AgentProgram for ClaudeFlowProgram {
    fn name(&self) -> &str {
        "claude-flow"
    }

    fn invocation(
        &self,
        config: &AgentInvocationConfig,
        prompt: &str,
        prior_session: Option<&str>,
    ) -> Result<InvocationSpec, ConfigurationError> {
        build_invocation(&self.commands, config, prompt, prior_session)
    }

    fn emits_ndjson(&self, config: &AgentInvocationConfig) -> bool {
        let opts = config.resolved();
        opts.non_interactive || opts.enable_chaining
    }

    fn availability(&self) -> Availability {
        match Self::default_config_path() {
            Some(path) => availability_at(&path),
            None => Availability::NotFound,
        }
    }
}

/// Availability judged from a single config file.
pub fn availability_at(config_path: &Path) -> Availability {
    std::fs::metadata(config_path)
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|d| Availability::LoginDetected {
            last_auth_timestamp: d.as_secs() as i64,
        })
        .unwrap_or(Availability::NotFound)
}
