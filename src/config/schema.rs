use serde::Deserialize;
use std::path::PathBuf;

use crate::invocation::ProgramCommands;

/// The TOML file structure for chainflow.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub general: Option<GeneralConfig>,
    pub engine: Option<EngineConfig>,
    pub program: Option<ProgramConfig>,
    pub chaining: Option<ChainingConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub workspace: Option<String>,
    pub log_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    pub max_concurrency: Option<usize>,
    /// Zero disables the per-task timeout.
    pub task_timeout_secs: Option<u64>,
    pub stream_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ProgramConfig {
    pub interactive_command: Option<String>,
    pub automation_command: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChainingConfig {
    pub max_chars: Option<usize>,
    pub include_tool_events: Option<bool>,
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub workspace: PathBuf,
    pub log_dir: PathBuf,
    pub max_concurrency: usize,
    pub task_timeout_secs: u64,
    pub stream_grace_ms: u64,
    pub commands: ProgramCommands,
    pub transcript_max_chars: Option<usize>,
    pub include_tool_events: bool,
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub workspace: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub max_concurrency: Option<usize>,
    pub task_timeout_secs: Option<u64>,
    pub stream_grace_ms: Option<u64>,
    pub interactive_command: Option<String>,
    pub automation_command: Option<String>,
    pub transcript_max_chars: Option<usize>,
    pub include_tool_events: Option<bool>,
}

impl ConfigFile {
    pub fn to_partial(self) -> PartialConfig {
        let general = self.general;
        let engine = self.engine;
        let program = self.program;
        let chaining = self.chaining;
        PartialConfig {
            workspace: general
                .as_ref()
                .and_then(|g| g.workspace.as_ref())
                .map(PathBuf::from),
            log_dir: general
                .as_ref()
                .and_then(|g| g.log_dir.as_ref())
                .map(PathBuf::from),
            max_concurrency: engine.as_ref().and_then(|e| e.max_concurrency),
            task_timeout_secs: engine.as_ref().and_then(|e| e.task_timeout_secs),
            stream_grace_ms: engine.as_ref().and_then(|e| e.stream_grace_ms),
            interactive_command: program.as_ref().and_then(|p| p.interactive_command.clone()),
            automation_command: program.as_ref().and_then(|p| p.automation_command.clone()),
            transcript_max_chars: chaining.as_ref().and_then(|c| c.max_chars),
            include_tool_events: chaining.as_ref().and_then(|c| c.include_tool_events),
        }
    }
}
