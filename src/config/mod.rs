pub mod merge;
pub mod schema;

pub use schema::*;

use crate::cli::{Cli, Commands};
use crate::invocation::ClaudeFlowProgram;
use crate::orchestration::{ChainingPolicy, EngineSettings};
use crate::stream::EventKind;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "chainflow.toml";

/// Load configuration by merging global, workspace, and CLI sources.
/// Precedence: CLI > workspace config > global config > defaults.
///
/// Missing config files are handled gracefully (defaults apply). An explicit
/// `--config` file replaces the global layer and must exist.
pub fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    // Layer 1: Global config (~/.config/chainflow/chainflow.toml or platform equivalent)
    let global = match cli_config_path(cli) {
        Some(path) => load_explicit_config(path)?,
        None => load_global_config(),
    };

    let workspace_path = cli_workspace(cli)
        .or_else(|| global.workspace.clone())
        .unwrap_or_else(|| PathBuf::from("."));

    // Layer 2: Workspace config (workspace/chainflow.toml)
    let workspace = load_workspace_config(&workspace_path);

    // Layer 3: CLI args (converted to PartialConfig)
    let cli_partial = cli_to_partial(cli);

    Ok(cli_partial
        .with_fallback(workspace)
        .with_fallback(global)
        .finalize())
}

impl AppConfig {
    /// Engine settings for a run rooted at this config's workspace.
    pub fn engine_settings(&self) -> EngineSettings {
        let mut include = vec![EventKind::Message];
        if self.include_tool_events {
            include.extend([EventKind::ToolUse, EventKind::ToolResult]);
        }
        EngineSettings {
            max_concurrency: self.max_concurrency,
            default_timeout: (self.task_timeout_secs > 0)
                .then(|| Duration::from_secs(self.task_timeout_secs)),
            working_dir: self.workspace.clone(),
            chaining: ChainingPolicy {
                include,
                max_chars: self.transcript_max_chars,
                ..Default::default()
            },
            stream_grace: Duration::from_millis(self.stream_grace_ms),
            ..Default::default()
        }
    }

    pub fn program(&self) -> ClaudeFlowProgram {
        ClaudeFlowProgram::new(self.commands.clone())
    }
}

fn load_explicit_config(path: &Path) -> anyhow::Result<PartialConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config_file = toml::from_str::<ConfigFile>(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(config_file.to_partial())
}

/// Load global config from the platform-specific config directory.
/// Returns empty PartialConfig if file not found.
fn load_global_config() -> PartialConfig {
    match global_config_path() {
        Some(p) => load_toml_file(&p).unwrap_or_default(),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    }
}

fn load_workspace_config(workspace_path: &Path) -> PartialConfig {
    load_toml_file(&workspace_path.join(CONFIG_FILE_NAME)).unwrap_or_default()
}

/// Load and parse a TOML config file into a PartialConfig.
/// Returns None on file-not-found; parse errors are logged and ignored.
fn load_toml_file(path: &Path) -> Option<PartialConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            match toml::from_str::<ConfigFile>(&contents)
                .context(format!("Failed to parse {}", path.display()))
            {
                Ok(config_file) => {
                    tracing::info!("Loaded config from {}", path.display());
                    Some(config_file.to_partial())
                }
                Err(e) => {
                    tracing::warn!("Config parse error: {:#}", e);
                    None
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            None
        }
        Err(e) => {
            tracing::warn!("Failed to read config at {}: {}", path.display(), e);
            None
        }
    }
}

/// Linux: ~/.config/chainflow/chainflow.toml
/// macOS: ~/Library/Application Support/chainflow/chainflow.toml
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "chainflow")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

fn cli_config_path(cli: &Cli) -> Option<&Path> {
    match &cli.command {
        Commands::Run { config, .. } => config.as_deref(),
        Commands::Validate { .. } | Commands::Availability => None,
    }
}

fn cli_workspace(cli: &Cli) -> Option<PathBuf> {
    match &cli.command {
        Commands::Run { workspace, .. } => workspace.clone(),
        Commands::Validate { .. } | Commands::Availability => None,
    }
}

fn cli_to_partial(cli: &Cli) -> PartialConfig {
    match &cli.command {
        Commands::Run {
            workspace,
            concurrency,
            timeout,
            log_dir,
            ..
        } => PartialConfig {
            workspace: workspace.clone(),
            max_concurrency: *concurrency,
            task_timeout_secs: *timeout,
            log_dir: log_dir.clone(),
            ..Default::default()
        },
        Commands::Validate { .. } | Commands::Availability => PartialConfig::default(),
    }
}
