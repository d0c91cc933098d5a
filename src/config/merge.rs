use super::schema::{AppConfig, PartialConfig};
use crate::invocation::ProgramCommands;
use std::path::PathBuf;

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            workspace: self.workspace.or(fallback.workspace),
            log_dir: self.log_dir.or(fallback.log_dir),
            max_concurrency: self.max_concurrency.or(fallback.max_concurrency),
            task_timeout_secs: self.task_timeout_secs.or(fallback.task_timeout_secs),
            stream_grace_ms: self.stream_grace_ms.or(fallback.stream_grace_ms),
            interactive_command: self.interactive_command.or(fallback.interactive_command),
            automation_command: self.automation_command.or(fallback.automation_command),
            transcript_max_chars: self.transcript_max_chars.or(fallback.transcript_max_chars),
            include_tool_events: self.include_tool_events.or(fallback.include_tool_events),
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> AppConfig {
        let workspace = self.workspace.unwrap_or_else(|| PathBuf::from("."));
        let log_dir = self
            .log_dir
            .unwrap_or_else(|| workspace.join(".chainflow-logs"));
        let defaults = ProgramCommands::default();

        AppConfig {
            workspace,
            log_dir,
            max_concurrency: self.max_concurrency.unwrap_or(4).max(1),
            task_timeout_secs: self.task_timeout_secs.unwrap_or(1800),
            stream_grace_ms: self.stream_grace_ms.unwrap_or(2000),
            commands: ProgramCommands {
                interactive: self.interactive_command.unwrap_or(defaults.interactive),
                automation: self.automation_command.unwrap_or(defaults.automation),
            },
            transcript_max_chars: self.transcript_max_chars,
            include_tool_events: self.include_tool_events.unwrap_or(false),
        }
    }
}
