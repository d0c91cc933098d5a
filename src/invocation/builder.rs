//! Pure mapping from [`AgentInvocationConfig`] to an [`InvocationSpec`].

use serde::{Deserialize, Serialize};

use super::{AgentInvocationConfig, InvocationSpec};
use crate::error::ConfigurationError;

/// Flags requesting NDJSON on stdout and accepting it on stdin.
pub const STREAM_JSON_FLAGS: [&str; 4] = [
    "--output-format",
    "stream-json",
    "--input-format",
    "stream-json",
];

pub const CHAINING_FLAG: &str = "--chaining";
pub const AGENT_FLAG: &str = "--agent";
pub const WORKFLOW_FLAG: &str = "--workflow";
pub const APPEND_PROMPT_FLAG: &str = "--append-prompt";
pub const TASK_FLAG: &str = "--task";
pub const RESUME_FLAG: &str = "--resume";

/// Base command lines for the two program variants.
///
/// Each is split on whitespace: the first word is the program, the rest are
/// leading arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramCommands {
    pub interactive: String,
    pub automation: String,
}

impl Default for ProgramCommands {
    fn default() -> Self {
        Self {
            interactive: "npx -y claude-flow".to_string(),
            automation: "npx -y claude-flow automation".to_string(),
        }
    }
}

/// Build the command line for one invocation.
///
/// `prior_session` switches to a follow-up: `--resume <id>` replaces the
/// `--task` flag and an empty `prompt` is allowed. The prompt itself travels
/// on stdin, never as an argument.
pub fn build_invocation(
    commands: &ProgramCommands,
    config: &AgentInvocationConfig,
    prompt: &str,
    prior_session: Option<&str>,
) -> Result<InvocationSpec, ConfigurationError> {
    let opts = config.resolved();
    let prior_session = present(prior_session);
    let task_prompt = present(opts.task_prompt.as_deref());
    let workflow_file = opts
        .workflow_file
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty());

    if prior_session.is_none()
        && opts.non_interactive
        && workflow_file.is_none()
        && task_prompt.is_none()
    {
        return Err(ConfigurationError::MissingTaskSource);
    }

    let (base, variant) = match present(opts.command_override.as_deref()) {
        Some(command) => (command, "override"),
        None if opts.non_interactive => (commands.automation.as_str(), "automation"),
        None => (commands.interactive.as_str(), "interactive"),
    };
    let mut words = base.split_whitespace().map(str::to_string);
    let program = words.next().ok_or_else(|| ConfigurationError::EmptyProgram {
        variant: variant.to_string(),
    })?;
    let mut args: Vec<String> = words.collect();

    if opts.non_interactive || opts.enable_chaining {
        args.extend(STREAM_JSON_FLAGS.iter().map(|s| s.to_string()));
    }
    if opts.enable_chaining {
        args.push(CHAINING_FLAG.to_string());
    }
    if let Some(agent) = present(opts.agent_id.as_deref()) {
        push_pair(&mut args, AGENT_FLAG, agent);
    }
    if let Some(path) = workflow_file {
        push_pair(&mut args, WORKFLOW_FLAG, &path.display().to_string());
    }
    if let Some(extra) = present(opts.append_prompt.as_deref()) {
        push_pair(&mut args, APPEND_PROMPT_FLAG, extra);
    }
    match prior_session {
        Some(session) => push_pair(&mut args, RESUME_FLAG, session),
        None => {
            if let Some(task) = task_prompt {
                push_pair(&mut args, TASK_FLAG, task);
            }
        }
    }
    args.extend(opts.passthrough.extra_args.iter().cloned());

    Ok(InvocationSpec {
        program,
        args,
        env: opts.passthrough.env.clone(),
        stdin: (!prompt.is_empty()).then(|| prompt.to_string()),
    })
}

/// Treat blank strings the same as absent ones.
fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: &str) {
    args.push(flag.to_string());
    args.push(value.to_string());
}
