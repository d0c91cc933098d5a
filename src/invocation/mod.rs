//! Declarative agent invocation config and command-line construction.
//!
//! [`AgentInvocationConfig`] is the closed option set for one agent run.
//! [`builder::build_invocation`] turns it into an [`InvocationSpec`], and
//! [`program::AgentProgram`] is the capability seam that concrete agent
//! binaries implement.

pub mod builder;
pub mod program;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use builder::{ProgramCommands, build_invocation};
pub use program::{AgentProgram, Availability, ClaudeFlowProgram};

/// Named invocation presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentVariant {
    /// Interactive base program; only the explicitly set options apply.
    #[default]
    Default,
    /// Non-interactive with stream chaining switched on.
    Swarm,
    /// Non-interactive automation run.
    Automation,
    /// Exactly the options given, no preset.
    Custom,
}

impl fmt::Display for AgentVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentVariant::Default => "default",
            AgentVariant::Swarm => "swarm",
            AgentVariant::Automation => "automation",
            AgentVariant::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Free-form arguments and environment passed through untouched.
///
/// Appended after the computed flags and never merged into them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Passthrough {
    pub extra_args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Passthrough {
    pub fn is_empty(&self) -> bool {
        self.extra_args.is_empty() && self.env.is_empty()
    }
}

/// The enumerated option set of an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvocationOptions {
    pub non_interactive: bool,
    pub enable_chaining: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub append_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_override: Option<String>,
    #[serde(skip_serializing_if = "Passthrough::is_empty")]
    pub passthrough: Passthrough,
}

/// Variant tag plus options for one agent invocation.
///
/// Built per task at schedule time and not changed once the invocation
/// starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInvocationConfig {
    #[serde(default)]
    pub variant: AgentVariant,
    #[serde(flatten)]
    pub options: InvocationOptions,
}

impl AgentInvocationConfig {
    pub fn new(variant: AgentVariant) -> Self {
        Self {
            variant,
            options: InvocationOptions::default(),
        }
    }

    pub fn with_options(variant: AgentVariant, options: InvocationOptions) -> Self {
        Self { variant, options }
    }

    /// Options with the variant preset applied.
    ///
    /// Presets only switch flags on; an explicit `true` is never cleared.
    pub fn resolved(&self) -> InvocationOptions {
        let mut opts = self.options.clone();
        match self.variant {
            AgentVariant::Swarm => {
                opts.non_interactive = true;
                opts.enable_chaining = true;
            }
            AgentVariant::Automation => {
                opts.non_interactive = true;
            }
            AgentVariant::Default | AgentVariant::Custom => {}
        }
        opts
    }

    /// Whether the downstream chaining step should inject upstream context.
    pub fn chaining_enabled(&self) -> bool {
        self.resolved().enable_chaining
    }
}

/// A fully computed command line for one process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvocationSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Environment overrides layered over the execution environment.
    pub env: BTreeMap<String, String>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
}

impl InvocationSpec {
    /// `true` if `flag` appears as an argument.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }

    /// Value following `flag`, if the flag is present with a value.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for InvocationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
