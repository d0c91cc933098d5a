use std::path::PathBuf;

/// Errors related to configuration loading and parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },
}

/// An invocation config that cannot be turned into a command line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("automation invocation needs a workflow file or a task prompt")]
    MissingTaskSource,

    #[error("program command for `{variant}` is empty")]
    EmptyProgram { variant: String },
}

/// Errors raised while starting an agent process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("executable not found: {program}")]
    ExecutableNotFound { program: String },

    #[error("permission denied executing {program}")]
    PermissionDenied { program: String },

    #[error("failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl SpawnError {
    /// Classify an I/O error returned by `Command::spawn`.
    pub fn from_io(program: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SpawnError::ExecutableNotFound {
                program: program.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied {
                program: program.to_string(),
            },
            _ => SpawnError::Io {
                program: program.to_string(),
                source: err,
            },
        }
    }
}

/// A single NDJSON line that could not be mapped to an event kind.
///
/// Never escapes the stream processor; it becomes the payload of an
/// `Error` event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("record has no `type` discriminator")]
    MissingDiscriminator,

    #[error("unknown record type `{0}`")]
    UnknownDiscriminator(String),
}

/// Structural problems in a workflow graph, detected before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow has no tasks")]
    Empty,

    #[error("duplicate task id `{task_id}`")]
    DuplicateTaskId { task_id: String },

    #[error("task `{task_id}` depends on unknown task `{missing}`")]
    UnresolvedDependency { task_id: String, missing: String },

    #[error("dependency cycle: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("task `{task_id}` references unknown agent profile `{profile}`")]
    UnknownAgentProfile { task_id: String, profile: String },
}
