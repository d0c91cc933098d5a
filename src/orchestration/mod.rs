//! Workflow orchestration.
//!
//! A [`graph::WorkflowGraph`] of [`types::WorkflowTask`]s is executed by the
//! [`engine::WorkflowEngine`], which chains completed tasks' transcripts into
//! their dependents ([`chaining`]) and forwards every event to a
//! [`sink::MessageSink`]. Graphs are usually loaded from a
//! [`document::WorkflowDocument`].

pub mod chaining;
pub mod document;
pub mod engine;
pub mod graph;
pub mod sink;
pub mod types;

pub use chaining::{ChainedContext, ChainingPolicy};
pub use document::WorkflowDocument;
pub use engine::{EngineSettings, StatusSnapshot, WorkflowEngine, WorkflowRun};
pub use graph::WorkflowGraph;
pub use sink::{JsonlSink, MemorySink, MessageSink, NullSink};
pub use types::{FailureReason, TaskId, TaskReport, TaskStatus, WorkflowReport, WorkflowTask};
