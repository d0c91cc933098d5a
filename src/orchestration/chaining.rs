//! Turning upstream event sequences into context for a downstream prompt.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::stream::{EventKind, StreamEvent};

use super::types::TaskId;

/// Blank line between injected context and the task's own prompt.
pub const CONTEXT_PROMPT_SEPARATOR: &str = "\n\n";

/// What goes into a transcript and how much of it is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainingPolicy {
    /// Event kinds whose text is included.
    pub include: Vec<EventKind>,
    /// Character budget for the whole context. The most recent text is kept.
    pub max_chars: Option<usize>,
    /// Joins consecutive pieces of text.
    pub separator: String,
}

impl Default for ChainingPolicy {
    fn default() -> Self {
        Self {
            include: vec![EventKind::Message],
            max_chars: None,
            separator: "\n".to_string(),
        }
    }
}

impl ChainingPolicy {
    pub fn includes(&self, kind: EventKind) -> bool {
        self.include.contains(&kind)
    }

    /// Ordered concatenation of the included events' text.
    ///
    /// Lines that failed to parse are never part of a transcript.
    pub fn transcript(&self, events: &[Arc<StreamEvent>]) -> String {
        let pieces: Vec<String> = events
            .iter()
            .filter(|e| self.includes(e.kind) && !e.is_parse_error())
            .filter_map(|e| e.text())
            .filter(|t| !t.is_empty())
            .collect();
        pieces.join(&self.separator)
    }

    /// Build the context for one task from its upstreams' transcripts.
    ///
    /// `upstream` must already be in declaration order. Returns `None` when
    /// every transcript is empty.
    pub fn context<I>(&self, upstream: I) -> Option<ChainedContext>
    where
        I: IntoIterator<Item = (TaskId, String)>,
    {
        let mut sources = Vec::new();
        let mut parts = Vec::new();
        for (id, transcript) in upstream {
            if transcript.is_empty() {
                continue;
            }
            sources.push(id);
            parts.push(transcript);
        }
        if parts.is_empty() {
            return None;
        }

        let joined = parts.join(&self.separator);
        let text = match self.max_chars {
            Some(max) => keep_tail(&joined, max),
            None => joined,
        };
        if text.is_empty() {
            return None;
        }
        Some(ChainedContext { sources, text })
    }
}

/// Context injected into a downstream task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainedContext {
    /// Upstream tasks that contributed text, in declaration order.
    pub sources: Vec<TaskId>,
    pub text: String,
}

impl ChainedContext {
    /// `context + "\n\n" + prompt`, or just the context for an empty prompt.
    pub fn compose(&self, prompt: &str) -> String {
        if prompt.is_empty() {
            self.text.clone()
        } else {
            format!("{}{CONTEXT_PROMPT_SEPARATOR}{prompt}", self.text)
        }
    }
}

/// The last `max` characters of `s`.
fn keep_tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}
