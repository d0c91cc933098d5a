//! Persistence of agent event streams.
//!
//! The engine forwards every event of every invocation to one [`MessageSink`],
//! in sequence order and exactly once, then calls [`MessageSink::finish`]
//! when the stream has closed. Sinks must not fail the workflow, so their
//! methods return nothing and log their own errors.
//!
//! [`JsonlSink`] writes one file per invocation,
//! `{dir}/{task_id}-{invocation_id}.jsonl`, using synchronous `std::fs`: each
//! write is small, buffered and flushed per event.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

use crate::exec::InvocationId;
use crate::stream::{EventKind, StreamEvent, StreamSummary};

use super::types::TaskId;

pub trait MessageSink: Send + Sync {
    fn record(&self, task_id: &TaskId, invocation_id: &InvocationId, event: &StreamEvent);

    fn finish(&self, task_id: &TaskId, invocation_id: &InvocationId, summary: &StreamSummary);
}

/// Discards everything.
pub struct NullSink;

impl MessageSink for NullSink {
    fn record(&self, _: &TaskId, _: &InvocationId, _: &StreamEvent) {}

    fn finish(&self, _: &TaskId, _: &InvocationId, _: &StreamSummary) {}
}

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// One line of a JSONL stream log, tagged with `event_type`.
#[derive(Debug, Serialize)]
#[serde(tag = "event_type")]
pub enum LogEntry<'a> {
    #[serde(rename = "stream_event")]
    StreamEvent {
        timestamp: String,
        task_id: &'a str,
        invocation_id: &'a str,
        sequence: u64,
        kind: EventKind,
        terminal: bool,
        payload: &'a serde_json::Value,
    },

    #[serde(rename = "stream_end")]
    StreamEnd {
        timestamp: String,
        task_id: &'a str,
        invocation_id: &'a str,
        total_events: u64,
        parse_error_count: u64,
        elapsed_secs: f64,
    },
}

pub struct JsonlSink {
    dir: PathBuf,
    writers: Mutex<HashMap<InvocationId, BufWriter<fs::File>>>,
}

impl JsonlSink {
    /// Create the sink, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for one invocation.
    pub fn log_path(&self, task_id: &str, invocation_id: &str) -> PathBuf {
        self.dir.join(format!("{}-{invocation_id}.jsonl", file_safe(task_id)))
    }

    fn write(&self, task_id: &str, invocation_id: &InvocationId, entry: &LogEntry<'_>) -> anyhow::Result<()> {
        let mut writers = self.writers.lock().unwrap();
        if !writers.contains_key(invocation_id) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_path(task_id, invocation_id))?;
            writers.insert(invocation_id.clone(), BufWriter::new(file));
        }
        if let Some(writer) = writers.get_mut(invocation_id) {
            serde_json::to_writer(&mut *writer, entry)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        Ok(())
    }
}

impl MessageSink for JsonlSink {
    fn record(&self, task_id: &TaskId, invocation_id: &InvocationId, event: &StreamEvent) {
        let entry = LogEntry::StreamEvent {
            timestamp: event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            task_id,
            invocation_id,
            sequence: event.sequence,
            kind: event.kind,
            terminal: event.terminal,
            payload: &event.payload,
        };
        if let Err(e) = self.write(task_id, invocation_id, &entry) {
            tracing::warn!(task_id = %task_id, invocation_id = %invocation_id, error = %e, "Stream log write failed");
        }
    }

    fn finish(&self, task_id: &TaskId, invocation_id: &InvocationId, summary: &StreamSummary) {
        let entry = LogEntry::StreamEnd {
            timestamp: now_iso(),
            task_id,
            invocation_id,
            total_events: summary.total_events,
            parse_error_count: summary.parse_error_count,
            elapsed_secs: summary.elapsed.as_secs_f64(),
        };
        if let Err(e) = self.write(task_id, invocation_id, &entry) {
            tracing::warn!(task_id = %task_id, invocation_id = %invocation_id, error = %e, "Stream log write failed");
        }
        self.writers.lock().unwrap().remove(invocation_id);
    }
}

/// Task ids are caller-chosen; keep them from escaping the log directory.
fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Keeps everything in memory, keyed by task. Useful for tests and for
/// callers that want the raw events after a run.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<HashMap<TaskId, Vec<StreamEvent>>>,
    finished: Mutex<HashMap<TaskId, StreamSummary>>,
}

impl MemorySink {
    pub fn events(&self, task_id: &str) -> Vec<StreamEvent> {
        self.events
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn summary(&self, task_id: &str) -> Option<StreamSummary> {
        self.finished.lock().unwrap().get(task_id).cloned()
    }
}

impl MessageSink for MemorySink {
    fn record(&self, task_id: &TaskId, _: &InvocationId, event: &StreamEvent) {
        self.events
            .lock()
            .unwrap()
            .entry(task_id.clone())
            .or_default()
            .push(event.clone());
    }

    fn finish(&self, task_id: &TaskId, _: &InvocationId, summary: &StreamSummary) {
        self.finished
            .lock()
            .unwrap()
            .insert(task_id.clone(), summary.clone());
    }
}
