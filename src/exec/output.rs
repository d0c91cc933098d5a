//! Bounded capture of a process's diagnostic output.
//!
//! stderr is not part of the event stream, but its last lines are the most
//! useful thing to show when an agent fails. [`OutputTail::collect`] drains a
//! reader on a background task into a ring buffer that keeps the most recent
//! [`OUTPUT_BUFFER_CAPACITY`] lines.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Maximum number of lines retained per process.
pub const OUTPUT_BUFFER_CAPACITY: usize = 1000;

/// Lines surfaced in failure summaries.
pub const SUMMARY_TAIL_LINES: usize = 20;

#[derive(Clone, Default)]
pub struct OutputTail {
    buffer: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    /// Spawn a reader task that appends every line of `reader` to a new tail.
    pub fn collect<R>(reader: R) -> (OutputTail, JoinHandle<()>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tail = OutputTail::default();
        let sink = tail.clone();
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => sink.push(line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "Diagnostic output read failed");
                        break;
                    }
                }
            }
        });
        (tail, task)
    }

    pub fn push(&self, line: String) {
        let mut buf = self.buffer.lock().unwrap();
        if buf.len() >= OUTPUT_BUFFER_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(line);
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let buf = self.buffer.lock().unwrap();
        let skip = buf.len().saturating_sub(n);
        buf.iter().skip(skip).cloned().collect()
    }

    /// Last [`SUMMARY_TAIL_LINES`] lines joined with newlines, or `None` if
    /// nothing was captured.
    pub fn summary(&self) -> Option<String> {
        let lines = self.tail(SUMMARY_TAIL_LINES);
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
