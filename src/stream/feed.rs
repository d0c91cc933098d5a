//! Append-only event log with independent read cursors.
//!
//! One [`EventWriter`] per invocation appends events; any number of
//! [`EventSubscription`]s read the same sequence from the start. Events are
//! shared as `Arc<StreamEvent>` and never mutated after they are pushed.

use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::watch;

use super::event::StreamEvent;

struct LogState {
    events: Vec<Arc<StreamEvent>>,
    closed: bool,
}

struct EventLog {
    state: Mutex<LogState>,
    /// Bumped on every push and on close.
    version: watch::Sender<u64>,
}

/// Read side of an invocation's event log. Cheap to clone.
#[derive(Clone)]
pub struct EventFeed {
    log: Arc<EventLog>,
}

/// Write side of an event log. Dropping it closes the log.
pub struct EventWriter {
    log: Arc<EventLog>,
}

/// A cursor over an [`EventFeed`], starting at the first event.
pub struct EventSubscription {
    log: Arc<EventLog>,
    changes: watch::Receiver<u64>,
    cursor: usize,
}

/// Create a connected writer/feed pair.
pub fn event_channel() -> (EventWriter, EventFeed) {
    let (version, _) = watch::channel(0);
    let log = Arc::new(EventLog {
        state: Mutex::new(LogState {
            events: Vec::new(),
            closed: false,
        }),
        version,
    });
    (
        EventWriter { log: log.clone() },
        EventFeed { log },
    )
}

impl EventWriter {
    /// Append an event. Ignored once the log is closed.
    pub fn push(&self, event: StreamEvent) {
        {
            let mut state = self.log.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.events.push(Arc::new(event));
        }
        self.log.version.send_modify(|v| *v += 1);
    }

    pub fn close(&self) {
        {
            let mut state = self.log.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.log.version.send_modify(|v| *v += 1);
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl EventFeed {
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            log: self.log.clone(),
            changes: self.log.version.subscribe(),
            cursor: 0,
        }
    }

    /// Events published so far.
    pub fn snapshot(&self) -> Vec<Arc<StreamEvent>> {
        self.log.state.lock().unwrap().events.clone()
    }

    pub fn len(&self) -> usize {
        self.log.state.lock().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.log.state.lock().unwrap().closed
    }

    /// The terminal event, once it has been published.
    pub fn terminal(&self) -> Option<Arc<StreamEvent>> {
        self.log
            .state
            .lock()
            .unwrap()
            .events
            .iter()
            .rev()
            .find(|e| e.terminal)
            .cloned()
    }

    /// Wait until the writer has closed the log.
    pub async fn closed(&self) {
        let mut changes = self.log.version.subscribe();
        loop {
            changes.borrow_and_update();
            if self.is_closed() {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }
}

impl EventSubscription {
    /// Next event in sequence, or `None` once the log is closed and drained.
    pub async fn next(&mut self) -> Option<Arc<StreamEvent>> {
        loop {
            // Mark the current version seen before inspecting state so a push
            // racing with this check still wakes `changed()`.
            self.changes.borrow_and_update();
            {
                let state = self.log.state.lock().unwrap();
                if let Some(event) = state.events.get(self.cursor) {
                    self.cursor += 1;
                    return Some(event.clone());
                }
                if state.closed {
                    return None;
                }
            }
            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Number of events already consumed through this cursor.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<StreamEvent>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}
