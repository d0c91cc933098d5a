//! Agent stdout → ordered [`StreamEvent`] sequence.
//!
//! [`StreamProcessor::process`] reads a byte stream on its own tokio task,
//! decodes it with [`decoder::StreamDecoder`] and publishes events into an
//! append-only [`feed::EventFeed`]. Consumers subscribe to the feed; the
//! reader never blocks on them.
//!
//! Nothing in the input can fail the caller: malformed lines become `Error`
//! events, read errors end the stream, and a panic stays inside the reader
//! task.

pub mod decoder;
pub mod event;
pub mod feed;

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use decoder::{StreamDecoder, StreamFormat};
pub use event::{EventKind, EventOrigin, StreamEvent};
pub use feed::{EventFeed, EventSubscription};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Counters describing one processed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub total_events: u64,
    pub parse_error_count: u64,
    pub elapsed: Duration,
}

/// A stream being processed in the background.
pub struct ProcessedStream {
    feed: EventFeed,
    task: JoinHandle<StreamSummary>,
    /// Asks the reader to stop at its next read and close the sequence.
    stop: CancellationToken,
    started: Instant,
}

pub struct StreamProcessor;

impl StreamProcessor {
    /// Start consuming `reader`. Returns immediately; events appear on the
    /// feed as lines complete.
    pub fn process<R>(reader: R, format: StreamFormat) -> ProcessedStream
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (writer, feed) = feed::event_channel();
        let started = Instant::now();
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        let task = tokio::spawn(async move {
            let mut reader = reader;
            let mut decoder = StreamDecoder::new(format);
            let mut buf = vec![0u8; READ_CHUNK_SIZE];

            loop {
                let read = tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    read = reader.read(&mut buf) => read,
                };
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for event in decoder.feed(&buf[..n]) {
                            writer.push(event);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "Stream read failed; closing stream");
                        break;
                    }
                }
            }

            for event in decoder.finish() {
                writer.push(event);
            }
            writer.close();

            let summary = StreamSummary {
                total_events: decoder.events_emitted(),
                parse_error_count: decoder.parse_errors(),
                elapsed: started.elapsed(),
            };
            if summary.parse_error_count > 0 {
                tracing::warn!(
                    total_events = summary.total_events,
                    parse_errors = summary.parse_error_count,
                    "Stream contained unparseable lines"
                );
            }
            summary
        });

        ProcessedStream {
            feed,
            task,
            stop,
            started,
        }
    }
}

impl ProcessedStream {
    pub fn feed(&self) -> &EventFeed {
        &self.feed
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.feed.subscribe()
    }

    /// Wait for the reader to reach end of stream.
    pub async fn finish(self) -> StreamSummary {
        let ProcessedStream {
            feed,
            task,
            started,
            ..
        } = self;
        match task.await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(error = %e, "Stream reader task ended abnormally");
                fallback_summary(&feed, started)
            }
        }
    }

    /// Like [`ProcessedStream::finish`], but stops reading after `grace`.
    /// A stopped reader still closes the sequence with a terminal event.
    pub async fn finish_within(self, grace: Duration) -> StreamSummary {
        let ProcessedStream {
            feed,
            mut task,
            stop,
            started,
        } = self;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Stream reader task ended abnormally");
                fallback_summary(&feed, started)
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Stream still open after process exit; abandoning reader"
                );
                stop.cancel();
                match task.await {
                    Ok(summary) => summary,
                    Err(e) => {
                        tracing::error!(error = %e, "Stream reader task ended abnormally");
                        fallback_summary(&feed, started)
                    }
                }
            }
        }
    }
}

fn fallback_summary(feed: &EventFeed, started: Instant) -> StreamSummary {
    let events = feed.snapshot();
    StreamSummary {
        total_events: events.len() as u64,
        parse_error_count: events.iter().filter(|e| e.is_parse_error()).count() as u64,
        elapsed: started.elapsed(),
    }
}
