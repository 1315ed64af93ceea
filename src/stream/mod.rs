//! Passthrough and processing split for the wrapped tool's output
//!
//! The splitter owns the child's output stream. Every chunk is written to
//! the host destination first, unbuffered; nothing downstream can pause or
//! slow that copy. A clone of the chunk is then offered to the processing
//! task over a bounded channel with `try_send`: if the processing side is
//! behind, the chunk is skipped there and counted as a backpressure
//! signal, while the passthrough copy has already happened.
//!
//! The processing task runs the record parser and publishes each recovered
//! record on the event bus. It lives on its own task, so a failure there
//! cannot propagate into the passthrough loop.

use crate::error::Result;
use crate::events::{Event, EventBus, EventMetadata, EventPayload};
use crate::parser::StreamRecordParser;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Chunks queued toward the processing task before it counts as behind.
const PROCESSING_CHANNEL_CAPACITY: usize = 1024;

/// Backpressure signals before the one-time warning event.
const BACKPRESSURE_WARN_THRESHOLD: u64 = 10;

/// Read buffer for the passthrough loop.
const READ_BUFFER_BYTES: usize = 8192;

/// Smoothing factor for the parse latency average.
const LATENCY_ALPHA: f64 = 0.2;

/// Processing-path counters. The passthrough path keeps no state at all.
#[derive(Debug, Clone, Default)]
pub struct StreamMetrics {
    pub bytes_processed: u64,
    pub events_emitted: u64,
    pub parse_errors: u64,
    pub avg_parse_latency_ms: f64,
    pub backpressure_signals: u64,
}

pub struct StreamSplitter {
    bus: Arc<EventBus>,
    session_id: String,
    metrics: Arc<Mutex<StreamMetrics>>,
    processing_tx: Option<mpsc::Sender<String>>,
    processing_task: Option<JoinHandle<()>>,
}

impl StreamSplitter {
    pub fn new(bus: Arc<EventBus>, session_id: impl Into<String>) -> Self {
        Self {
            bus,
            session_id: session_id.into(),
            metrics: Arc::new(Mutex::new(StreamMetrics::default())),
            processing_tx: None,
            processing_task: None,
        }
    }

    /// Attach the processing consumer. Chunks copied by [`run`](Self::run)
    /// are offered to it from then on. Calling this twice is a no-op.
    pub fn setup_processing(&mut self) {
        if self.processing_tx.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(PROCESSING_CHANNEL_CAPACITY);
        let bus = self.bus.clone();
        let metrics = self.metrics.clone();
        let session_id = self.session_id.clone();
        self.processing_task = Some(tokio::spawn(processing_loop(
            rx, bus, metrics, session_id,
        )));
        self.processing_tx = Some(tx);
    }

    /// Copy `source` to `destination` until EOF, feeding each chunk to the
    /// processing task when one is attached. The copy is written and
    /// flushed before the processing side is offered anything, and a full
    /// or closed processing channel never delays it.
    pub async fn run<R, W>(&self, mut source: R, mut destination: W) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_BYTES];
        let mut total: u64 = 0;
        loop {
            let n = match source.read(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    self.report_stream_error("reading from source failed", &err);
                    return Err(err.into());
                }
            };
            if n == 0 {
                break;
            }
            if let Err(err) = async {
                destination.write_all(&buf[..n]).await?;
                destination.flush().await
            }
            .await
            {
                self.report_stream_error("writing to destination failed", &err);
                return Err(err.into());
            }
            total += n as u64;

            if let Some(tx) = &self.processing_tx {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                match tx.try_send(text) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => self.handle_backpressure(),
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("processing consumer detached, passthrough continues");
                    }
                }
            }
        }
        Ok(total)
    }

    /// Record that the processing consumer could not accept a chunk. At
    /// exactly [`BACKPRESSURE_WARN_THRESHOLD`] signals, a one-time warning
    /// event is published.
    pub fn handle_backpressure(&self) {
        let count = {
            let mut metrics = self.metrics.lock().unwrap();
            metrics.backpressure_signals += 1;
            metrics.backpressure_signals
        };
        if count == BACKPRESSURE_WARN_THRESHOLD {
            warn!(count, "processing path cannot keep up, dropping chunks");
            let bus = self.bus.clone();
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                bus.publish(Event::new(
                    EventPayload::BackpressureWarning {
                        count,
                        threshold: BACKPRESSURE_WARN_THRESHOLD,
                    },
                    EventMetadata::new(session_id, "stream"),
                ))
                .await;
            });
        }
    }

    /// Publish a stream failure so subscribers learn the pipe broke. The
    /// failure itself still propagates to the caller.
    fn report_stream_error(&self, context: &str, err: &std::io::Error) {
        warn!(context, error = %err, "stream splitter error");
        let bus = self.bus.clone();
        let event = Event::new(
            EventPayload::StreamError {
                message: err.to_string(),
                context: context.to_string(),
            },
            EventMetadata::new(self.session_id.clone(), "stream"),
        );
        tokio::spawn(async move {
            bus.publish(event).await;
        });
    }

    /// Detach the processing consumer, wait for it to drain, and zero all
    /// metrics. Idempotent.
    pub async fn cleanup(&mut self) {
        drop(self.processing_tx.take());
        if let Some(task) = self.processing_task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "processing task ended abnormally");
            }
        }
        *self.metrics.lock().unwrap() = StreamMetrics::default();
    }

    pub fn metrics(&self) -> StreamMetrics {
        self.metrics.lock().unwrap().clone()
    }
}

/// Parse chunks and publish each recovered record. Runs until the sending
/// side is dropped; the parser state dies with the task.
async fn processing_loop(
    mut rx: mpsc::Receiver<String>,
    bus: Arc<EventBus>,
    metrics: Arc<Mutex<StreamMetrics>>,
    session_id: String,
) {
    let mut parser = StreamRecordParser::new();
    while let Some(chunk) = rx.recv().await {
        let started = Instant::now();
        let records = parser.parse(&chunk);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut m = metrics.lock().unwrap();
            m.bytes_processed += chunk.len() as u64;
            m.parse_errors = parser.dropped_lines();
            m.avg_parse_latency_ms = if m.avg_parse_latency_ms == 0.0 {
                elapsed_ms
            } else {
                LATENCY_ALPHA * elapsed_ms + (1.0 - LATENCY_ALPHA) * m.avg_parse_latency_ms
            };
        }

        for record in records {
            let event = Event::record(record, EventMetadata::new(session_id.clone(), "stream"));
            bus.publish(event).await;
            metrics.lock().unwrap().events_emitted += 1;
        }
    }
    debug!("processing loop drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{listener, EventKind, Subject};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn capture_records(bus: &EventBus) -> Arc<Mutex<Vec<Value>>> {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        bus.on(
            Subject::Kind(EventKind::Record),
            listener(move |event| {
                let sink = sink.clone();
                async move {
                    if let Some(record) = event.as_record() {
                        sink.lock().unwrap().push(record.clone());
                    }
                    Ok(())
                }
            }),
        );
        captured
    }

    #[tokio::test]
    async fn passthrough_copies_bytes_exactly_without_processing() {
        let bus = Arc::new(EventBus::new());
        let splitter = StreamSplitter::new(bus, "s1");

        let input = b"plain text\nwith {malformed json\nand more\n".to_vec();
        let mut output: Vec<u8> = Vec::new();
        let copied = splitter.run(input.as_slice(), &mut output).await.unwrap();

        assert_eq!(copied, input.len() as u64);
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn processing_publishes_records_and_passthrough_stays_intact() {
        let bus = Arc::new(EventBus::new());
        let captured = capture_records(&bus);
        let mut splitter = StreamSplitter::new(bus, "s1");
        splitter.setup_processing();

        let input = b"{\"type\":\"query\",\"id\":1}\nnoise line\n{\"type\":\"span\",\"id\":2}\n".to_vec();
        let mut output: Vec<u8> = Vec::new();
        splitter.run(input.as_slice(), &mut output).await.unwrap();
        splitter.cleanup().await;

        assert_eq!(output, input);
        let records = captured.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], json!({"type": "query", "id": 1}));
        assert_eq!(records[1], json!({"type": "span", "id": 2}));
    }

    #[tokio::test]
    async fn records_split_across_reads_are_reassembled() {
        let bus = Arc::new(EventBus::new());
        let captured = capture_records(&bus);
        let mut splitter = StreamSplitter::new(bus, "s1");
        splitter.setup_processing();

        // Two reads via a duplex pipe, split mid-record.
        let (mut writer, reader) = tokio::io::duplex(256);
        let mut output: Vec<u8> = Vec::new();
        let feed = tokio::spawn(async move {
            writer.write_all(b"{\"type\":\"qu").await.unwrap();
            writer.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.write_all(b"ery\",\"id\":\"1\"}\n").await.unwrap();
            writer.shutdown().await.unwrap();
        });

        splitter.run(reader, &mut output).await.unwrap();
        feed.await.unwrap();
        splitter.cleanup().await;

        assert_eq!(output, b"{\"type\":\"query\",\"id\":\"1\"}\n");
        assert_eq!(
            *captured.lock().unwrap(),
            vec![json!({"type": "query", "id": "1"})]
        );
    }

    #[tokio::test]
    async fn backpressure_threshold_publishes_one_warning() {
        let bus = Arc::new(EventBus::new());
        let warnings = Arc::new(Mutex::new(0u32));
        let sink = warnings.clone();
        bus.on(
            Subject::Kind(EventKind::BackpressureWarning),
            listener(move |_event| {
                let sink = sink.clone();
                async move {
                    *sink.lock().unwrap() += 1;
                    Ok(())
                }
            }),
        );

        let splitter = StreamSplitter::new(bus, "s1");
        for _ in 0..25 {
            splitter.handle_backpressure();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*warnings.lock().unwrap(), 1);
        assert_eq!(splitter.metrics().backpressure_signals, 25);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_resets_metrics() {
        let bus = Arc::new(EventBus::new());
        let mut splitter = StreamSplitter::new(bus, "s1");
        splitter.setup_processing();

        let input = b"{\"a\":1}\n".to_vec();
        let mut output: Vec<u8> = Vec::new();
        splitter.run(input.as_slice(), &mut output).await.unwrap();

        splitter.cleanup().await;
        splitter.cleanup().await;

        let metrics = splitter.metrics();
        assert_eq!(metrics.bytes_processed, 0);
        assert_eq!(metrics.events_emitted, 0);
    }

    #[tokio::test]
    async fn processing_metrics_accumulate() {
        let bus = Arc::new(EventBus::new());
        let mut splitter = StreamSplitter::new(bus, "s1");
        splitter.setup_processing();

        let input = b"{\"a\":1}\n{\"b\":2}\nbroken json line\n".to_vec();
        let mut output: Vec<u8> = Vec::new();
        splitter.run(input.as_slice(), &mut output).await.unwrap();

        // Drain the processing task before reading metrics.
        drop(splitter.processing_tx.take());
        if let Some(task) = splitter.processing_task.take() {
            task.await.unwrap();
        }

        let metrics = splitter.metrics();
        assert_eq!(metrics.bytes_processed, input.len() as u64);
        assert_eq!(metrics.events_emitted, 2);
        assert_eq!(metrics.parse_errors, 1);
    }
}
