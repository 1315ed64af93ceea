//! Generic accumulate-and-flush queue
//!
//! Items accumulate in FIFO order and are handed to a flush handler in
//! batches, triggered by size or by a recurring interval. A dedicated owner
//! task is the sole mutator of the accumulator; adds, triggers, manual
//! flushes, stop requests, and flush completions all arrive as control
//! messages, so bursts of triggers coalesce into a single flush cycle.
//!
//! Failed batches retry with exponential backoff; a batch that exhausts its
//! retries is reported through the error callback (and as a
//! [`EventKind::BatchFailed`](crate::events::EventKind) event when a bus is
//! attached) and then dropped. `stop()` drains every remaining item before
//! returning.

use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventMetadata, EventPayload};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Async handler invoked with each batch. Failure is signalled by `Err`.
pub type BatchHandler<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Callback invoked when a batch exhausts its retries. Receives the error
/// and the dropped items.
pub type ErrorCallback<T> = Arc<dyn Fn(&Error, Vec<T>) + Send + Sync>;

/// Wrap an async closure into a [`BatchHandler`].
pub fn batch_handler<T, F, Fut>(f: F) -> BatchHandler<T>
where
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |batch| Box::pin(f(batch)))
}

#[derive(Debug, Clone)]
pub struct BatchQueueConfig {
    /// Items per flush; a size trigger fires when the accumulator reaches it.
    pub batch_size: usize,
    /// Period of the recurring time trigger.
    pub flush_interval: Duration,
    /// Bound on concurrently running flushes. `None` is unbounded.
    pub max_concurrent: Option<usize>,
    /// Additional attempts after the first failure.
    pub retry_attempts: u32,
    /// Backoff base: attempt `n` sleeps `retry_delay * 2^n`.
    pub retry_delay: Duration,
}

impl Default for BatchQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_concurrent: None,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Incrementally maintained queue counters.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub items_added: u64,
    pub batches_flushed: u64,
    pub batches_failed: u64,
    pub avg_batch_size: f64,
    pub avg_flush_ms: f64,
}

enum Control<T> {
    Add(T, oneshot::Sender<Result<()>>),
    Tick,
    Flush(oneshot::Sender<()>),
    FlushDone,
    Stop(oneshot::Sender<()>),
}

/// Handle to a running batch queue.
pub struct BatchQueue<T> {
    tx: mpsc::UnboundedSender<Control<T>>,
    metrics: Arc<Mutex<QueueMetrics>>,
}

impl<T: Clone + Send + 'static> BatchQueue<T> {
    pub fn new(config: BatchQueueConfig, handler: BatchHandler<T>) -> Self {
        Self::with_hooks(config, handler, None, None)
    }

    /// Create a queue with an error callback and an event bus for failed
    /// batch reports.
    pub fn with_hooks(
        config: BatchQueueConfig,
        handler: BatchHandler<T>,
        error_callback: Option<ErrorCallback<T>>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(Mutex::new(QueueMetrics::default()));

        let owner = QueueOwner {
            config: config.clone(),
            handler,
            error_callback,
            bus,
            queue: VecDeque::new(),
            active: true,
            draining: false,
            in_flight: 0,
            flush_waiters: Vec::new(),
            stop_waiters: Vec::new(),
            control_tx: tx.clone(),
            metrics: metrics.clone(),
        };
        tokio::spawn(owner.run(rx));

        // Time trigger. Exits once the owner ends and the channel closes.
        let tick_tx = tx.clone();
        tokio::spawn(async move {
            let period = config.flush_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if tick_tx.send(Control::Tick).is_err() {
                    break;
                }
            }
        });

        Self { tx, metrics }
    }

    /// Append an item. Fails once the queue has been stopped.
    pub async fn add(&self, item: T) -> Result<()> {
        let (ack, response) = oneshot::channel();
        self.tx
            .send(Control::Add(item, ack))
            .map_err(|_| Error::QueueStopped("queue task has ended".to_string()))?;
        response
            .await
            .map_err(|_| Error::QueueStopped("queue task has ended".to_string()))?
    }

    /// Wait for in-flight flushes, then force flushing of every remaining
    /// item, respecting the concurrency bound.
    pub async fn flush(&self) -> Result<()> {
        let (ack, response) = oneshot::channel();
        if self.tx.send(Control::Flush(ack)).is_err() {
            // Already stopped, which implies fully drained.
            return Ok(());
        }
        let _ = response.await;
        Ok(())
    }

    /// Stop the queue and drain everything still accumulated. Idempotent;
    /// any `add` after this fails.
    pub async fn stop(&self) {
        let (ack, response) = oneshot::channel();
        if self.tx.send(Control::Stop(ack)).is_err() {
            return;
        }
        let _ = response.await;
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.metrics.lock().unwrap().clone()
    }
}

struct QueueOwner<T> {
    config: BatchQueueConfig,
    handler: BatchHandler<T>,
    error_callback: Option<ErrorCallback<T>>,
    bus: Option<Arc<EventBus>>,
    queue: VecDeque<T>,
    active: bool,
    draining: bool,
    in_flight: usize,
    flush_waiters: Vec<oneshot::Sender<()>>,
    stop_waiters: Vec<oneshot::Sender<()>>,
    control_tx: mpsc::UnboundedSender<Control<T>>,
    metrics: Arc<Mutex<QueueMetrics>>,
}

impl<T: Clone + Send + 'static> QueueOwner<T> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Control<T>>) {
        while let Some(message) = rx.recv().await {
            match message {
                Control::Add(item, ack) => {
                    if !self.active {
                        let _ = ack.send(Err(Error::QueueStopped(
                            "add called after stop".to_string(),
                        )));
                        continue;
                    }
                    self.queue.push_back(item);
                    self.metrics.lock().unwrap().items_added += 1;
                    let _ = ack.send(Ok(()));
                    if self.queue.len() >= self.config.batch_size {
                        self.pump(false);
                    }
                }
                Control::Tick => {
                    if self.active && !self.queue.is_empty() {
                        self.pump(false);
                    }
                }
                Control::Flush(ack) => {
                    self.flush_waiters.push(ack);
                    self.draining = true;
                    self.pump(true);
                    self.settle();
                }
                Control::FlushDone => {
                    self.in_flight -= 1;
                    if !self.queue.is_empty() {
                        self.pump(self.draining);
                    }
                    self.settle();
                }
                Control::Stop(ack) => {
                    self.active = false;
                    self.stop_waiters.push(ack);
                    self.draining = true;
                    self.pump(true);
                    self.settle();
                }
            }

            if !self.active
                && self.stop_waiters.is_empty()
                && self.queue.is_empty()
                && self.in_flight == 0
            {
                break;
            }
        }
        debug!("batch queue owner task ended");
    }

    /// Start one flush, or fill the whole concurrency budget when forcing.
    fn pump(&mut self, force: bool) {
        if force {
            while self.try_start_flush() {}
        } else {
            self.try_start_flush();
        }
    }

    fn try_start_flush(&mut self) -> bool {
        if self.queue.is_empty() {
            return false;
        }
        if let Some(max) = self.config.max_concurrent {
            if self.in_flight >= max {
                return false;
            }
        }

        let take = self.config.batch_size.min(self.queue.len());
        let batch: Vec<T> = self.queue.drain(..take).collect();
        self.in_flight += 1;

        let handler = self.handler.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();
        let error_callback = self.error_callback.clone();
        let bus = self.bus.clone();
        let done = self.control_tx.clone();
        tokio::spawn(async move {
            run_flush(handler, batch, &config, &metrics, error_callback, bus).await;
            let _ = done.send(Control::FlushDone);
        });
        true
    }

    /// Resolve waiters once everything accumulated has been handed off and
    /// completed.
    fn settle(&mut self) {
        if !self.queue.is_empty() || self.in_flight > 0 {
            return;
        }
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(());
        }
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.draining = false;
    }
}

/// One batch's lifecycle: attempt, back off, retry, and finally report.
async fn run_flush<T: Clone>(
    handler: BatchHandler<T>,
    batch: Vec<T>,
    config: &BatchQueueConfig,
    metrics: &Arc<Mutex<QueueMetrics>>,
    error_callback: Option<ErrorCallback<T>>,
    bus: Option<Arc<EventBus>>,
) {
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        match handler(batch.clone()).await {
            Ok(()) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                let mut m = metrics.lock().unwrap();
                m.batches_flushed += 1;
                let n = m.batches_flushed as f64;
                m.avg_batch_size += (batch.len() as f64 - m.avg_batch_size) / n;
                m.avg_flush_ms += (elapsed_ms - m.avg_flush_ms) / n;
                return;
            }
            Err(err) => {
                if attempt >= config.retry_attempts {
                    warn!(
                        error = %err,
                        len = batch.len(),
                        attempts = attempt + 1,
                        "batch dropped after exhausting retries"
                    );
                    metrics.lock().unwrap().batches_failed += 1;
                    if let Some(bus) = &bus {
                        bus.publish(Event::new(
                            EventPayload::BatchFailed {
                                message: err.to_string(),
                                batch_len: batch.len(),
                            },
                            EventMetadata::new("", "batch_queue"),
                        ))
                        .await;
                    }
                    if let Some(callback) = &error_callback {
                        callback(&err, batch);
                    }
                    return;
                }
                let delay = config.retry_delay * 2u32.pow(attempt);
                debug!(attempt, ?delay, error = %err, "batch flush failed, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    type Captured = Arc<Mutex<Vec<Vec<u32>>>>;

    fn capturing_handler(captured: Captured) -> BatchHandler<u32> {
        batch_handler(move |batch: Vec<u32>| {
            let captured = captured.clone();
            async move {
                captured.lock().unwrap().push(batch);
                Ok(())
            }
        })
    }

    fn quick_config(batch_size: usize) -> BatchQueueConfig {
        BatchQueueConfig {
            batch_size,
            flush_interval: Duration::from_secs(60),
            retry_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn size_trigger_flushes_exactly_one_full_batch() {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let queue = BatchQueue::new(quick_config(3), capturing_handler(captured.clone()));

        for n in 0..3 {
            queue.add(n).await.unwrap();
        }
        queue.flush().await.unwrap();

        let batches = captured.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn interval_trigger_flushes_partial_batch() {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let config = BatchQueueConfig {
            batch_size: 100,
            flush_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let queue = BatchQueue::new(config, capturing_handler(captured.clone()));

        queue.add(1).await.unwrap();
        queue.add(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let batches = captured.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec![1, 2]);
    }

    #[tokio::test]
    async fn stop_drains_all_items_and_rejects_further_adds() {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let queue = BatchQueue::new(quick_config(10), capturing_handler(captured.clone()));

        for n in 0..25 {
            queue.add(n).await.unwrap();
        }
        queue.stop().await;

        let received: usize = captured.lock().unwrap().iter().map(Vec::len).sum();
        assert_eq!(received, 25);
        assert!(matches!(
            queue.add(99).await,
            Err(Error::QueueStopped(_))
        ));

        // Idempotent.
        queue.stop().await;
    }

    #[tokio::test]
    async fn transient_failures_retry_with_backoff_and_succeed() {
        let attempts = Arc::new(AtomicU32::new(0));
        let stamps: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let attempts = attempts.clone();
            let stamps = stamps.clone();
            batch_handler(move |_batch: Vec<u32>| {
                let attempts = attempts.clone();
                let stamps = stamps.clone();
                async move {
                    stamps.lock().unwrap().push(Instant::now());
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::BatchHandler("transient".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
        };

        let config = BatchQueueConfig {
            batch_size: 1,
            flush_interval: Duration::from_secs(60),
            retry_delay: Duration::from_millis(20),
            ..Default::default()
        };
        let queue = BatchQueue::new(config, handler);
        queue.add(7).await.unwrap();
        queue.flush().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let metrics = queue.metrics();
        assert_eq!(metrics.batches_flushed, 1);
        assert_eq!(metrics.batches_failed, 0);

        // Delays follow retry_delay * 2^attempt: ~20ms then ~40ms.
        let stamps = stamps.lock().unwrap();
        let first_gap = stamps[1] - stamps[0];
        let second_gap = stamps[2] - stamps[1];
        assert!(first_gap >= Duration::from_millis(18), "{first_gap:?}");
        assert!(second_gap >= Duration::from_millis(36), "{second_gap:?}");
    }

    #[tokio::test]
    async fn exhausted_retries_report_and_drop_the_batch() {
        let failing = batch_handler(|_batch: Vec<u32>| async {
            Err(Error::BatchHandler("sink unavailable".to_string()))
        });
        let dropped: Arc<Mutex<Vec<Vec<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let on_error: ErrorCallback<u32> = {
            let dropped = dropped.clone();
            Arc::new(move |_err, batch| {
                dropped.lock().unwrap().push(batch);
            })
        };

        let config = BatchQueueConfig {
            batch_size: 2,
            flush_interval: Duration::from_secs(60),
            retry_attempts: 1,
            retry_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let queue = BatchQueue::with_hooks(config, failing, Some(on_error), None);
        queue.add(1).await.unwrap();
        queue.add(2).await.unwrap();
        queue.flush().await.unwrap();

        assert_eq!(*dropped.lock().unwrap(), vec![vec![1, 2]]);
        let metrics = queue.metrics();
        assert_eq!(metrics.batches_failed, 1);
        assert_eq!(metrics.batches_flushed, 0);
    }

    #[tokio::test]
    async fn max_concurrent_bounds_in_flight_flushes() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handler = {
            let current = current.clone();
            let peak = peak.clone();
            batch_handler(move |_batch: Vec<u32>| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let config = BatchQueueConfig {
            batch_size: 2,
            flush_interval: Duration::from_secs(60),
            max_concurrent: Some(1),
            ..Default::default()
        };
        let queue = BatchQueue::new(config, handler);
        for n in 0..8 {
            queue.add(n).await.unwrap();
        }
        queue.stop().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(queue.metrics().batches_flushed, 4);
    }

    #[tokio::test]
    async fn metrics_track_running_averages() {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let queue = BatchQueue::new(quick_config(2), capturing_handler(captured));

        for n in 0..4 {
            queue.add(n).await.unwrap();
        }
        queue.flush().await.unwrap();

        let metrics = queue.metrics();
        assert_eq!(metrics.items_added, 4);
        assert_eq!(metrics.batches_flushed, 2);
        assert!((metrics.avg_batch_size - 2.0).abs() < f64::EPSILON);
    }
}
