//! Batched span export
//!
//! Closed spans are queued in memory and written to a [`SpanWriter`] by a single
//! background worker task. A flush happens when:
//!
//! - the queue reaches `batch_size` (exactly `batch_size` spans are written)
//! - the oldest queued span has waited `flush_interval`
//! - [`SpanBuffer::flush`] or [`SpanBuffer::shutdown`] is called
//!
//! Enqueueing never blocks on storage. A batch that still fails after the
//! configured retries is dropped and reported through the error hook.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::retry::{RetryConfig, with_retry};
use super::{SpanSink, SpanWriter};
use crate::config::TracingConfig;
use crate::error::{ClearstoneError, Result};
use crate::observability::Span;

/// Called with the final error and the spans of a batch that could not be persisted
pub type FlushErrorHook = Arc<dyn Fn(&ClearstoneError, &[Span]) + Send + Sync>;

/// Buffer tuning
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self::from(&TracingConfig::default())
    }
}

impl From<&TracingConfig> for BufferConfig {
    fn from(config: &TracingConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            retry: RetryConfig::from(config),
        }
    }
}

/// Counters describing buffer activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    pub enqueued: u64,
    pub flushes: u64,
    pub flushed_spans: u64,
    pub dropped_batches: u64,
    pub dropped_spans: u64,
    pub pending: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    flushes: AtomicU64,
    flushed_spans: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_spans: AtomicU64,
}

struct Queued {
    span: Span,
    enqueued_at: Instant,
}

#[derive(Default)]
struct Queue {
    spans: VecDeque<Queued>,
    batch_signaled: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    shutdown: AtomicBool,
    counters: Counters,
    error_hook: RwLock<Option<FlushErrorHook>>,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn oldest_deadline(&self, interval: Duration) -> Option<Instant> {
        self.lock_queue()
            .spans
            .front()
            .map(|queued| queued.enqueued_at + interval)
    }

    /// Remove up to `max` spans; with `full_only`, only when `max` are available
    fn take(&self, max: usize, full_only: bool) -> Vec<Span> {
        let mut queue = self.lock_queue();
        if full_only && queue.spans.len() < max {
            queue.batch_signaled = false;
            return Vec::new();
        }
        let count = max.min(queue.spans.len());
        let batch = queue.spans.drain(..count).map(|q| q.span).collect();
        queue.batch_signaled = false;
        batch
    }
}

enum Signal {
    Enqueued,
    BatchReady,
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Batching span exporter with a background flush worker
pub struct SpanBuffer {
    shared: Arc<Shared>,
    signals: mpsc::UnboundedSender<Signal>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    config: BufferConfig,
}

impl std::fmt::Debug for SpanBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanBuffer")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SpanBuffer {
    /// Start a buffer and its worker on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error when called outside a tokio runtime.
    pub fn new(writer: Arc<dyn SpanWriter>, config: BufferConfig) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ClearstoneError::Configuration("span buffer requires a tokio runtime".to_string())
        })?;

        let config = BufferConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            shutdown: AtomicBool::new(false),
            counters: Counters::default(),
            error_hook: RwLock::new(None),
        });
        let (signals, receiver) = mpsc::unbounded_channel();

        let worker = Worker {
            shared: shared.clone(),
            writer,
            config: config.clone(),
            receiver,
        };
        let handle = runtime.spawn(worker.run());

        tracing::debug!(
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "span buffer started"
        );

        Ok(Self {
            shared,
            signals,
            worker: tokio::sync::Mutex::new(Some(handle)),
            config,
        })
    }

    /// Replace the hook invoked when a batch is dropped
    pub fn set_error_hook(&self, hook: FlushErrorHook) {
        *self
            .shared
            .error_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Queue a closed span for export.
    ///
    /// # Errors
    ///
    /// Returns `ProviderShutdown` once shutdown has begun.
    pub fn enqueue(&self, span: Span) -> Result<()> {
        let signal = {
            let mut queue = self.shared.lock_queue();
            if self.shared.shutdown.load(Ordering::Acquire) {
                return Err(ClearstoneError::ProviderShutdown);
            }
            queue.spans.push_back(Queued {
                span,
                enqueued_at: Instant::now(),
            });
            self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);

            if queue.spans.len() >= self.config.batch_size && !queue.batch_signaled {
                queue.batch_signaled = true;
                Some(Signal::BatchReady)
            } else if queue.spans.len() == 1 {
                Some(Signal::Enqueued)
            } else {
                None
            }
        };

        if let Some(signal) = signal {
            // The worker only goes away after shutdown, which is checked above.
            let _ = self.signals.send(signal);
        }
        Ok(())
    }

    /// Write every queued span and wait for the writes to finish
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.signals.send(Signal::Flush(ack)).is_err() {
            return Ok(());
        }
        let _ = done.await;
        Ok(())
    }

    /// Stop accepting spans, write everything queued and stop the worker.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        {
            let _queue = self.shared.lock_queue();
            self.shared.shutdown.store(true, Ordering::Release);
        }

        let Some(handle) = worker.take() else {
            return Ok(());
        };

        let (ack, done) = oneshot::channel();
        if self.signals.send(Signal::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        handle.await.map_err(|e| {
            ClearstoneError::Other(format!("span buffer worker terminated abnormally: {e}"))
        })?;

        tracing::debug!(stats = ?self.stats(), "span buffer shut down");
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BufferStats {
        let counters = &self.shared.counters;
        BufferStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            flushes: counters.flushes.load(Ordering::Relaxed),
            flushed_spans: counters.flushed_spans.load(Ordering::Relaxed),
            dropped_batches: counters.dropped_batches.load(Ordering::Relaxed),
            dropped_spans: counters.dropped_spans.load(Ordering::Relaxed),
            pending: self.shared.lock_queue().spans.len() as u64,
        }
    }
}

impl SpanSink for SpanBuffer {
    fn submit(&self, span: Span) -> Result<()> {
        self.enqueue(span)
    }
}

impl Drop for SpanBuffer {
    fn drop(&mut self) {
        {
            let _queue = self.shared.lock_queue();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        // Let a still-running worker drain in the background.
        let (ack, _done) = oneshot::channel();
        let _ = self.signals.send(Signal::Shutdown(ack));
    }
}

struct Worker {
    shared: Arc<Shared>,
    writer: Arc<dyn SpanWriter>,
    config: BufferConfig,
    receiver: mpsc::UnboundedReceiver<Signal>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let deadline = self.shared.oldest_deadline(self.config.flush_interval);
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                signal = self.receiver.recv() => match signal {
                    Some(Signal::Enqueued) => {}
                    Some(Signal::BatchReady) => self.flush_full_batches().await,
                    Some(Signal::Flush(ack)) => {
                        self.flush_all().await;
                        let _ = ack.send(());
                    }
                    Some(Signal::Shutdown(ack)) => {
                        self.flush_all().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.flush_all().await;
                        break;
                    }
                },
                () = timer => {
                    tracing::trace!("flush interval elapsed");
                    self.flush_all().await;
                }
            }
        }
        tracing::trace!("span buffer worker stopped");
    }

    async fn flush_full_batches(&self) {
        loop {
            let batch = self.shared.take(self.config.batch_size, true);
            if batch.is_empty() {
                break;
            }
            self.write(batch).await;
        }
    }

    async fn flush_all(&self) {
        loop {
            let batch = self.shared.take(self.config.batch_size, false);
            if batch.is_empty() {
                break;
            }
            self.write(batch).await;
        }
    }

    async fn write(&self, batch: Vec<Span>) {
        let batch = Arc::new(batch);
        let outcome = with_retry(&self.config.retry, || {
            let writer = self.writer.clone();
            let batch = batch.clone();
            async move {
                if !writer.is_blocking() {
                    return writer.persist_batch(&batch);
                }
                match tokio::task::spawn_blocking(move || writer.persist_batch(&batch)).await {
                    Ok(result) => result,
                    Err(e) => Err(ClearstoneError::Other(format!("span write task failed: {e}"))),
                }
            }
        })
        .await;

        let counters = &self.shared.counters;
        match outcome {
            Ok(()) => {
                counters.flushes.fetch_add(1, Ordering::Relaxed);
                counters
                    .flushed_spans
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                tracing::trace!(count = batch.len(), "flushed span batch");
            }
            Err((error, attempts)) => {
                counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                counters
                    .dropped_spans
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);

                let error = ClearstoneError::StorageWrite {
                    span_count: batch.len(),
                    attempts,
                    reason: error.to_string(),
                };
                tracing::error!(error = %error, "dropping span batch");

                let hook = self
                    .shared
                    .error_hook
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(hook) = hook {
                    hook(&error, &batch);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::span::test_support::span;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    /// Records batch sizes; fails the first `failures` calls
    #[derive(Default)]
    struct RecordingWriter {
        batches: StdMutex<Vec<Vec<String>>>,
        failures: AtomicUsize,
    }

    impl RecordingWriter {
        fn failing(times: usize) -> Self {
            Self {
                failures: AtomicUsize::new(times),
                ..Default::default()
            }
        }

        fn sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    impl SpanWriter for RecordingWriter {
        fn persist_batch(&self, spans: &[Span]) -> Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ClearstoneError::Other("disk unavailable".to_string()));
            }
            self.batches
                .lock()
                .unwrap()
                .push(spans.iter().map(|s| s.span_id.clone()).collect());
            Ok(())
        }

        fn is_blocking(&self) -> bool {
            false
        }
    }

    fn config(batch_size: usize, interval: Duration) -> BufferConfig {
        BufferConfig {
            batch_size,
            flush_interval: interval,
            retry: RetryConfig::default()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_millis(10))
                .with_jitter(false),
        }
    }

    fn spans(count: usize) -> Vec<Span> {
        (0..count)
            .map(|i| span("t", &format!("s{i:03}"), None, i as u64))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_flushes_exact_batch() {
        let writer = Arc::new(RecordingWriter::default());
        let buffer = SpanBuffer::new(writer.clone(), config(3, Duration::from_secs(3600))).unwrap();

        for span in spans(4) {
            buffer.enqueue(span).unwrap();
        }
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(writer.sizes(), vec![3]);
        assert_eq!(buffer.stats().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_trigger_flushes_within_interval() {
        let writer = Arc::new(RecordingWriter::default());
        let buffer = SpanBuffer::new(writer.clone(), config(100, Duration::from_secs(5))).unwrap();

        for span in spans(2) {
            buffer.enqueue(span).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(writer.sizes().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(writer.sizes(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_flush_drains_in_chunks() {
        let writer = Arc::new(RecordingWriter::default());
        let buffer = SpanBuffer::new(writer.clone(), config(4, Duration::from_secs(3600))).unwrap();

        for span in spans(3) {
            buffer.enqueue(span).unwrap();
        }
        buffer.flush().await.unwrap();
        assert_eq!(writer.sizes(), vec![3]);
        assert_eq!(buffer.stats().flushed_spans, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_and_rejects() {
        let writer = Arc::new(RecordingWriter::default());
        let buffer = SpanBuffer::new(writer.clone(), config(100, Duration::from_secs(5))).unwrap();

        for span in spans(5) {
            buffer.enqueue(span).unwrap();
        }
        buffer.shutdown().await.unwrap();
        assert_eq!(writer.sizes(), vec![5]);

        let err = buffer.enqueue(spans(1).remove(0)).unwrap_err();
        assert!(matches!(err, ClearstoneError::ProviderShutdown));

        buffer.shutdown().await.unwrap();
        assert_eq!(writer.sizes(), vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let writer = Arc::new(RecordingWriter::failing(2));
        let buffer = SpanBuffer::new(writer.clone(), config(2, Duration::from_secs(3600))).unwrap();

        for span in spans(2) {
            buffer.enqueue(span).unwrap();
        }
        buffer.flush().await.unwrap();

        assert_eq!(writer.sizes(), vec![2]);
        assert_eq!(buffer.stats().dropped_batches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_invoke_hook() {
        let writer = Arc::new(RecordingWriter::failing(10));
        let buffer = SpanBuffer::new(writer.clone(), config(100, Duration::from_secs(3600))).unwrap();

        let reported: Arc<StdMutex<Vec<(String, usize)>>> = Arc::default();
        let sink = reported.clone();
        buffer.set_error_hook(Arc::new(move |error, spans| {
            sink.lock().unwrap().push((error.to_string(), spans.len()));
        }));

        for span in spans(3) {
            buffer.enqueue(span).unwrap();
        }
        buffer.flush().await.unwrap();

        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].1, 3);
        assert!(reported[0].0.contains("after 3 attempt(s)"));
        assert!(writer.sizes().is_empty());

        let stats = buffer.stats();
        assert_eq!(stats.dropped_batches, 1);
        assert_eq!(stats.dropped_spans, 3);
    }

    #[test]
    fn test_requires_runtime() {
        let writer = Arc::new(RecordingWriter::default());
        let result = SpanBuffer::new(writer, BufferConfig::default());
        assert!(matches!(result, Err(ClearstoneError::Configuration(_))));
    }
}
