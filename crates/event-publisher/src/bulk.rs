// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching decorator in front of an output worker.
//!
//! # Batching Strategy
//!
//! Events are accumulated into one in-progress batch until one of these
//! happens:
//! 1. **Size**: the batch reaches `max_size` events. It is flushed right away
//!    and the flush timer restarts.
//! 2. **Interval**: the flush timer fires. Whatever is pending, including a
//!    partial batch, is flushed, which bounds latency under low throughput.
//! 3. **Routing change**: a message with different metadata arrives. Batches
//!    never mix routing metadata.
//! 4. **Shutdown**: the queue is drained and the last partial batch flushed
//!    before the downstream worker is stopped.
//!
//! A message whose events straddle a size boundary has its signal split
//! across the batches it ends up in. Each flushed batch carries a composite
//! signal resolving every contributing message.
//!
//! Batching is disabled when the flush interval or the maximum size is not
//! positive; messages then go straight to the downstream worker untouched.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::event::{Context, Event, Message, Metadata};
use crate::signal::{CompletionSignal, SplitPolicy};
use crate::stats::PublisherStats;
use crate::worker::{WorkerHandle, WorkerSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub flush_interval: Duration,
    pub max_size: usize,
}

impl BatchSettings {
    /// Returns `None`, meaning batching is disabled, unless both limits are
    /// positive.
    pub fn new(flush_interval: Duration, max_size: usize) -> Option<Self> {
        if flush_interval.is_zero() || max_size == 0 {
            return None;
        }
        Some(Self {
            flush_interval,
            max_size,
        })
    }

    /// Same as [`BatchSettings::new`] for signed configuration values.
    pub fn from_config(flush_interval_ms: i64, bulk_max_size: i64) -> Option<Self> {
        let flush_interval = u64::try_from(flush_interval_ms).ok()?;
        let max_size = usize::try_from(bulk_max_size).ok()?;
        Self::new(Duration::from_millis(flush_interval), max_size)
    }
}

#[derive(Debug, Clone, Copy)]
enum FlushReason {
    Size,
    Interval,
    Routing,
    Shutdown,
}

#[derive(Default)]
struct PendingBatch {
    events: Vec<Event>,
    signals: Vec<CompletionSignal>,
    metadata: Metadata,
}

impl PendingBatch {
    fn len(&self) -> usize {
        self.events.len()
    }

    fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub struct BulkWorker {
    name: Arc<str>,
    rx: mpsc::Receiver<Message>,
    settings: BatchSettings,
    pending: PendingBatch,
    downstream: WorkerHandle,
    downstream_signal: WorkerSignal,
    stats: Arc<PublisherStats>,
}

impl BulkWorker {
    /// Puts a batching stage in front of `downstream` and returns the handle
    /// producers should send to.
    ///
    /// The new stage runs on `signal`. `downstream_signal` is the signal the
    /// downstream worker runs on; it is stopped once this stage has flushed
    /// its last batch. With `settings == None` the downstream handle itself
    /// is returned and only the shutdown hand-over runs on `signal`.
    pub fn start(
        signal: &WorkerSignal,
        capacity: usize,
        settings: Option<BatchSettings>,
        downstream: WorkerHandle,
        downstream_signal: WorkerSignal,
        stats: Arc<PublisherStats>,
    ) -> WorkerHandle {
        let Some(settings) = settings else {
            debug!(worker = %downstream.name(), "batching disabled, passing messages through");
            let shutdown = signal.token();
            signal.spawn(async move {
                shutdown.cancelled().await;
                downstream_signal.stop().await;
            });
            return downstream;
        };

        let name: Arc<str> = format!("{}/bulk", downstream.name()).into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = BulkWorker {
            name: Arc::clone(&name),
            rx,
            settings,
            pending: PendingBatch::default(),
            downstream,
            downstream_signal,
            stats,
        };
        signal.spawn(worker.run(signal.token()));
        WorkerHandle::from_parts(name, tx)
    }

    async fn run(mut self, shutdown: CancellationToken) {
        debug!(
            worker = %self.name,
            max_size = self.settings.max_size,
            flush_interval = ?self.settings.flush_interval,
            "bulk worker started"
        );

        let period = self.settings.flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => {
                        if self.append(message).await {
                            ticker.reset();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush(FlushReason::Interval).await,
            }
        }

        self.rx.close();
        while let Some(message) = self.rx.recv().await {
            self.append(message).await;
        }
        self.flush(FlushReason::Shutdown).await;

        self.downstream_signal.stop().await;
        debug!(worker = %self.name, "bulk worker stopped");
    }

    /// Adds a message to the pending batch. Returns true when a size flush
    /// happened.
    async fn append(&mut self, message: Message) -> bool {
        let Message { context, payload } = message;
        let Context { signal, metadata } = context;
        let mut size_flushed = false;

        if !self.pending.is_empty() && self.pending.metadata != metadata {
            self.flush(FlushReason::Routing).await;
        }

        let events = payload.into_events();
        if events.is_empty() {
            signal.completed();
            return false;
        }
        if self.pending.is_empty() {
            self.pending.metadata = metadata.clone();
        }

        let max = self.settings.max_size;
        let room = max - self.pending.len();
        let chunks = if events.len() <= room {
            1
        } else {
            1 + (events.len() - room).div_ceil(max)
        };
        let mut signals = signal.split(chunks, SplitPolicy::FailIfAnyFails).into_iter();
        let mut events = events.into_iter();

        loop {
            let room = max - self.pending.len();
            let before = self.pending.len();
            self.pending.events.extend(events.by_ref().take(room));
            if self.pending.len() == before {
                break;
            }
            if let Some(chunk_signal) = signals.next() {
                self.pending.signals.push(chunk_signal);
            }
            if self.pending.len() >= max {
                self.flush(FlushReason::Size).await;
                self.pending.metadata = metadata.clone();
                size_flushed = true;
            }
        }

        size_flushed
    }

    async fn flush(&mut self, reason: FlushReason) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        let count = batch.events.len();
        trace!(worker = %self.name, count, ?reason, "flushing batch");

        let context = Context {
            signal: CompletionSignal::composite(batch.signals),
            metadata: batch.metadata,
        };
        self.stats.record_batch_flushed();
        if let Err(err) = self
            .downstream
            .send(Message::batch(context, batch.events))
            .await
        {
            self.stats.record_dropped(count);
            error!(worker = %self.name, count, error = %err, "failed to hand batch to output");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use crate::signal::Outcome;
    use crate::worker::{MessageHandler, MessageWorker};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records the size of every payload it receives.
    #[derive(Clone, Default)]
    struct BatchCapture {
        sizes: Arc<Mutex<Vec<usize>>>,
        singles: Arc<AtomicUsize>,
        metadata: Arc<Mutex<Vec<Metadata>>>,
        fail_with: Option<&'static str>,
    }

    #[async_trait]
    impl MessageHandler for BatchCapture {
        async fn on_message(&mut self, message: Message) {
            if matches!(message.payload, Payload::Single(_)) {
                self.singles.fetch_add(1, Ordering::SeqCst);
            }
            self.sizes.lock().unwrap().push(message.payload.len());
            self.metadata
                .lock()
                .unwrap()
                .push(message.context.metadata.clone());
            match self.fail_with {
                Some(reason) => message.context.signal.failed(reason),
                None => message.context.signal.completed(),
            }
        }
    }

    struct Harness {
        entry: WorkerHandle,
        signal: WorkerSignal,
        capture: BatchCapture,
        stats: Arc<PublisherStats>,
    }

    fn harness(settings: Option<BatchSettings>, capture: BatchCapture) -> Harness {
        let signal = WorkerSignal::new();
        let downstream_signal = WorkerSignal::new();
        let stats = Arc::new(PublisherStats::new());
        let (worker, downstream) = MessageWorker::new("out", 16, capture.clone());
        worker.start(&downstream_signal);
        let entry = BulkWorker::start(
            &signal,
            1000,
            settings,
            downstream,
            downstream_signal,
            Arc::clone(&stats),
        );
        Harness {
            entry,
            signal,
            capture,
            stats,
        }
    }

    fn event(id: usize) -> Event {
        Event::from_value(json!({ "id": id })).unwrap()
    }

    /// With the clock paused this only returns once every task is idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn test_settings_disabled_for_non_positive_values() {
        assert!(BatchSettings::from_config(0, 100).is_none());
        assert!(BatchSettings::from_config(-5, 100).is_none());
        assert!(BatchSettings::from_config(1000, 0).is_none());
        assert!(BatchSettings::from_config(1000, -1).is_none());
        assert_eq!(
            BatchSettings::from_config(1000, 50),
            Some(BatchSettings {
                flush_interval: Duration::from_secs(1),
                max_size: 50
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batches_then_interval_flush() {
        let settings = BatchSettings::new(Duration::from_secs(1), 1000);
        let h = harness(settings, BatchCapture::default());

        for id in 0..2500 {
            h.entry
                .send(Message::single(Context::detached(), event(id)))
                .await
                .unwrap();
        }
        settle().await;
        assert_eq!(*h.capture.sizes.lock().unwrap(), vec![1000, 1000]);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        settle().await;
        assert_eq!(*h.capture.sizes.lock().unwrap(), vec![1000, 1000, 500]);

        h.signal.stop().await;
        assert_eq!(h.stats.snapshot().batches_flushed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_batching_passes_messages_through() {
        let h = harness(None, BatchCapture::default());
        assert_eq!(h.entry.name(), "out");

        for id in 0..25 {
            h.entry
                .send(Message::single(Context::detached(), event(id)))
                .await
                .unwrap();
        }
        h.signal.stop().await;

        let sizes = h.capture.sizes.lock().unwrap().clone();
        assert_eq!(sizes.len(), 25);
        assert!(sizes.iter().all(|size| *size == 1));
        assert_eq!(h.capture.singles.load(Ordering::SeqCst), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_partial_batch() {
        let settings = BatchSettings::new(Duration::from_secs(3600), 100);
        let h = harness(settings, BatchCapture::default());

        let (signal, rx) = CompletionSignal::new();
        h.entry
            .send(Message::batch(
                Context::new(signal),
                (0..10).map(event).collect(),
            ))
            .await
            .unwrap();
        h.signal.stop().await;

        assert_eq!(*h.capture.sizes.lock().unwrap(), vec![10]);
        assert_eq!(rx.wait().await, Outcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_straddling_message_resolves_after_last_chunk() {
        let settings = BatchSettings::new(Duration::from_secs(1), 4);
        let h = harness(settings, BatchCapture::default());

        let (signal, mut rx) = CompletionSignal::new();
        h.entry
            .send(Message::batch(
                Context::new(signal),
                (0..10).map(event).collect(),
            ))
            .await
            .unwrap();
        settle().await;
        assert_eq!(*h.capture.sizes.lock().unwrap(), vec![4, 4]);
        assert_eq!(rx.try_outcome(), None);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        settle().await;
        assert_eq!(*h.capture.sizes.lock().unwrap(), vec![4, 4, 2]);
        assert_eq!(rx.try_outcome(), Some(Outcome::Completed));

        h.signal.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_change_flushes_pending_batch() {
        let settings = BatchSettings::new(Duration::from_secs(3600), 100);
        let h = harness(settings, BatchCapture::default());

        for (index, index_name) in ["logs-a", "logs-a", "logs-b"].iter().enumerate() {
            h.entry
                .send(Message::single(
                    Context::detached().with_metadata("index", *index_name),
                    event(index),
                ))
                .await
                .unwrap();
        }
        h.signal.stop().await;

        assert_eq!(*h.capture.sizes.lock().unwrap(), vec![2, 1]);
        let metadata = h.capture.metadata.lock().unwrap().clone();
        assert_eq!(metadata[0].get("index").map(String::as_str), Some("logs-a"));
        assert_eq!(metadata[1].get("index").map(String::as_str), Some("logs-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_failure_fails_every_contributor() {
        let capture = BatchCapture {
            fail_with: Some("bulk rejected"),
            ..Default::default()
        };
        let settings = BatchSettings::new(Duration::from_secs(3600), 3);
        let h = harness(settings, capture);

        let mut receivers = Vec::new();
        for id in 0..3 {
            let (signal, rx) = CompletionSignal::new();
            receivers.push(rx);
            h.entry
                .send(Message::single(Context::new(signal), event(id)))
                .await
                .unwrap();
        }
        for rx in receivers {
            assert_eq!(rx.wait().await, Outcome::Failed("bulk rejected".into()));
        }
        h.signal.stop().await;
    }
}
