// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-facing entry point and fan-out to the output pipelines.
//!
//! The publisher runs its own [`MessageWorker`]. Every accepted message is
//! handed to each output pipeline; with more than one pipeline the producer's
//! signal is split so that it resolves once every output reported back.
//!
//! Shutdown runs top down. Stopping the publisher drains its queue, then stops
//! the signal shared by all pipeline entry stages, each of which flushes and
//! stops its own output worker.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bulk::BulkWorker;
use crate::client::ProtocolClient;
use crate::config::{OutputConfig, PublisherConfig};
use crate::errors::ConfigurationError;
use crate::event::{Context, Event, Message};
use crate::mode::{close_all, make_clients, ConnectionMode};
use crate::output::OutputHandler;
use crate::registry::OutputRegistry;
use crate::signal::SplitPolicy;
use crate::stats::{PublisherStats, StatsSnapshot};
use crate::worker::{MessageHandler, MessageWorker, WorkerHandle, WorkerSignal};

struct FanOut {
    pipelines: Vec<WorkerHandle>,
    outputs: WorkerSignal,
    split_policy: SplitPolicy,
    stats: Arc<PublisherStats>,
}

#[async_trait]
impl MessageHandler for FanOut {
    async fn on_message(&mut self, message: Message) {
        let Message { context, payload } = message;
        let Context { signal, metadata } = context;

        if self.pipelines.is_empty() {
            self.stats.record_dropped(payload.len());
            warn!(count = payload.len(), "no outputs configured, dropping events");
            signal.dropped();
            return;
        }

        let signals = signal.split(self.pipelines.len(), self.split_policy);
        for (pipeline, signal) in self.pipelines.iter().zip(signals) {
            let context = Context {
                signal,
                metadata: metadata.clone(),
            };
            let count = payload.len();
            if let Err(err) = pipeline
                .send(Message::new(context, payload.clone()))
                .await
            {
                self.stats.record_dropped(count);
                warn!(pipeline = %pipeline.name(), count, error = %err, "output pipeline rejected message");
            }
        }
    }

    async fn on_stop(&mut self) {
        debug!(pipelines = self.pipelines.len(), "stopping output pipelines");
        self.outputs.stop().await;
    }
}

pub struct AsyncPublisher {
    handle: WorkerHandle,
    signal: WorkerSignal,
    stats: Arc<PublisherStats>,
}

impl AsyncPublisher {
    /// Starts a publisher over already running pipelines.
    ///
    /// `outputs` must be the signal the pipelines' entry stages run on; it is
    /// stopped once the publisher has drained its own queue.
    pub fn new(
        pipelines: Vec<WorkerHandle>,
        outputs: WorkerSignal,
        split_policy: SplitPolicy,
        capacity: usize,
        stats: Arc<PublisherStats>,
    ) -> Self {
        let handler = FanOut {
            pipelines,
            outputs,
            split_policy,
            stats: Arc::clone(&stats),
        };
        let signal = WorkerSignal::new();
        let (worker, handle) = MessageWorker::new("publisher", capacity, handler);
        worker.start(&signal);
        Self {
            handle,
            signal,
            stats,
        }
    }

    /// Queues one event for every configured output.
    ///
    /// # Arguments
    ///
    /// * `context` - Carries the signal resolved once all outputs reported
    ///   back, plus routing metadata
    /// * `event` - The event to publish
    ///
    /// # Returns
    ///
    /// * `true` - The event was accepted; waits while the queue is full
    /// * `false` - The publisher is stopped and the signal resolved `Dropped`
    pub async fn publish_event(&self, context: Context, event: Event) -> bool {
        self.publish(Message::single(context, event)).await
    }

    /// Queues an ordered batch; see [`AsyncPublisher::publish_event`].
    pub async fn publish_events(&self, context: Context, events: Vec<Event>) -> bool {
        self.publish(Message::batch(context, events)).await
    }

    async fn publish(&self, message: Message) -> bool {
        let count = message.payload.len();
        match self.handle.send(message).await {
            Ok(()) => true,
            Err(err) => {
                self.stats.record_dropped(count);
                debug!(count, error = %err, "publish rejected");
                false
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }

    /// Stops accepting messages and returns once every accepted message has
    /// been flushed through its outputs and all clients are closed.
    pub async fn stop(&self) {
        self.signal.stop().await;
        debug!(stats = ?self.stats.snapshot(), "publisher stopped");
    }
}

/// Resolves a [`PublisherConfig`] against an [`OutputRegistry`] and starts
/// the resulting pipelines.
pub struct PublisherBuilder<'a> {
    registry: &'a OutputRegistry,
    config: PublisherConfig,
    stats: Arc<PublisherStats>,
}

impl<'a> PublisherBuilder<'a> {
    pub fn new(registry: &'a OutputRegistry, config: PublisherConfig) -> Self {
        Self {
            registry,
            config,
            stats: Arc::new(PublisherStats::new()),
        }
    }

    /// Shares `stats` with the caller instead of a fresh set of counters.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<PublisherStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Builds the clients of every output before anything starts, then starts
    /// one pipeline per output and the publisher in front of them.
    ///
    /// Outputs are resolved in name order. Startup is all or nothing: if one
    /// output fails, every client built so far is closed.
    ///
    /// # Errors
    ///
    /// * [`ConfigurationError::InvalidSetting`] or
    ///   [`ConfigurationError::NoHostsConfigured`] - Invalid configuration
    /// * [`ConfigurationError::UnknownOutput`] - An output type is not registered
    /// * [`ConfigurationError::ClientConstruction`] - A factory failed for a host
    pub async fn build(self) -> Result<AsyncPublisher, ConfigurationError> {
        let Self {
            registry,
            config,
            stats,
        } = self;
        config.validate()?;

        let mut resolved: Vec<ResolvedOutput<'_>> = Vec::with_capacity(config.outputs.len());
        for (name, output) in &config.outputs {
            let clients = match registry.get(&output.output_type) {
                Ok(factory) => make_clients(output, factory.as_ref()).await,
                Err(err) => Err(err),
            };
            match clients {
                Ok(clients) => resolved.push((name.as_str(), output, clients)),
                Err(err) => {
                    warn!(output = %name, error = %err, "failed to build output, aborting startup");
                    for (_, _, mut clients) in resolved {
                        close_all(&mut clients).await;
                    }
                    return Err(err);
                }
            }
        }

        let outputs = WorkerSignal::new();
        let pipelines = start_pipelines(resolved, &outputs, &stats).await?;

        Ok(AsyncPublisher::new(
            pipelines,
            outputs,
            config.split_policy,
            config.queue_size,
            stats,
        ))
    }
}

type ResolvedOutput<'a> = (&'a str, &'a OutputConfig, Vec<Box<dyn ProtocolClient>>);

/// Starts one pipeline per resolved output with its entry stage on `outputs`.
///
/// On failure the pipelines already running are stopped, which closes their
/// clients, and the clients of outputs not started yet are closed as well.
async fn start_pipelines(
    resolved: Vec<ResolvedOutput<'_>>,
    outputs: &WorkerSignal,
    stats: &Arc<PublisherStats>,
) -> Result<Vec<WorkerHandle>, ConfigurationError> {
    let mut pipelines = Vec::with_capacity(resolved.len());
    let mut pending = resolved.into_iter();

    while let Some((name, output, clients)) = pending.next() {
        let mode = match ConnectionMode::new(
            clients,
            output.routing,
            output.mode_settings(),
            Arc::clone(stats),
        ) {
            Ok(mode) => mode,
            Err(err) => {
                warn!(output = %name, error = %err, "failed to start output, aborting startup");
                for (_, _, mut clients) in pending {
                    close_all(&mut clients).await;
                }
                outputs.stop().await;
                return Err(err);
            }
        };

        let output_signal = WorkerSignal::new();
        let handle = OutputHandler::new(name, mode, Arc::clone(stats))
            .start(output.queue_size, &output_signal);
        let handle = BulkWorker::start(
            outputs,
            output.queue_size,
            output.batching(),
            handle,
            output_signal,
            Arc::clone(stats),
        );
        debug!(
            output = %name,
            output_type = %output.output_type,
            routing = ?output.routing,
            batching = output.batching().is_some(),
            "output pipeline started"
        );
        pipelines.push(handle);
    }
    Ok(pipelines)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use crate::signal::{CompletionSignal, Outcome};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Sink {
        fail: bool,
        received: Arc<Mutex<Vec<Payload>>>,
    }

    #[async_trait]
    impl MessageHandler for Sink {
        async fn on_message(&mut self, message: Message) {
            self.received.lock().unwrap().push(message.payload);
            if self.fail {
                message.context.signal.failed("sink refused");
            } else {
                message.context.signal.completed();
            }
        }
    }

    fn publisher(sinks: &[Sink], policy: SplitPolicy) -> AsyncPublisher {
        let outputs = WorkerSignal::new();
        let pipelines = sinks
            .iter()
            .enumerate()
            .map(|(i, sink)| {
                let (worker, handle) = MessageWorker::new(format!("sink-{i}"), 16, sink.clone());
                worker.start(&outputs);
                handle
            })
            .collect();
        AsyncPublisher::new(pipelines, outputs, policy, 16, Arc::new(PublisherStats::new()))
    }

    fn event(id: i64) -> Event {
        Event::from_value(json!({ "id": id })).unwrap()
    }

    #[tokio::test]
    async fn test_one_failed_output_fails_the_producer() {
        let sinks = [
            Sink::default(),
            Sink {
                fail: true,
                ..Default::default()
            },
            Sink::default(),
        ];
        let publisher = publisher(&sinks, SplitPolicy::FailIfAnyFails);

        let (signal, rx) = CompletionSignal::new();
        assert!(publisher.publish_event(Context::new(signal), event(1)).await);
        assert!(matches!(rx.wait().await, Outcome::Failed(reason) if reason == "sink refused"));

        publisher.stop().await;
        for sink in &sinks {
            assert_eq!(sink.received.lock().unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_any_success_policy() {
        let sinks = [
            Sink {
                fail: true,
                ..Default::default()
            },
            Sink::default(),
        ];
        let publisher = publisher(&sinks, SplitPolicy::SucceedIfAnySucceeds);

        let (signal, rx) = CompletionSignal::new();
        assert!(publisher.publish_events(Context::new(signal), vec![event(1), event(2)]).await);
        assert_eq!(rx.wait().await, Outcome::Completed);
        publisher.stop().await;
    }

    #[tokio::test]
    async fn test_outputs_share_event_storage() {
        let sinks = [Sink::default(), Sink::default()];
        let publisher = publisher(&sinks, SplitPolicy::default());

        assert!(publisher.publish_events(Context::detached(), vec![event(1), event(2)]).await);
        publisher.stop().await;

        let first = sinks[0].received.lock().unwrap()[0].clone();
        let second = sinks[1].received.lock().unwrap()[0].clone();
        assert_eq!(first, second);
        assert!(first
            .events()
            .iter()
            .zip(second.events())
            .all(|(a, b)| a.ptr_eq(b)));
    }

    #[tokio::test]
    async fn test_stop_delivers_everything_accepted() {
        let sinks = [Sink::default(), Sink::default()];
        let publisher = publisher(&sinks, SplitPolicy::default());

        for id in 0..200 {
            assert!(publisher.publish_event(Context::detached(), event(id)).await);
        }
        publisher.stop().await;

        for sink in &sinks {
            let ids: Vec<i64> = sink
                .received
                .lock()
                .unwrap()
                .iter()
                .flat_map(|p| p.events().iter().map(|e| e.get("id").unwrap().as_i64().unwrap()))
                .collect();
            assert_eq!(ids, (0..200).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_publish_after_stop_is_rejected() {
        let publisher = publisher(&[Sink::default()], SplitPolicy::default());
        publisher.stop().await;
        assert!(publisher.is_stopped());

        let (signal, rx) = CompletionSignal::new();
        assert!(!publisher.publish_event(Context::new(signal), event(1)).await);
        assert_eq!(rx.wait().await, Outcome::Dropped);
        assert_eq!(publisher.stats().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_failed_pipeline_start_closes_every_client() {
        use crate::mode::testing::{ScriptedClient, Shared};

        let shared = Arc::new(Shared::default());
        let config = OutputConfig::default();
        let resolved: Vec<ResolvedOutput<'_>> = vec![
            ("first", &config, vec![ScriptedClient::new(0, &shared).boxed()]),
            ("broken", &config, Vec::new()),
            ("last", &config, vec![ScriptedClient::new(2, &shared).boxed()]),
        ];
        let outputs = WorkerSignal::new();
        let stats = Arc::new(PublisherStats::new());

        let result = start_pipelines(resolved, &outputs, &stats).await;

        assert!(matches!(result, Err(ConfigurationError::NoHostsConfigured)));
        assert!(outputs.is_stopped());
        let mut closed = shared.closes.lock().unwrap().clone();
        closed.sort_unstable();
        assert_eq!(closed, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_without_outputs_events_are_dropped() {
        let publisher = publisher(&[], SplitPolicy::default());
        let (signal, rx) = CompletionSignal::new();
        assert!(publisher.publish_event(Context::new(signal), event(1)).await);
        assert_eq!(rx.wait().await, Outcome::Dropped);
        publisher.stop().await;
        assert_eq!(publisher.stats().events_dropped, 1);
    }
}
