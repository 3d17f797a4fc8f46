// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker lifecycle and the inbound message loop.
//!
//! A [`WorkerSignal`] is shared by a group of workers: stopping it broadcasts
//! shutdown to every worker started on it and waits until all of them exit.
//!
//! A [`MessageWorker`] owns a bounded queue and one processing loop. Each
//! message goes through the preprocessing chain and then to the worker's
//! [`MessageHandler`]. On shutdown the queue is closed, whatever it still
//! holds is processed, and finally [`MessageHandler::on_stop`] runs so the
//! handler can flush state and stop its own children.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::errors::PublishError;
use crate::event::{Message, Payload};

/// Default capacity of a worker's inbound queue.
pub const DEFAULT_QUEUE_SIZE: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct WorkerSignal {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when [`WorkerSignal::stop`] begins.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Runs `task` as a worker of this signal.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Broadcasts shutdown and waits for every worker to acknowledge by exiting.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// The stage a [`MessageWorker`] hands its messages to.
#[async_trait]
pub trait MessageHandler: Send + 'static {
    async fn on_message(&mut self, message: Message);

    /// Runs once, after the queue has been drained.
    async fn on_stop(&mut self) {}
}

/// A step of the preprocessing chain. Returning `None` filters the message
/// out; its signal then resolves as completed.
pub trait Preprocessor: Send + Sync {
    fn process(&self, payload: Payload) -> Option<Payload>;
}

impl<F> Preprocessor for F
where
    F: Fn(Payload) -> Option<Payload> + Send + Sync,
{
    fn process(&self, payload: Payload) -> Option<Payload> {
        self(payload)
    }
}

/// Sending side of a worker's queue.
#[derive(Clone)]
pub struct WorkerHandle {
    name: Arc<str>,
    tx: mpsc::Sender<Message>,
}

impl WorkerHandle {
    pub(crate) fn from_parts(name: Arc<str>, tx: mpsc::Sender<Message>) -> Self {
        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a message, waiting for room when the queue is full.
    ///
    /// Waiting here is how backpressure reaches producers: a slow stage
    /// fills its queue and every sender upstream of it slows down with it.
    ///
    /// # Arguments
    ///
    /// * `message` - The message to hand to the worker
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::QueueClosed`] once the worker stopped
    /// accepting messages. The message is dropped and its signal resolves
    /// as `Dropped`.
    pub async fn send(&self, message: Message) -> Result<(), PublishError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| PublishError::QueueClosed(self.name.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

pub struct MessageWorker<H> {
    name: Arc<str>,
    rx: mpsc::Receiver<Message>,
    handler: H,
    preprocessors: Vec<Box<dyn Preprocessor>>,
}

impl<H: MessageHandler> MessageWorker<H> {
    /// Creates a worker and the handle producers send to. Nothing runs until
    /// [`MessageWorker::start`] is called.
    ///
    /// # Arguments
    ///
    /// * `name` - Shown in logs and in [`PublishError::QueueClosed`]
    /// * `capacity` - Bound of the inbound queue, at least 1
    /// * `handler` - Stage receiving every message that passes preprocessing
    pub fn new(name: impl Into<Arc<str>>, capacity: usize, handler: H) -> (Self, WorkerHandle) {
        let name = name.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = Self {
            name: Arc::clone(&name),
            rx,
            handler,
            preprocessors: Vec::new(),
        };
        (worker, WorkerHandle { name, tx })
    }

    #[must_use]
    pub fn with_preprocessor(mut self, preprocessor: impl Preprocessor + 'static) -> Self {
        self.preprocessors.push(Box::new(preprocessor));
        self
    }

    /// Starts the processing loop as a worker of `signal`.
    pub fn start(self, signal: &WorkerSignal) -> JoinHandle<()> {
        let shutdown = signal.token();
        signal.spawn(self.run(shutdown))
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!(worker = %self.name, "message worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => self.process(message).await,
                    None => break,
                },
            }
        }

        self.rx.close();
        let mut drained = 0usize;
        while let Some(message) = self.rx.recv().await {
            self.process(message).await;
            drained += 1;
        }
        if drained > 0 {
            debug!(worker = %self.name, drained, "drained queue on shutdown");
        }

        self.handler.on_stop().await;
        debug!(worker = %self.name, "message worker stopped");
    }

    async fn process(&mut self, message: Message) {
        let Message {
            context,
            mut payload,
        } = message;

        for preprocessor in &self.preprocessors {
            match preprocessor.process(payload) {
                Some(next) => payload = next,
                None => {
                    trace!(worker = %self.name, "message filtered by preprocessor");
                    context.signal.completed();
                    return;
                }
            }
        }

        self.handler.on_message(Message::new(context, payload)).await;
    }
}
