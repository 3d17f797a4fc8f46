// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Terminal stage of a pipeline: hands payloads to the output's
//! [`ConnectionMode`] and resolves each message signal with the result.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::event::Message;
use crate::mode::ConnectionMode;
use crate::stats::PublisherStats;
use crate::worker::{MessageHandler, MessageWorker, WorkerHandle, WorkerSignal};

pub struct OutputHandler {
    name: Arc<str>,
    mode: ConnectionMode,
    stats: Arc<PublisherStats>,
}

impl OutputHandler {
    pub fn new(name: impl Into<Arc<str>>, mode: ConnectionMode, stats: Arc<PublisherStats>) -> Self {
        Self {
            name: name.into(),
            mode,
            stats,
        }
    }

    /// Runs the handler behind its own queue on `signal`.
    pub fn start(self, capacity: usize, signal: &WorkerSignal) -> WorkerHandle {
        let (worker, handle) = MessageWorker::new(Arc::clone(&self.name), capacity, self);
        worker.start(signal);
        handle
    }
}

#[async_trait]
impl MessageHandler for OutputHandler {
    async fn on_message(&mut self, message: Message) {
        let Message { context, payload } = message;
        let count = payload.len();

        match self.mode.publish(payload).await {
            Ok(()) => context.signal.completed(),
            Err(err) => {
                let failed = err.unconsumed.len();
                self.stats.record_failed(failed);
                error!(
                    output = %self.name,
                    count,
                    failed,
                    error = %err.source,
                    "dropping events after retries were exhausted"
                );
                context.signal.failed(err.to_string());
            }
        }
    }

    async fn on_stop(&mut self) {
        if let Err(err) = self.mode.close().await {
            warn!(output = %self.name, error = %err, "error while closing output clients");
        }
        debug!(output = %self.name, "output closed");
    }
}
