// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded-concurrency executor for fan-out I/O tasks.
//!
//! A pool runs exactly `limit` persistent workers pulling from one shared work
//! queue. [`WorkerPool::submit`] never waits for a worker: the hand-off into
//! the queue runs as its own tracked task, so callers are not blocked even
//! when every worker is busy.
//!
//! Shutdown is two-phase:
//!
//! 1. admission closes and in-flight hand-offs finish while the workers keep
//!    pulling from the still open queue;
//! 2. the work queue closes and the workers drain whatever it still holds.
//!
//! Every accepted task therefore runs to completion on a plain `stop`.
//! Running phase 2 only after every hand-off finished means no hand-off can
//! race a closed queue.
//!
//! Cancelling the parent token passed to [`WorkerPool::with_cancellation`]
//! forces shutdown instead: hand-offs still waiting for a worker are
//! abandoned and each is recorded as [`TaskError::DroppedOnShutdown`].

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::errors::{AggregatedError, ConfigurationError, PoolError, TaskError};

type BoxedTask = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

pub struct WorkerPool {
    limit: usize,
    admission: Mutex<Option<mpsc::Sender<BoxedTask>>>,
    closing: CancellationToken,
    task_token: CancellationToken,
    handoffs: TaskTracker,
    workers: Mutex<Vec<JoinHandle<()>>>,
    errors: Arc<ErrorLog>,
}

impl WorkerPool {
    /// Starts `limit` workers keeping the last `max_errors` task failures.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(limit: usize, max_errors: usize) -> Result<Self, ConfigurationError> {
        Self::with_cancellation(limit, max_errors, CancellationToken::new())
    }

    /// Like [`WorkerPool::new`], tied to a parent cancellation token.
    ///
    /// Cancelling `parent` closes admission and abandons hand-offs that have
    /// not reached a worker yet. Running tasks observe it through the token
    /// they receive.
    ///
    /// # Arguments
    ///
    /// * `limit` - Number of persistent workers, must be greater than 0
    /// * `max_errors` - How many of the most recent task failures are retained
    /// * `parent` - Token forcing shutdown when cancelled
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidPoolLimit`] when `limit` is 0.
    pub fn with_cancellation(
        limit: usize,
        max_errors: usize,
        parent: CancellationToken,
    ) -> Result<Self, ConfigurationError> {
        if limit == 0 {
            return Err(ConfigurationError::InvalidPoolLimit(limit));
        }

        let (tx, rx) = mpsc::channel::<BoxedTask>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let errors = Arc::new(ErrorLog::new(max_errors));

        let workers = (0..limit)
            .map(|worker_id| {
                tokio::spawn(run_worker(worker_id, Arc::clone(&rx), Arc::clone(&errors)))
            })
            .collect();

        debug!(limit, max_errors, "worker pool started");

        Ok(Self {
            limit,
            admission: Mutex::new(Some(tx)),
            closing: parent.child_token(),
            task_token: parent,
            handoffs: TaskTracker::new(),
            workers: Mutex::new(workers),
            errors,
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Queues `task` for execution without blocking the caller.
    ///
    /// Task failures are not reported here; they are aggregated and surfaced
    /// by [`WorkerPool::stop`].
    ///
    /// # Arguments
    ///
    /// * `task` - Builds the task future from the pool's cancellation token
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] once `stop` was called or the parent
    /// token was cancelled.
    pub fn submit<F, Fut>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = admission.as_ref() else {
            return Err(PoolError::Closed);
        };
        if self.closing.is_cancelled() {
            return Err(PoolError::Closed);
        }

        let tx = tx.clone();
        let closing = self.closing.clone();
        let errors = Arc::clone(&self.errors);
        let task: BoxedTask = Box::pin(task(self.task_token.clone()));

        // Spawned while admission is held so `stop` cannot close the tracker
        // between the check above and this hand-off being tracked.
        self.handoffs.spawn(async move {
            tokio::select! {
                biased;
                sent = tx.send(task) => {
                    if sent.is_err() {
                        errors.record(TaskError::DroppedOnShutdown.into());
                    }
                }
                _ = closing.cancelled() => {
                    errors.record(TaskError::DroppedOnShutdown.into());
                }
            }
        });
        Ok(())
    }

    /// Stops the pool and waits for every accepted task to finish.
    ///
    /// New submissions are rejected from the moment this is called, but
    /// everything already accepted still runs.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If no task failed since the pool started
    /// * `Err(PoolError::Aggregated)` - The total failure count and the most
    ///   recent failures, including hand-offs abandoned by a forced shutdown
    pub async fn stop(&self) -> Result<(), PoolError> {
        // Phase 1: close admission and let in-flight hand-offs land while the
        // workers keep draining the queue.
        let sender = self
            .admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.handoffs.close();
        self.handoffs.wait().await;

        // Phase 2: close the queue and let the workers drain it.
        drop(sender);
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in workers {
            if let Err(err) = handle.await {
                self.errors
                    .record(anyhow::anyhow!("worker task failed to join: {err}"));
            }
        }

        debug!(limit = self.limit, "worker pool stopped");
        match self.errors.drain() {
            Some(aggregated) => Err(PoolError::Aggregated(aggregated)),
            None => Ok(()),
        }
    }
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BoxedTask>>>,
    errors: Arc<ErrorLog>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };

        match AssertUnwindSafe(task).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(worker = worker_id, error = %err, "pool task failed");
                errors.record(err);
            }
            Err(panic_payload) => {
                let panic_msg = panic_message(panic_payload.as_ref());
                warn!(worker = worker_id, panic = %panic_msg, "pool task panicked");
                errors.record(TaskError::Panicked(panic_msg).into());
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Fixed-capacity ring of the most recent errors; the oldest is overwritten
/// first.
#[derive(Debug)]
pub(crate) struct ErrorRing<T> {
    capacity: usize,
    entries: VecDeque<T>,
    total: usize,
}

impl<T> ErrorRing<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            total: 0,
        }
    }

    pub(crate) fn push(&mut self, entry: T) {
        self.total += 1;
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }

    pub(crate) fn take(&mut self) -> (usize, Vec<T>) {
        let total = std::mem::take(&mut self.total);
        (total, self.entries.drain(..).collect())
    }
}

struct ErrorLog {
    ring: Mutex<ErrorRing<anyhow::Error>>,
}

impl ErrorLog {
    fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(ErrorRing::new(capacity)),
        }
    }

    fn record(&self, err: anyhow::Error) {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err);
    }

    fn drain(&self) -> Option<AggregatedError> {
        let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        if ring.total() == 0 {
            return None;
        }
        let (total, errors) = ring.take();
        Some(AggregatedError::new(total, errors))
    }
}
