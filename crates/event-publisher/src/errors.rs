// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy of the publishing core.
//!
//! - [`ConfigurationError`]: fatal at construction, aborts pipeline startup.
//! - [`ConnectionError`]: transient I/O failure, handled by reconnect/failover.
//! - [`PartialSendError`]: part of a batch was not accepted; carries the
//!   unconsumed events back to the caller, which owns the retry.
//! - [`PoolError`]: rejected submissions and the aggregated task failures
//!   surfaced once by [`crate::worker_pool::WorkerPool::stop`].

use std::fmt;
use std::time::Duration;

use crate::event::Event;

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("no hosts configured")]
    NoHostsConfigured,

    #[error("worker pool limit must be greater than 0, got {0}")]
    InvalidPoolLimit(usize),

    #[error("invalid setting `{field}`: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("unknown output type '{0}'")]
    UnknownOutput(String),

    #[error("output type '{0}' is already registered")]
    DuplicateOutput(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to create client for host '{host}': {source}")]
    ClientConstruction {
        host: String,
        #[source]
        source: ConnectionError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("client is not connected")]
    NotConnected,

    #[error("connection mode is closed")]
    Closed,

    #[error("{0}")]
    Backend(String),
}

/// A publish attempt that did not deliver every event.
///
/// `unconsumed` holds exactly the events the client did not accept, in their
/// original order.
#[derive(Debug, thiserror::Error)]
#[error("{} event(s) not published: {source}", .unconsumed.len())]
pub struct PartialSendError {
    pub unconsumed: Vec<Event>,
    #[source]
    pub source: ConnectionError,
}

impl PartialSendError {
    pub fn new(unconsumed: Vec<Event>, source: ConnectionError) -> Self {
        Self { unconsumed, source }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task dropped: pool shut down before a worker accepted it")]
    DroppedOnShutdown,

    #[error("task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,

    #[error(transparent)]
    Aggregated(#[from] AggregatedError),
}

/// The most recent task failures recorded by a worker pool.
#[derive(Debug)]
pub struct AggregatedError {
    total: usize,
    errors: Vec<anyhow::Error>,
}

impl AggregatedError {
    pub(crate) fn new(total: usize, errors: Vec<anyhow::Error>) -> Self {
        Self { total, errors }
    }

    /// Number of failures observed over the pool lifetime.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Retained failures, oldest first.
    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }
}

impl fmt::Display for AggregatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} task(s) failed, {} retained",
            self.total,
            self.errors.len()
        )?;
        for (i, err) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{err:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregatedError {}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("worker '{0}' is no longer accepting messages")]
    QueueClosed(String),
}
