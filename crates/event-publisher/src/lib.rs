// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event publishing core for data-shipping agents.
//!
//! The crate sits between event producers (file tailers, metric pollers, packet
//! decoders) and network output backends. It batches events, fans them out to
//! every configured output, and routes each batch over a set of unreliable
//! connections using failover or load-balancing.
//!
//! ```text
//!   producer
//!      │ publish_event / publish_events
//!      v
//!   AsyncPublisher ──(split signal)──┬──────────────┐
//!                                    v              v
//!                               BulkWorker      BulkWorker      (optional)
//!                                    │              │
//!                                    v              v
//!                              MessageWorker   MessageWorker    (output worker)
//!                                    │              │
//!                                    v              v
//!                             ConnectionMode  ConnectionMode
//!                                    │              │
//!                              ProtocolClient  ProtocolClient
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod bulk;
pub mod client;
pub mod config;
pub mod errors;
pub mod event;
pub mod logger;
pub mod mode;
pub mod output;
pub mod publisher;
pub mod registry;
pub mod signal;
pub mod stats;
pub mod worker;
pub mod worker_pool;

pub use bulk::{BatchSettings, BulkWorker};
pub use client::{ConnectionState, ProtocolClient};
pub use config::{OutputConfig, PublisherConfig, RoutingPolicy};
pub use errors::{
    AggregatedError, ConfigurationError, ConnectionError, PartialSendError, PoolError,
    PublishError, TaskError,
};
pub use event::{Context, Event, Message, Payload};
pub use mode::{make_clients, Backoff, ConnectionMode, ModeSettings};
pub use output::OutputHandler;
pub use publisher::{AsyncPublisher, PublisherBuilder};
pub use registry::{ClientFactory, OutputRegistry};
pub use signal::{CompletionSignal, Outcome, SignalReceiver, SplitPolicy};
pub use stats::{PublisherStats, StatsSnapshot};
pub use worker::{MessageWorker, WorkerHandle, WorkerSignal};
pub use worker_pool::WorkerPool;
