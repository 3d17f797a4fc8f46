// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery counters shared by every stage of a publisher.
//!
//! Event loss is only possible when retries are exhausted or the pipeline is
//! stopped with undelivered events in flight; both paths bump a counter here.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PublisherStats {
    events_published: AtomicU64,
    events_failed: AtomicU64,
    events_dropped: AtomicU64,
    batches_flushed: AtomicU64,
    publish_retries: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_published: u64,
    pub events_failed: u64,
    pub events_dropped: u64,
    pub batches_flushed: u64,
    pub publish_retries: u64,
    pub reconnects: u64,
}

impl PublisherStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self, events: usize) {
        self.events_published
            .fetch_add(events as u64, Ordering::Relaxed);
    }

    pub fn record_failed(&self, events: usize) {
        self.events_failed.fetch_add(events as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, events: usize) {
        self.events_dropped.fetch_add(events as u64, Ordering::Relaxed);
    }

    pub fn record_batch_flushed(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
