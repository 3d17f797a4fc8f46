// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

use super::ModeCore;
use crate::errors::{ConnectionError, PartialSendError};
use crate::event::Payload;

/// Sends everything to one active client and moves to the next one on failure.
///
/// The active client is sticky: after a switch the mode stays on the new
/// client until that one fails too. A client is connected on demand the first
/// time it becomes active. Once it has failed it is handed to a background
/// reconnect, and publishes skip it (counting an attempt) until that
/// reconnect succeeds.
pub struct FailoverMode {
    pub(super) core: ModeCore,
    active: AtomicUsize,
}

impl FailoverMode {
    pub(super) fn new(core: ModeCore) -> Self {
        Self {
            core,
            active: AtomicUsize::new(0),
        }
    }

    /// Index of the client currently receiving traffic.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Moves off `failed` unless a concurrent publish already did.
    fn fail_over(&self, failed: usize) -> usize {
        let next = (failed + 1) % self.core.slots.len();
        match self
            .active
            .compare_exchange(failed, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => next,
            Err(current) => current,
        }
    }

    pub(super) async fn publish(&self, mut payload: Payload) -> Result<(), PartialSendError> {
        let core = &self.core;
        let total = payload.len();
        if total == 0 {
            return Ok(());
        }

        let mut failures = 0usize;
        loop {
            if core.closed.is_cancelled() {
                core.stats.record_published(total - payload.len());
                return Err(core.closed_error(payload));
            }

            let slot = &core.slots[self.active()];
            let outcome = if slot.is_reconnecting() {
                Err((payload, ConnectionError::NotConnected))
            } else {
                let mut client = slot.lock().await;
                match slot.ensure_connected(&mut client, core.settings.timeout).await {
                    Ok(()) => slot.transmit(&mut client, payload).await,
                    Err(err) => Err((payload, err)),
                }
            };

            let err = match outcome {
                Ok(()) => {
                    core.stats.record_published(total);
                    return Ok(());
                }
                Err((rest, err)) => {
                    payload = rest;
                    core.spawn_reconnect(slot.index());
                    err
                }
            };

            failures += 1;
            let next = self.fail_over(slot.index());
            warn!(
                client = slot.index(),
                next,
                remaining = payload.len(),
                error = %err,
                "publish failed, failing over"
            );

            if !core.settings.may_retry(failures) {
                core.stats.record_published(total - payload.len());
                return Err(PartialSendError::new(payload.into_events(), err));
            }
            core.stats.record_retry();

            // Back off only once every client has been tried in this round.
            let clients = core.slots.len();
            if failures % clients == 0 {
                let round = failures / clients;
                debug!(round, "all clients failed, backing off");
                if !core.backoff(round).await {
                    core.stats.record_published(total - payload.len());
                    return Err(core.closed_error(payload));
                }
            }
        }
    }
}
