// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::slot::{ClientGuard, ClientSlot};
use super::ModeCore;
use crate::errors::{ConnectionError, PartialSendError};
use crate::event::Payload;

enum Wait {
    Connected,
    TimedOut,
    Closed,
}

/// Rotates payloads over the clients that are currently connected.
///
/// A client that fails is taken out of the rotation and reconnected by a
/// background task; publishes keep flowing to the healthy clients meanwhile.
pub struct LoadBalanceMode {
    pub(super) core: ModeCore,
    cursor: AtomicUsize,
}

impl LoadBalanceMode {
    pub(super) fn new(core: ModeCore) -> Self {
        Self {
            core,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Picks the next connected client, preferring idle ones.
    async fn acquire(&self) -> Option<(&Arc<ClientSlot>, ClientGuard<'_>)> {
        let slots = &self.core.slots;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % slots.len();
        let rotation = move || (0..slots.len()).map(move |i| &slots[(start + i) % slots.len()]);

        for slot in rotation().filter(|slot| slot.is_connected()) {
            if let Some(client) = slot.try_lock() {
                if client.is_connected() {
                    return Some((slot, client));
                }
            }
        }
        for slot in rotation().filter(|slot| slot.is_connected()) {
            let client = slot.lock().await;
            if client.is_connected() {
                return Some((slot, client));
            }
        }
        None
    }

    /// Starts reconnects for every disconnected client and waits until one
    /// of them comes up.
    async fn wait_for_connection(&self) -> Wait {
        let core = &self.core;
        let notified = core.connected.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        for slot in &core.slots {
            if !slot.is_connected() {
                core.spawn_reconnect(slot.index());
            }
        }
        if core.slots.iter().any(|slot| slot.is_connected()) {
            return Wait::Connected;
        }

        let timeout = core.settings.timeout;
        tokio::select! {
            _ = core.closed.cancelled() => Wait::Closed,
            _ = &mut notified => Wait::Connected,
            _ = tokio::time::sleep(timeout), if !timeout.is_zero() => Wait::TimedOut,
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

            let err = match self.acquire().await {
                Some((slot, mut client)) => {
                    let result = slot.transmit(&mut client, payload).await;
                    drop(client);
                    match result {
                        Ok(()) => {
                            core.stats.record_published(total);
                            return Ok(());
                        }
                        Err((rest, err)) => {
                            payload = rest;
                            warn!(
                                client = slot.index(),
                                remaining = payload.len(),
                                error = %err,
                                "publish failed, client leaves rotation"
                            );
                            core.spawn_reconnect(slot.index());
                            err
                        }
                    }
                }
                None => match self.wait_for_connection().await {
                    Wait::Connected => continue,
                    Wait::Closed => continue,
                    Wait::TimedOut => {
                        debug!(timeout = ?core.settings.timeout, "no client connected in time");
                        ConnectionError::NotConnected
                    }
                },
            };

            failures += 1;
            if !core.settings.may_retry(failures) {
                core.stats.record_published(total - payload.len());
                return Err(PartialSendError::new(payload.into_events(), err));
            }
            core.stats.record_retry();
        }
    }
}
