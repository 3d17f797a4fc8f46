// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Routing of payloads over a set of [`ProtocolClient`]s.
//!
//! [`ConnectionMode`] owns its clients from creation until [`ConnectionMode::close`].
//! Two policies exist:
//!
//! - failover: all traffic goes to one active client. When it fails the mode
//!   moves to the next client and stays there, while the failed client
//!   reconnects in the background before it can be used again.
//! - load balance: payloads rotate over the clients that are currently
//!   connected. A failed client reconnects in the background while healthy
//!   clients keep publishing.
//!
//! Both policies retry up to `max_retries` times with exponential backoff and
//! hand back exactly the events that were never accepted.

mod balance;
mod clients;
mod failover;
mod slot;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::client::{ConnectionState, ProtocolClient};
use crate::config::RoutingPolicy;
use crate::errors::{ConfigurationError, ConnectionError, PartialSendError};
use crate::event::{Event, Payload};
use crate::stats::PublisherStats;

pub use balance::LoadBalanceMode;
pub(crate) use clients::close_all;
pub use clients::make_clients;
pub use failover::FailoverMode;

use slot::ClientSlot;

/// Exponential backoff between retries, doubling from `init` up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub init: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.init.saturating_mul(1u32 << exponent).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSettings {
    /// Connect timeout. Zero waits indefinitely.
    pub timeout: Duration,
    /// Retries after the first attempt. `None` retries until success or close.
    pub max_retries: Option<usize>,
    pub backoff: Backoff,
}

impl ModeSettings {
    fn may_retry(&self, failed_attempts: usize) -> bool {
        self.max_retries
            .map_or(true, |retries| failed_attempts <= retries)
    }
}

impl Default for ModeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: Some(3),
            backoff: Backoff::default(),
        }
    }
}

/// State shared by both routing policies.
struct ModeCore {
    slots: Vec<Arc<ClientSlot>>,
    settings: ModeSettings,
    stats: Arc<PublisherStats>,
    closed: CancellationToken,
    reconnects: TaskTracker,
    connected: Arc<Notify>,
}

impl ModeCore {
    fn new(
        clients: Vec<Box<dyn ProtocolClient>>,
        settings: ModeSettings,
        stats: Arc<PublisherStats>,
    ) -> Result<Self, ConfigurationError> {
        if clients.is_empty() {
            return Err(ConfigurationError::NoHostsConfigured);
        }
        let slots = clients
            .into_iter()
            .enumerate()
            .map(|(index, client)| Arc::new(ClientSlot::new(index, client)))
            .collect();
        Ok(Self {
            slots,
            settings,
            stats,
            closed: CancellationToken::new(),
            reconnects: TaskTracker::new(),
            connected: Arc::new(Notify::new()),
        })
    }

    fn closed_error(&self, payload: Payload) -> PartialSendError {
        PartialSendError::new(payload.into_events(), ConnectionError::Closed)
    }

    /// Sleeps for the backoff of `attempt`. Returns `false` if the mode was
    /// closed while waiting.
    async fn backoff(&self, attempt: usize) -> bool {
        let delay = self.settings.backoff.delay(attempt);
        tokio::select! {
            _ = self.closed.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Reconnects slot `index` in a background task until it succeeds or the
    /// mode is closed. At most one such task runs per slot.
    fn spawn_reconnect(&self, index: usize) {
        let slot = Arc::clone(&self.slots[index]);
        if self.closed.is_cancelled() || !slot.begin_reconnect() {
            return;
        }

        let closed = self.closed.clone();
        let settings = self.settings;
        let stats = Arc::clone(&self.stats);
        let connected = Arc::clone(&self.connected);

        self.reconnects.spawn(async move {
            let mut attempt = 0usize;
            while !closed.is_cancelled() {
                let result = {
                    let mut client = slot.lock().await;
                    tokio::select! {
                        _ = closed.cancelled() => break,
                        result = slot.ensure_connected(&mut client, settings.timeout) => result,
                    }
                };
                match result {
                    Ok(()) => {
                        stats.record_reconnect();
                        connected.notify_waiters();
                        debug!(client = slot.index(), attempt, "background reconnect succeeded");
                        break;
                    }
                    Err(err) => {
                        attempt += 1;
                        warn!(client = slot.index(), attempt, error = %err, "background reconnect failed");
                        tokio::select! {
                            _ = closed.cancelled() => break,
                            _ = tokio::time::sleep(settings.backoff.delay(attempt)) => {}
                        }
                    }
                }
            }
            slot.end_reconnect();
        });
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.closed.cancel();
        self.reconnects.close();
        self.reconnects.wait().await;

        let mut first_error = None;
        for slot in &self.slots {
            if let Err(err) = slot.close().await {
                warn!(client = slot.index(), error = %err, "failed to close client");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn states(&self) -> Vec<ConnectionState> {
        self.slots.iter().map(|slot| slot.state()).collect()
    }
}

pub enum ConnectionMode {
    Failover(FailoverMode),
    LoadBalance(LoadBalanceMode),
}

impl ConnectionMode {
    /// Creates a mode over `clients`, taking ownership of them.
    ///
    /// No connection is opened here. Failover connects its active client on
    /// first publish; load balancing starts background connects on the first
    /// publish that finds no client connected.
    ///
    /// # Arguments
    ///
    /// * `clients` - Clients in routing order, as built by [`make_clients`]
    /// * `routing` - Failover or load balancing
    /// * `settings` - Connect timeout, retry bound and backoff
    /// * `stats` - Counters for published events, retries and reconnects
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::NoHostsConfigured`] if `clients` is empty.
    pub fn new(
        clients: Vec<Box<dyn ProtocolClient>>,
        routing: RoutingPolicy,
        settings: ModeSettings,
        stats: Arc<PublisherStats>,
    ) -> Result<Self, ConfigurationError> {
        let core = ModeCore::new(clients, settings, stats)?;
        Ok(match routing {
            RoutingPolicy::Failover => Self::Failover(FailoverMode::new(core)),
            RoutingPolicy::LoadBalance => Self::LoadBalance(LoadBalanceMode::new(core)),
        })
    }

    /// Delivers `payload`, retrying over the clients as the routing policy
    /// dictates.
    ///
    /// Events a client accepted before failing are never resent; only the
    /// unaccepted tail moves on to the next attempt, so order is preserved.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Every event was accepted by some client
    /// * `Err(PartialSendError)` - Retries were exhausted or the mode was
    ///   closed; `unconsumed` holds exactly the events never accepted
    pub async fn publish(&self, payload: Payload) -> Result<(), PartialSendError> {
        match self {
            Self::Failover(mode) => mode.publish(payload).await,
            Self::LoadBalance(mode) => mode.publish(payload).await,
        }
    }

    pub async fn publish_events(&self, events: Vec<Event>) -> Result<(), PartialSendError> {
        self.publish(Payload::Batch(events)).await
    }

    pub async fn publish_event(&self, event: Event) -> Result<(), PartialSendError> {
        self.publish(Payload::Single(event)).await
    }

    /// Stops background reconnects and closes every client. All clients are
    /// closed even when some fail; the first failure is returned.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.core().close().await
    }

    pub fn client_states(&self) -> Vec<ConnectionState> {
        self.core().states()
    }

    pub fn len(&self) -> usize {
        self.core().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core().slots.is_empty()
    }

    fn core(&self) -> &ModeCore {
        match self {
            Self::Failover(mode) => &mode.core,
            Self::LoadBalance(mode) => &mode.core,
        }
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::testing::{ScriptedClient, Shared};
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let backoff = Backoff {
            init: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(500), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_bound() {
        let bounded = ModeSettings {
            max_retries: Some(2),
            ..Default::default()
        };
        assert!(bounded.may_retry(1));
        assert!(bounded.may_retry(2));
        assert!(!bounded.may_retry(3));

        let unbounded = ModeSettings {
            max_retries: None,
            ..Default::default()
        };
        assert!(unbounded.may_retry(usize::MAX));
    }

    #[test]
    fn test_empty_client_list_rejected() {
        let result = ConnectionMode::new(
            Vec::new(),
            RoutingPolicy::LoadBalance,
            ModeSettings::default(),
            Arc::new(PublisherStats::new()),
        );
        assert!(matches!(result, Err(ConfigurationError::NoHostsConfigured)));
    }

    #[tokio::test]
    async fn test_close_closes_all_and_returns_first_error() {
        let shared = Arc::new(Shared::default());
        let mut failing = ScriptedClient::new(1, &shared);
        failing.close_error = true;
        let mut also_failing = ScriptedClient::new(2, &shared);
        also_failing.close_error = true;
        let clients = vec![
            ScriptedClient::new(0, &shared).boxed(),
            failing.boxed(),
            also_failing.boxed(),
        ];
        let mode = ConnectionMode::new(
            clients,
            RoutingPolicy::Failover,
            ModeSettings::default(),
            Arc::new(PublisherStats::new()),
        )
        .unwrap();

        let err = mode.close().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Backend(msg) if msg == "close 1"));
        assert_eq!(*shared.closes.lock().unwrap(), vec![0, 1, 2]);
        assert!(mode
            .client_states()
            .iter()
            .all(|state| *state == ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_publish_after_close_returns_everything() {
        let shared = Arc::new(Shared::default());
        let mode = ConnectionMode::new(
            vec![ScriptedClient::new(0, &shared).boxed()],
            RoutingPolicy::LoadBalance,
            ModeSettings::default(),
            Arc::new(PublisherStats::new()),
        )
        .unwrap();
        mode.close().await.unwrap();

        let err = mode
            .publish_events(vec![Event::default(), Event::default()])
            .await
            .unwrap_err();
        assert_eq!(err.unconsumed.len(), 2);
        assert!(matches!(err.source, ConnectionError::Closed));
        assert!(shared.sent.lock().unwrap().is_empty());
    }
}
