// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-backend connection abstraction.
//!
//! Every output backend implements [`ProtocolClient`] once; the wire format
//! stays behind this trait and the publishing core never looks past it.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{ConnectionError, PartialSendError};
use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[async_trait]
pub trait ProtocolClient: Send + 'static {
    /// Establishes the connection. A zero `timeout` waits indefinitely.
    async fn connect(&mut self, timeout: Duration) -> Result<(), ConnectionError>;

    /// Releases the connection. Calling it more than once is harmless.
    async fn close(&mut self) -> Result<(), ConnectionError>;

    /// Must report `false` right after any failed publish.
    fn is_connected(&self) -> bool;

    /// Sends `events` in order. The client may accept only a prefix; on
    /// failure the error carries exactly the events it did not accept.
    async fn publish_events(&mut self, events: Vec<Event>) -> Result<(), PartialSendError>;

    async fn publish_event(&mut self, event: Event) -> Result<(), ConnectionError> {
        self.publish_events(vec![event])
            .await
            .map_err(|err| err.source)
    }
}

/// Connects `client`, enforcing `timeout` even if the client ignores it.
pub(crate) async fn connect_bounded(
    client: &mut dyn ProtocolClient,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    if timeout.is_zero() {
        return client.connect(timeout).await;
    }
    match tokio::time::timeout(timeout, client.connect(timeout)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout(timeout)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct SlowClient {
        sent: Vec<Event>,
        connected: bool,
    }

    #[async_trait]
    impl ProtocolClient for SlowClient {
        async fn connect(&mut self, _timeout: Duration) -> Result<(), ConnectionError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            self.connected = true;
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn publish_events(&mut self, events: Vec<Event>) -> Result<(), PartialSendError> {
            if !self.connected {
                return Err(PartialSendError::new(events, ConnectionError::NotConnected));
            }
            self.sent.extend(events);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_bounded_times_out() {
        let mut client = SlowClient::default();
        let err = connect_bounded(&mut client, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(d) if d == Duration::from_secs(5)));
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_bounded_zero_waits_indefinitely() {
        let mut client = SlowClient::default();
        connect_bounded(&mut client, Duration::ZERO).await.unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_publish_event_defaults_to_batch_of_one() {
        let mut client = SlowClient::default();
        assert!(matches!(
            client.publish_event(Event::default()).await,
            Err(ConnectionError::NotConnected)
        ));

        client.connected = true;
        client.publish_event(Event::default()).await.unwrap();
        assert_eq!(client.sent.len(), 1);
    }
}
