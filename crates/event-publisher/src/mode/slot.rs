// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::client::{connect_bounded, ConnectionState, ProtocolClient};
use crate::errors::ConnectionError;
use crate::event::Payload;

const DISCONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;

pub(crate) type ClientGuard<'a> = MutexGuard<'a, Box<dyn ProtocolClient>>;

/// One client plus the state the modes track for it. Access to the client is
/// serialized through the async mutex.
pub(crate) struct ClientSlot {
    index: usize,
    client: Mutex<Box<dyn ProtocolClient>>,
    state: AtomicU8,
    reconnecting: AtomicBool,
}

impl ClientSlot {
    pub(crate) fn new(index: usize, client: Box<dyn ProtocolClient>) -> Self {
        let state = if client.is_connected() {
            CONNECTED
        } else {
            DISCONNECTED
        };
        Self {
            index,
            client: Mutex::new(client),
            state: AtomicU8::new(state),
            reconnecting: AtomicBool::new(false),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            CONNECTED => ConnectionState::Connected,
            CONNECTING => ConnectionState::Connecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == CONNECTED
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    pub(crate) async fn lock(&self) -> ClientGuard<'_> {
        self.client.lock().await
    }

    pub(crate) fn try_lock(&self) -> Option<ClientGuard<'_>> {
        self.client.try_lock().ok()
    }

    /// Claims the right to run the background reconnect for this slot.
    pub(crate) fn begin_reconnect(&self) -> bool {
        !self.reconnecting.swap(true, Ordering::AcqRel)
    }

    /// True while a background reconnect owns this slot.
    pub(crate) fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    pub(crate) fn end_reconnect(&self) {
        self.reconnecting.store(false, Ordering::Release);
    }

    /// Connects the locked client unless it already reports a live connection.
    pub(crate) async fn ensure_connected(
        &self,
        client: &mut ClientGuard<'_>,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        if client.is_connected() {
            self.set_state(CONNECTED);
            return Ok(());
        }

        self.set_state(CONNECTING);
        match connect_bounded(&mut ***client, timeout).await {
            Ok(()) => {
                debug!(client = self.index, "client connected");
                self.set_state(CONNECTED);
                Ok(())
            }
            Err(err) => {
                self.set_state(DISCONNECTED);
                Err(err)
            }
        }
    }

    /// Sends `payload` on the locked client. On failure the slot is marked
    /// disconnected and the events the client did not accept are handed back.
    pub(crate) async fn transmit(
        &self,
        client: &mut ClientGuard<'_>,
        payload: Payload,
    ) -> Result<(), (Payload, ConnectionError)> {
        let result = match payload {
            Payload::Single(event) => client
                .publish_event(event.clone())
                .await
                .map_err(|err| (Payload::Single(event), err)),
            Payload::Batch(events) => client
                .publish_events(events)
                .await
                .map_err(|err| (Payload::Batch(err.unconsumed), err.source)),
        };
        if result.is_err() {
            self.set_state(DISCONNECTED);
        }
        result
    }

    pub(crate) async fn close(&self) -> Result<(), ConnectionError> {
        let mut client = self.client.lock().await;
        let result = client.close().await;
        self.set_state(DISCONNECTED);
        result
    }
}
