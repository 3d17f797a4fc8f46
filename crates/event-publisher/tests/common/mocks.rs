// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory backend standing in for a network sink

use async_trait::async_trait;
use event_publisher::{
    ConnectionError, Event, OutputConfig, OutputRegistry, PartialSendError, ProtocolClient,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct BackendState {
    delivered: Vec<(String, Event)>,
    down: HashSet<String>,
    fail_next: HashMap<String, usize>,
    unbuildable: HashSet<String>,
    built: Vec<String>,
    closed: Vec<String>,
}

/// Shared view of every mock client built from the same backend
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<BackendState>>,
}

#[allow(dead_code)]
impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses connections and publishes for `host` until `set_up` is called.
    pub fn set_down(&self, host: &str) {
        self.state.lock().unwrap().down.insert(host.to_string());
    }

    pub fn set_up(&self, host: &str) {
        self.state.lock().unwrap().down.remove(host);
    }

    /// Fails the next `count` publishes on `host`, dropping the connection.
    pub fn fail_next(&self, host: &str, count: usize) {
        self.state
            .lock()
            .unwrap()
            .fail_next
            .insert(host.to_string(), count);
    }

    /// Makes client construction fail for `host`.
    pub fn unbuildable(&self, host: &str) {
        self.state
            .lock()
            .unwrap()
            .unbuildable
            .insert(host.to_string());
    }

    pub fn delivered(&self) -> Vec<(String, Event)> {
        self.state.lock().unwrap().delivered.clone()
    }

    pub fn delivered_to(&self, host: &str) -> Vec<Event> {
        self.delivered()
            .into_iter()
            .filter(|(h, _)| h == host)
            .map(|(_, e)| e)
            .collect()
    }

    pub fn built(&self) -> Vec<String> {
        self.state.lock().unwrap().built.clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn build(&self, host: &str) -> Result<Box<dyn ProtocolClient>, ConnectionError> {
        let mut state = self.state.lock().unwrap();
        if state.unbuildable.contains(host) {
            return Err(ConnectionError::Backend(format!("cannot resolve {host}")));
        }
        state.built.push(host.to_string());
        Ok(Box::new(MockClient {
            host: host.to_string(),
            connected: false,
            backend: self.clone(),
        }))
    }

    /// Registry with this backend registered as output type `mock`.
    pub fn registry(&self) -> OutputRegistry {
        let mut registry = OutputRegistry::new();
        let backend = self.clone();
        registry
            .register("mock", move |host: &str, _config: &OutputConfig| {
                backend.build(host)
            })
            .unwrap();
        registry
    }
}

pub struct MockClient {
    host: String,
    connected: bool,
    backend: MockBackend,
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn connect(&mut self, _timeout: Duration) -> Result<(), ConnectionError> {
        if self.backend.state.lock().unwrap().down.contains(&self.host) {
            return Err(ConnectionError::Connect {
                host: self.host.clone(),
                reason: "connection refused".to_string(),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.connected = false;
        self.backend
            .state
            .lock()
            .unwrap()
            .closed
            .push(self.host.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn publish_events(&mut self, events: Vec<Event>) -> Result<(), PartialSendError> {
        if !self.connected {
            return Err(PartialSendError::new(events, ConnectionError::NotConnected));
        }

        let mut state = self.backend.state.lock().unwrap();
        let scripted_failure = match state.fail_next.get_mut(&self.host) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if scripted_failure || state.down.contains(&self.host) {
            self.connected = false;
            return Err(PartialSendError::new(
                events,
                ConnectionError::Backend(format!("{} reset the connection", self.host)),
            ));
        }

        let host = self.host.clone();
        state
            .delivered
            .extend(events.into_iter().map(|event| (host.clone(), event)));
        Ok(())
    }
}
