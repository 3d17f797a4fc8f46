// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Events, payloads and the messages that carry them through the pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::signal::CompletionSignal;

/// Routing metadata attached to a message.
pub type Metadata = BTreeMap<String, String>;

/// An opaque key/value record.
///
/// Events are immutable once built. Cloning only bumps a reference count, so
/// the same event can be handed to every output without copying its fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event {
    fields: Arc<Map<String, Value>>,
}

impl Event {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields: Arc::new(fields),
        }
    }

    /// Builds an event from a JSON value; only objects are accepted.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self::new(fields)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when both events share the same field storage.
    pub fn ptr_eq(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields)
    }
}

impl From<Map<String, Value>> for Event {
    fn from(fields: Map<String, Value>) -> Self {
        Self::new(fields)
    }
}

/// The body of a message: one event or an ordered batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Single(Event),
    Batch(Vec<Event>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Single(_) => 1,
            Payload::Batch(events) => events.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn events(&self) -> &[Event] {
        match self {
            Payload::Single(event) => std::slice::from_ref(event),
            Payload::Batch(events) => events,
        }
    }

    pub fn into_events(self) -> Vec<Event> {
        match self {
            Payload::Single(event) => vec![event],
            Payload::Batch(events) => events,
        }
    }
}

/// Per-message delivery context.
#[derive(Debug)]
pub struct Context {
    pub signal: CompletionSignal,
    pub metadata: Metadata,
}

impl Context {
    pub fn new(signal: CompletionSignal) -> Self {
        Self {
            signal,
            metadata: Metadata::new(),
        }
    }

    /// A context nobody waits on.
    pub fn detached() -> Self {
        Self::new(CompletionSignal::noop())
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::detached()
    }
}

/// The unit of work flowing between workers.
#[derive(Debug)]
pub struct Message {
    pub context: Context,
    pub payload: Payload,
}

impl Message {
    pub fn new(context: Context, payload: Payload) -> Self {
        Self { context, payload }
    }

    pub fn single(context: Context, event: Event) -> Self {
        Self::new(context, Payload::Single(event))
    }

    pub fn batch(context: Context, events: Vec<Event>) -> Self {
        Self::new(context, Payload::Batch(events))
    }
}
