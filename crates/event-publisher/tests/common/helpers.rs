// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use event_publisher::{Event, OutputConfig, RoutingPolicy};
use serde_json::json;

pub fn event(id: i64) -> Event {
    Event::from_value(json!({ "id": id, "message": format!("event {id}") })).unwrap()
}

pub fn id_of(event: &Event) -> i64 {
    event.get("id").and_then(|v| v.as_i64()).unwrap()
}

/// A `mock` output over `hosts` with fast retries.
pub fn mock_output(hosts: &[&str], routing: RoutingPolicy) -> OutputConfig {
    OutputConfig {
        output_type: "mock".to_string(),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        routing,
        timeout_secs: 1,
        backoff_init_ms: 1,
        backoff_max_ms: 10,
        flush_interval_ms: 50,
        bulk_max_size: 10,
        ..Default::default()
    }
}
