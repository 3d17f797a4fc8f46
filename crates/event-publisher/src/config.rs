// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::bulk::BatchSettings;
use crate::errors::ConfigurationError;
use crate::mode::{Backoff, ModeSettings};
use crate::signal::SplitPolicy;
use crate::worker::DEFAULT_QUEUE_SIZE;

/// How an output spreads payloads over its clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    #[default]
    Failover,
    LoadBalance,
}

/// Configuration of one output
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Registered output type the clients are built with
    #[serde(rename = "type")]
    pub output_type: String,
    /// Hosts to connect to
    pub hosts: Vec<String>,
    /// Clients built per host
    pub worker: usize,
    /// Flush period of partial batches in milliseconds; `<= 0` disables batching
    pub flush_interval_ms: i64,
    /// Events per batch; `<= 0` disables batching
    pub bulk_max_size: i64,
    /// Failover or load balancing across clients
    pub routing: RoutingPolicy,
    /// Connect timeout in seconds; 0 waits indefinitely
    pub timeout_secs: u64,
    /// Retries per payload; negative retries until success
    pub max_retries: i64,
    /// First retry backoff in milliseconds
    pub backoff_init_ms: u64,
    /// Backoff ceiling in milliseconds
    pub backoff_max_ms: u64,
    /// Capacity of the output's inbound queue
    pub queue_size: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_type: String::new(),
            hosts: Vec::new(),
            worker: 1,
            flush_interval_ms: 1000,
            bulk_max_size: 50,
            routing: RoutingPolicy::Failover,
            timeout_secs: 30,
            max_retries: 3,
            backoff_init_ms: 1000,
            backoff_max_ms: 60_000,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl OutputConfig {
    /// `None` when batching is disabled.
    pub fn batching(&self) -> Option<BatchSettings> {
        BatchSettings::from_config(self.flush_interval_ms, self.bulk_max_size)
    }

    pub fn mode_settings(&self) -> ModeSettings {
        ModeSettings {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: usize::try_from(self.max_retries).ok(),
            backoff: Backoff {
                init: Duration::from_millis(self.backoff_init_ms),
                max: Duration::from_millis(self.backoff_max_ms),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.output_type.trim().is_empty() {
            return Err(invalid("type", "output type cannot be empty"));
        }
        if self.hosts.is_empty() {
            return Err(ConfigurationError::NoHostsConfigured);
        }
        if self.hosts.iter().any(|host| host.trim().is_empty()) {
            return Err(invalid("hosts", "host cannot be empty"));
        }
        if self.worker == 0 {
            return Err(invalid("worker", "must be greater than 0"));
        }
        if self.queue_size == 0 {
            return Err(invalid("queue_size", "must be greater than 0"));
        }
        if self.backoff_max_ms < self.backoff_init_ms {
            return Err(ConfigurationError::InvalidSetting {
                field: "backoff_max_ms",
                reason: format!(
                    "{} is smaller than backoff_init_ms {}",
                    self.backoff_max_ms, self.backoff_init_ms
                ),
            });
        }
        Ok(())
    }
}

/// Configuration of a publisher and all of its outputs
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// How per-output outcomes combine into the producer's outcome
    pub split_policy: SplitPolicy,
    /// Capacity of the publisher's inbound queue
    pub queue_size: usize,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Outputs by name
    pub outputs: BTreeMap<String, OutputConfig>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            split_policy: SplitPolicy::default(),
            queue_size: DEFAULT_QUEUE_SIZE,
            log_level: "info".to_string(),
            outputs: BTreeMap::new(),
        }
    }
}

impl PublisherConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.queue_size == 0 {
            return Err(invalid("queue_size", "must be greater than 0"));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigurationError::InvalidSetting {
                field: "log_level",
                reason: format!(
                    "'{}' must be one of: trace, debug, info, warn, error",
                    self.log_level
                ),
            });
        }

        for (name, output) in &self.outputs {
            if name.trim().is_empty() {
                return Err(invalid("outputs", "output name cannot be empty"));
            }
            output.validate()?;
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        field,
        reason: reason.to_string(),
    }
}
