// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Explicit registry of output types.
//!
//! Each output backend registers a factory under its type name; the builder
//! looks outputs up here when it resolves configuration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::client::ProtocolClient;
use crate::config::OutputConfig;
use crate::errors::{ConfigurationError, ConnectionError};

/// Builds one client for `host` with the output's configuration.
pub type ClientFactory = Arc<
    dyn Fn(&str, &OutputConfig) -> Result<Box<dyn ProtocolClient>, ConnectionError> + Send + Sync,
>;

#[derive(Clone, Default)]
pub struct OutputRegistry {
    factories: HashMap<String, ClientFactory>,
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `output_type`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::DuplicateOutput`] if the type is taken;
    /// the first registration stays in place.
    pub fn register<F>(&mut self, output_type: impl Into<String>, factory: F) -> Result<(), ConfigurationError>
    where
        F: Fn(&str, &OutputConfig) -> Result<Box<dyn ProtocolClient>, ConnectionError>
            + Send
            + Sync
            + 'static,
    {
        let output_type = output_type.into();
        if self.factories.contains_key(&output_type) {
            return Err(ConfigurationError::DuplicateOutput(output_type));
        }
        self.factories.insert(output_type, Arc::new(factory));
        Ok(())
    }

    pub fn get(&self, output_type: &str) -> Result<ClientFactory, ConfigurationError> {
        self.factories
            .get(output_type)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownOutput(output_type.to_string()))
    }

    pub fn contains(&self, output_type: &str) -> bool {
        self.factories.contains_key(output_type)
    }
}

impl fmt::Debug for OutputRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("OutputRegistry")
            .field("types", &types)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mode::testing::{ScriptedClient, Shared};

    fn registry() -> (OutputRegistry, Arc<Shared>) {
        let shared = Arc::new(Shared::default());
        let mut registry = OutputRegistry::new();
        let clients = Arc::clone(&shared);
        registry
            .register("scripted", move |_host, _config| {
                Ok(ScriptedClient::new(0, &clients).boxed())
            })
            .unwrap();
        (registry, shared)
    }

    #[test]
    fn test_lookup() {
        let (registry, _shared) = registry();
        assert!(registry.contains("scripted"));
        let factory = registry.get("scripted").unwrap();
        assert!(factory("localhost", &OutputConfig::default()).is_ok());
        assert!(matches!(
            registry.get("kafka"),
            Err(ConfigurationError::UnknownOutput(name)) if name == "kafka"
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (mut registry, _shared) = registry();
        let err = registry
            .register("scripted", |_host, _config| {
                Err(ConnectionError::Backend("duplicate".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateOutput(name) if name == "scripted"));
        assert_eq!(format!("{registry:?}"), r#"OutputRegistry { types: ["scripted"] }"#);
    }
}
