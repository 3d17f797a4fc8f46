// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tracing::{debug, warn};

use crate::client::ProtocolClient;
use crate::config::OutputConfig;
use crate::errors::{ConfigurationError, ConnectionError};

/// Builds one client per host, each host repeated `worker` times in a row.
///
/// If any client cannot be built, the ones already built are closed before
/// the error is returned.
pub async fn make_clients<F>(
    config: &OutputConfig,
    factory: F,
) -> Result<Vec<Box<dyn ProtocolClient>>, ConfigurationError>
where
    F: Fn(&str, &OutputConfig) -> Result<Box<dyn ProtocolClient>, ConnectionError>,
{
    if config.hosts.is_empty() {
        return Err(ConfigurationError::NoHostsConfigured);
    }

    let worker = config.worker.max(1);
    let mut clients: Vec<Box<dyn ProtocolClient>> =
        Vec::with_capacity(config.hosts.len() * worker);

    for host in &config.hosts {
        for _ in 0..worker {
            match factory(host, config) {
                Ok(client) => clients.push(client),
                Err(source) => {
                    warn!(host = %host, error = %source, built = clients.len(), "failed to build client");
                    close_all(&mut clients).await;
                    return Err(ConfigurationError::ClientConstruction {
                        host: host.clone(),
                        source,
                    });
                }
            }
        }
    }

    debug!(hosts = config.hosts.len(), worker, clients = clients.len(), "clients built");
    Ok(clients)
}

pub(crate) async fn close_all(clients: &mut Vec<Box<dyn ProtocolClient>>) {
    for mut client in clients.drain(..) {
        if let Err(err) = client.close().await {
            warn!(error = %err, "failed to close client");
        }
    }
}
