// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for embedders of the publisher.
//!
//! Every line is prefixed with `PUBLISHER` so the core's output can be told
//! apart from the host agent's own logs:
//!
//! ```text
//! PUBLISHER | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! ```text
//! PUBLISHER | DEBUG | message worker started worker=primary
//! PUBLISHER | WARN | publish failed, failing over client=0 next=1 remaining=50 error=client is not connected
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::PublisherConfig;

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("could not parse log level: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("setting default subscriber failed: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Event formatter producing `PUBLISHER | LEVEL | ` prefixed lines.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "PUBLISHER | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs a global subscriber filtered at `level` that writes through
/// [`Formatter`].
///
/// ANSI colors stay off so every line starts with the plain `PUBLISHER |`
/// prefix log pipelines match on.
///
/// # Arguments
///
/// * `level` - Any `EnvFilter` directive, e.g. `info` or `event_publisher=debug`
///
/// # Errors
///
/// * [`LoggerError::Filter`] - If `level` is not a valid directive
/// * [`LoggerError::Install`] - If a global subscriber is already installed
pub fn init_tracing(level: &str) -> Result<(), LoggerError> {
    install(EnvFilter::try_new(level)?)
}

/// Installs the global subscriber at the `log_level` of `config`.
///
/// Embedders call this once at startup, before building the publisher.
pub fn init_from_config(config: &PublisherConfig) -> Result<(), LoggerError> {
    install(config_filter(config)?)
}

/// The filter [`init_from_config`] installs.
pub fn config_filter(config: &PublisherConfig) -> Result<EnvFilter, LoggerError> {
    Ok(EnvFilter::try_new(&config.log_level)?)
}

fn install(filter: EnvFilter) -> Result<(), LoggerError> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!("logging subsystem enabled");
    Ok(())
}
