//! Log subscriber setup and the per-request access log.

use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// One line of the access log, emitted after a response has been built.
#[derive(Debug, Clone)]
pub struct AccessLogEvent<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub status: u16,
    /// `HIT`, `MISS`, or `ERROR` for gateway failures.
    pub cache: &'a str,
    pub bytes_out: usize,
    pub elapsed: Duration,
}

pub fn log_access(event: AccessLogEvent<'_>) {
    let AccessLogEvent {
        method,
        uri,
        status,
        cache,
        bytes_out,
        elapsed,
    } = event;

    tracing::info!(
        target: "access_log",
        method,
        uri,
        status,
        cache,
        bytes_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "request served"
    );
}
