// src/observability/mod.rs
//! Logging and metrics setup for the `tsrec` binary
//!
//! The library only emits `tracing` events and `metrics` updates; nothing is
//! recorded until a subscriber and an exporter are installed here.

use crate::utils::config::LogFormat;
use crate::utils::errors::{EngineError, Result};
use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_thread_names(true))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    }
    .map_err(|e| EngineError::ConfigError(format!("Failed to install tracing subscriber: {}", e)))
}

/// Install the Prometheus recorder
///
/// With an address the exporter serves `/metrics` there; without one the
/// recorder is installed but nothing is exposed.
pub fn init_metrics(addr: Option<&str>) -> Result<()> {
    match addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse().map_err(|e| {
                EngineError::ConfigError(format!("Invalid metrics address {}: {}", addr, e))
            })?;
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| {
                    EngineError::ConfigError(format!("Failed to install metrics exporter: {}", e))
                })?;
            info!("Serving metrics on http://{}/metrics", addr);
        }
        None => {
            PrometheusBuilder::new().install_recorder().map_err(|e| {
                EngineError::ConfigError(format!("Failed to install metrics recorder: {}", e))
            })?;
        }
    }

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "tsrec_bytes_read_total",
        Unit::Bytes,
        "Bytes read from the source"
    );
    describe_counter!(
        "tsrec_bytes_written_total",
        Unit::Bytes,
        "Bytes appended to the recording"
    );
    describe_counter!("tsrec_writes_total", "Completed writes");
    describe_counter!(
        "tsrec_overflow_events_total",
        "Times the staging buffer ran full"
    );
    describe_gauge!(
        "tsrec_buffer_fill_bytes",
        Unit::Bytes,
        "Bytes held in the staging buffer"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_metrics_address() {
        assert!(matches!(
            init_metrics(Some("not an address")),
            Err(EngineError::ConfigError(_))
        ));
    }
}
