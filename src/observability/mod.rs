// src/observability/mod.rs
//! Logging and metrics setup for the binary
//!
//! The library only emits `tracing` events and `metrics` samples; installing
//! a subscriber or an exporter is left to whoever hosts the engine.

use crate::utils::config::{LoggingConfig, MetricsConfig};
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber, writing to stderr.
///
/// `RUST_LOG` wins over the configured level. Only the first call in a
/// process takes effect.
pub fn init_tracing(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()
            .ok();
    }
}

/// Install the Prometheus exporter when a scrape address is configured
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    let Some(addr) = &config.prometheus_addr else {
        return Ok(());
    };

    let addr: SocketAddr = addr.parse().map_err(|e| {
        EngineError::ConfigError(format!("invalid metrics.prometheus_addr '{}': {}", addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::ConfigError(format!("failed to install metrics exporter: {}", e)))?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}
