//! Logging setup
//!
//! Structured `tracing` output, either human-readable or JSON.

use anyhow::Result;
use pgbridge_common::config::TelemetrySettings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber; `RUST_LOG` overrides `log_level`
pub fn init(log_level: &str, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    if json_logs {
        // JSON formatted logs for production
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    Ok(())
}

/// Initialize from configuration
pub fn init_from_settings(settings: &TelemetrySettings) -> Result<()> {
    init(&settings.log_level, settings.json_logs)
}
