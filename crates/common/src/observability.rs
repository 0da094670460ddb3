//! Logging and tracing bootstrap for certwatch.
//!
//! Structured JSON output is the default so log aggregation works out of the
//! box in-cluster; set `CERTWATCH_LOG_FORMAT=pretty` for local development.
//! The filter comes from `RUST_LOG` and defaults to `info`.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing/logging subsystem.
///
/// Call once at process start, before any other component is constructed.
pub fn init_tracing() -> Result<()> {
    let format = std::env::var("CERTWATCH_LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let json_layer = if format == "json" {
        Some(fmt::layer().json().with_target(true))
    } else {
        None
    };

    let pretty_layer = if format == "pretty" {
        Some(fmt::layer().pretty().with_target(true))
    } else {
        None
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .init();

    info!("tracing initialized");
    Ok(())
}
