// src/observability.rs
//! Tracing initialization
//!
//! The engine emits `tracing` events and `metrics` counters throughout; this
//! module wires up a subscriber for embedders that do not install their own.
//! Metrics recorder installation is left to the embedder.

use crate::utils::errors::{EngineError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Filter is taken from `WARDEN_LOG` (falling back to `info`). Safe to call
/// only once per process.
pub fn init_tracing() -> Result<()> {
    init_tracing_with(false)
}

/// Initialize tracing with optional JSON output (for log shippers).
pub fn init_tracing_with(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_env("WARDEN_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    result.map_err(|e| EngineError::ConfigError(format!("Failed to init tracing: {}", e)))
}
