//! Tracing subscriber setup for the daemon
//!
//! The library only emits `tracing` events; binaries decide where they go.
//! `RUST_LOG` takes precedence over the configured level.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ModbusError, ModbusResult};

/// Default filter when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Build the filter: `RUST_LOG` if set and valid, otherwise `level`.
pub fn build_filter(level: &str) -> ModbusResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level)
        .map_err(|e| ModbusError::configuration(format!("Invalid log level '{level}': {e}")))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(level: &str) -> ModbusResult<()> {
    let filter = build_filter(level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| ModbusError::configuration(format!("Logging already initialised: {e}")))
}
