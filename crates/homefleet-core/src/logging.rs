/*!
 * Logging functionality for HomeFleet.
 *
 * Tracing setup and span helpers shared by every HomeFleet crate.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_from_config(&LoggingConfig::default())
}

/// Initialize the logging system with a specific filter
///
/// `RUST_LOG` takes precedence over `filter` when set.
pub fn init_with_filter(filter: &str) -> Result<()> {
    init_from_config(&LoggingConfig {
        level: filter.to_string(),
        ..LoggingConfig::default()
    })
}

/// Initialize the logging system from a [`LoggingConfig`]
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::logging(format!("Invalid log filter {:?}: {}", config.level, e)))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(config.with_target)
                .with_ansi(config.ansi),
        )
        .with(filter)
        .try_init()
        .map_err(|e| Error::logging(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Span wrapping every operation performed on behalf of one device
pub fn device_span(device_id: &str) -> Span {
    tracing::debug_span!("device", id = %device_id)
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `component` - The component performing the operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}
