/*!
 * Configuration management for HomeFleet.
 *
 * This module loads the fleet settings from layered sources: compiled-in
 * defaults, an optional configuration file, and prefixed environment
 * variables. Account credentials are not part of it.
 */
use std::path::Path;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Top-level configuration for a HomeFleet process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Device manager configuration
    #[serde(default)]
    pub manager: ManagerConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter directive (e.g. "info", "homefleet_devices=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include the event target in formatted output
    #[serde(default = "default_true")]
    pub with_target: bool,

    /// Whether to emit ANSI colours
    #[serde(default = "default_true")]
    pub ansi: bool,
}

/// What discovery does with devices that the cloud no longer reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VanishedPolicy {
    /// Keep the device, mark it offline and unlisted
    #[default]
    MarkOffline,
    /// Drop the device from the registry
    Prune,
}

/// Device manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Policy applied to devices missing from a discovery payload
    #[serde(default)]
    pub vanished_policy: VanishedPolicy,

    /// Upper bound on refreshes in flight during a bulk refresh
    #[serde(default = "default_max_concurrent_refreshes")]
    pub max_concurrent_refreshes: usize,

    /// Capacity of the fleet event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Whether a default bulk refresh skips devices known to be offline
    #[serde(default = "default_true")]
    pub skip_offline_on_bulk_refresh: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
            ansi: true,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            vanished_policy: VanishedPolicy::default(),
            max_concurrent_refreshes: default_max_concurrent_refreshes(),
            event_capacity: default_event_capacity(),
            skip_offline_on_bulk_refresh: true,
        }
    }
}

impl ManagerConfig {
    /// Check the values that would make the manager unusable
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_refreshes == 0 {
            return Err(Error::config("manager.max_concurrent_refreshes must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(Error::config("manager.event_capacity must be at least 1"));
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_refreshes() -> usize {
    8
}

fn default_event_capacity() -> usize {
    128
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    ///
    /// Nested keys use `__`, e.g. `HOMEFLEET__MANAGER__VANISHED_POLICY=prune`.
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<FleetConfig> {
        let mut builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&FleetConfig::default())
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
                debug!("Loading configuration from {}", config_file);
                builder = builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            builder = builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: FleetConfig = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.manager.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}
