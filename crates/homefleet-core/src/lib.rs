/*!
 * HomeFleet Core
 *
 * This crate provides the shared building blocks for the HomeFleet system:
 * identifiers, the core error type, layered configuration, and logging.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

/// HomeFleet core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
