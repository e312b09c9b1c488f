/*!
 * HomeFleet Devices
 *
 * This crate provides the device capability model, the cloud client
 * contract, discovery and the refresh protocol for the HomeFleet system.
 */

#![warn(missing_docs)]

pub mod capability;
pub mod client;
pub mod device;
pub mod error;
pub mod event;
pub mod manager;
pub mod memory;
pub mod refresh;
pub mod registry;

#[cfg(test)]
mod fixtures;

pub use capability::{
    Capability, CapabilitySet, CapabilityState, ElectricityReading, LightState, Rgb, SystemInfo,
    ToggleChannel, ToggleState,
};
pub use client::{
    CloudClient, Credentials, DeviceDescriptor, PushNotification, Session, StateSnapshot,
};
pub use device::{Device, DeviceInfo, OnlineStatus};
pub use error::{
    AuthError, CapabilityMismatchError, ClientError, Connectivity, DiscoveryError, InitError,
    RefreshError, RefreshErrorKind,
};
pub use event::FleetEvent;
pub use manager::{DeviceManager, DiscoveryReport, RefreshScope, RefreshSummary};
pub use memory::{InMemoryCloud, RequestStats};
pub use registry::{DeviceFilter, DeviceRegistry, RegistrySnapshot};

/// HomeFleet devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
