/*!
 * Error types for the HomeFleet devices crate.
 *
 * Each operation has its own error so callers can tell a bad login from a
 * failed discovery, a failed per-device refresh, or a contract violation.
 */
use thiserror::Error;

use homefleet_core::types::Id;

use crate::capability::Capability;

/// Failure reported by the cloud client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The cloud service could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The cloud service did not answer in time
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The cloud answered but the device itself did not
    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    /// The cloud refused the request
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The session is invalid or expired
    #[error("Session error: {0}")]
    Session(String),

    /// A payload could not be decoded
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

/// How far a failed request got before failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Nothing is known about the device
    CloudUnreachable,
    /// The cloud is reachable but the device is not
    DeviceUnreachable,
    /// The round trip worked; the failure says nothing about connectivity
    Established,
}

impl ClientError {
    /// Classify the failure by how far the request got
    pub fn connectivity(&self) -> Connectivity {
        match self {
            ClientError::Connection(_) | ClientError::Timeout(_) => Connectivity::CloudUnreachable,
            ClientError::DeviceUnreachable(_) => Connectivity::DeviceUnreachable,
            ClientError::Rejected(_) | ClientError::Session(_) | ClientError::Malformed(_) => {
                Connectivity::Established
            }
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Malformed(err.to_string())
    }
}

/// Authentication failure; fatal to the whole session
#[derive(Error, Debug)]
pub enum AuthError {
    /// The account rejected the credentials
    #[error("Invalid credentials for {0}")]
    InvalidCredentials(String),

    /// The login request itself failed
    #[error("Login failed: {0}")]
    Client(#[from] ClientError),
}

/// Failure while preparing the manager
#[derive(Error, Debug)]
pub enum InitError {
    /// Subscribing to the push channel failed
    #[error("Push subscription failed: {0}")]
    Subscribe(#[from] ClientError),

    /// The manager was already closed
    #[error("Manager is closed")]
    Closed,
}

/// Discovery failure; the registry keeps its last good state
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Listing the devices failed
    #[error("Device listing failed: {0}")]
    Client(#[from] ClientError),

    /// The manager was already closed
    #[error("Manager is closed")]
    Closed,
}

/// Why a refresh failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshErrorKind {
    /// The state request failed
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The snapshot lacked a capability the device declares
    #[error("state snapshot is missing capability {0}")]
    IncompleteSnapshot(Capability),
}

/// Refresh failure for one device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Refresh of device {device_id} failed: {kind}")]
pub struct RefreshError {
    /// The device that failed to refresh
    pub device_id: Id,
    /// The cause
    pub kind: RefreshErrorKind,
}

impl RefreshError {
    /// Create a new refresh error
    pub fn new(device_id: Id, kind: impl Into<RefreshErrorKind>) -> Self {
        Self {
            device_id,
            kind: kind.into(),
        }
    }
}

/// An accessor was called for a capability the device does not implement
///
/// This is a programming error on the caller's side, never a network
/// condition: check [`Device::implements`](crate::device::Device::implements)
/// or filter the registry by capability first.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Device {device_id} does not implement capability {capability}")]
pub struct CapabilityMismatchError {
    /// The device the accessor was called on
    pub device_id: Id,
    /// The capability the accessor belongs to
    pub capability: Capability,
}
