/*!
 * Cloud client contract.
 *
 * The transport that authenticates against the vendor cloud and carries
 * requests is an external collaborator. This module defines what the device
 * layer needs from it and the payloads exchanged across that boundary.
 */
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use homefleet_core::types::Id;

use crate::capability::{Capability, CapabilityState};
use crate::device::OnlineStatus;
use crate::error::{AuthError, ClientError};

/// Account credentials
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Account e-mail
    pub email: String,
    password: SecretString,
}

impl Credentials {
    /// Create credentials from an e-mail and password
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// The account password
    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

/// An authenticated session
#[derive(Debug, Clone)]
pub struct Session {
    token: SecretString,
    user_id: Id,
    issued_at: DateTime<Utc>,
}

impl Session {
    /// Create a session issued now
    pub fn new(token: impl Into<String>, user_id: Id) -> Self {
        Self {
            token: SecretString::from(token.into()),
            user_id,
            issued_at: Utc::now(),
        }
    }

    /// The bearer token
    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// The account the session belongs to
    pub fn user_id(&self) -> &Id {
        &self.user_id
    }

    /// When the session was issued
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

/// One device as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique device id
    pub id: Id,
    /// Human-readable name
    pub name: String,
    /// Model string, e.g. "msl120"
    pub device_type: String,
    /// Declared capabilities
    pub capabilities: Vec<Capability>,
    /// Connectivity at listing time
    #[serde(default)]
    pub status: OnlineStatus,
}

impl DeviceDescriptor {
    /// Create a descriptor with no capability and unknown status
    pub fn new(id: impl Into<Id>, name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_type: device_type.into(),
            capabilities: Vec::new(),
            status: OnlineStatus::Unknown,
        }
    }

    /// Declare a capability
    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Set the reported status
    pub fn with_status(mut self, status: OnlineStatus) -> Self {
        self.status = status;
        self
    }
}

/// Full state of one device, one block per capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot {
    states: Vec<CapabilityState>,
}

impl StateSnapshot {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block, replacing any block of the same capability
    pub fn with_state(mut self, state: CapabilityState) -> Self {
        self.insert(state);
        self
    }

    /// Insert a block, replacing any block of the same capability
    pub fn insert(&mut self, state: CapabilityState) {
        let capability = state.capability();
        match self.states.iter_mut().find(|s| s.capability() == capability) {
            Some(existing) => *existing = state,
            None => self.states.push(state),
        }
    }

    /// The block for `capability`, if present
    pub fn get(&self, capability: Capability) -> Option<&CapabilityState> {
        self.states.iter().find(|s| s.capability() == capability)
    }

    /// Capabilities present in the snapshot
    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.states.iter().map(CapabilityState::capability)
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl IntoIterator for StateSnapshot {
    type Item = CapabilityState;
    type IntoIter = std::vec::IntoIter<CapabilityState>;

    fn into_iter(self) -> Self::IntoIter {
        self.states.into_iter()
    }
}

/// Unsolicited connectivity update pushed by the cloud
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    /// The device the update is about
    pub device_id: Id,
    /// Its new connectivity status
    pub status: OnlineStatus,
}

/// The authenticated transport consumed by the device layer
///
/// Implementations own retries and timeouts; the device layer surfaces
/// their failures unchanged.
#[async_trait]
pub trait CloudClient: Send + Sync + fmt::Debug {
    /// Authenticate and open a session
    async fn login(&self, credentials: &Credentials) -> Result<Session, AuthError>;

    /// Close a session
    async fn logout(&self, session: &Session) -> Result<(), ClientError>;

    /// List every device registered to the account
    async fn list_devices(&self, session: &Session) -> Result<Vec<DeviceDescriptor>, ClientError>;

    /// Fetch the full current state of one device
    async fn device_state(&self, session: &Session, device_id: &Id)
        -> Result<StateSnapshot, ClientError>;

    /// Subscribe to push notifications
    ///
    /// Clients without a push channel return `Ok(None)`.
    async fn subscribe_push(
        &self,
        _session: &Session,
    ) -> Result<Option<broadcast::Receiver<PushNotification>>, ClientError> {
        Ok(None)
    }
}
