/*!
 * In-memory cloud.
 *
 * A [`CloudClient`] backed by process memory. It stands in for the vendor
 * cloud in demos and tests: accounts, a device table, per-device state,
 * failure injection, an optional push channel and request statistics.
 */
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use homefleet_core::types::Id;

use crate::client::{
    CloudClient, Credentials, DeviceDescriptor, PushNotification, Session, StateSnapshot,
};
use crate::device::OnlineStatus;
use crate::error::{AuthError, ClientError};

const PUSH_CHANNEL_CAPACITY: usize = 64;

/// Request counters kept by [`InMemoryCloud`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// Successful logins
    pub logins: usize,
    /// Logouts
    pub logouts: usize,
    /// Device listings
    pub listings: usize,
    /// Push subscriptions handed out
    pub push_subscriptions: usize,
    /// State requests per device
    pub state_requests: HashMap<Id, usize>,
    /// Highest number of concurrent state requests seen per device
    pub peak_in_flight_per_device: HashMap<Id, usize>,
    /// Highest number of concurrent state requests seen overall
    pub peak_in_flight: usize,
}

#[derive(Debug, Default)]
struct CloudState {
    accounts: HashMap<String, String>,
    sessions: HashSet<String>,
    devices: IndexMap<Id, DeviceDescriptor>,
    states: HashMap<Id, StateSnapshot>,
    discovery_failures: VecDeque<ClientError>,
    refresh_failures: HashMap<Id, VecDeque<ClientError>>,
    in_flight: HashMap<Id, usize>,
    total_in_flight: usize,
    stats: RequestStats,
}

impl CloudState {
    fn check_session(&self, session: &Session) -> Result<(), ClientError> {
        if self.sessions.contains(session.token().expose_secret()) {
            Ok(())
        } else {
            Err(ClientError::Session("unknown or expired token".to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default)]
    accounts: Vec<FixtureAccount>,
    #[serde(default)]
    devices: Vec<FixtureDevice>,
}

#[derive(Debug, Deserialize)]
struct FixtureAccount {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct FixtureDevice {
    descriptor: DeviceDescriptor,
    #[serde(default)]
    state: Option<StateSnapshot>,
}

/// A cloud account living in process memory
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    state: Mutex<CloudState>,
    push: Option<broadcast::Sender<PushNotification>>,
    latency: Option<Duration>,
}

/// Keeps the in-flight counters honest even when a request is cancelled
struct InFlight<'a> {
    cloud: &'a InMemoryCloud,
    device_id: Id,
}

impl<'a> InFlight<'a> {
    fn enter(cloud: &'a InMemoryCloud, device_id: &Id) -> Self {
        let mut state = cloud.lock();
        let per_device = {
            let count = state.in_flight.entry(device_id.clone()).or_default();
            *count += 1;
            *count
        };
        state.total_in_flight += 1;
        let total = state.total_in_flight;

        let stats = &mut state.stats;
        *stats.state_requests.entry(device_id.clone()).or_default() += 1;
        let peak = stats
            .peak_in_flight_per_device
            .entry(device_id.clone())
            .or_default();
        *peak = (*peak).max(per_device);
        stats.peak_in_flight = stats.peak_in_flight.max(total);

        Self {
            cloud,
            device_id: device_id.clone(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.cloud.lock();
        if let Some(count) = state.in_flight.get_mut(&self.device_id) {
            *count = count.saturating_sub(1);
        }
        state.total_in_flight = state.total_in_flight.saturating_sub(1);
    }
}

impl InMemoryCloud {
    /// Create an empty cloud without push channel or latency
    pub fn new() -> Self {
        Self::default()
    }

    /// Load accounts, devices and states from a JSON fixture
    ///
    /// ```json
    /// {
    ///   "accounts": [{ "email": "me@example.com", "password": "secret" }],
    ///   "devices": [{
    ///     "descriptor": { "id": "plug-1", "name": "Desk", "device_type": "mss210",
    ///                     "capabilities": ["toggle"], "status": "online" },
    ///     "state": [{ "capability": "toggle",
    ///                 "state": { "channels": [{ "channel": 0, "on": true }] } }]
    ///   }]
    /// }
    /// ```
    pub fn from_fixture_json(json: &str) -> Result<Self, ClientError> {
        let fixture: Fixture = serde_json::from_str(json)?;
        let cloud = Self::new();
        {
            let mut state = cloud.lock();
            for account in fixture.accounts {
                state.accounts.insert(account.email, account.password);
            }
            for device in fixture.devices {
                if let Some(snapshot) = device.state {
                    state.states.insert(device.descriptor.id.clone(), snapshot);
                }
                state
                    .devices
                    .insert(device.descriptor.id.clone(), device.descriptor);
            }
        }
        Ok(cloud)
    }

    /// Register an account
    pub fn with_account(self, email: impl Into<String>, password: impl Into<String>) -> Self {
        self.lock().accounts.insert(email.into(), password.into());
        self
    }

    /// Offer a push channel to subscribers
    pub fn with_push_channel(mut self) -> Self {
        let (sender, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        self.push = Some(sender);
        self
    }

    /// Delay every device listing and state request by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a device, optionally with its current state
    pub fn add_device(&self, descriptor: DeviceDescriptor, snapshot: Option<StateSnapshot>) {
        let mut state = self.lock();
        if let Some(snapshot) = snapshot {
            state.states.insert(descriptor.id.clone(), snapshot);
        }
        state.devices.insert(descriptor.id.clone(), descriptor);
    }

    /// Remove a device from the account
    pub fn remove_device(&self, id: &Id) -> Option<DeviceDescriptor> {
        let mut state = self.lock();
        state.states.remove(id);
        state.devices.shift_remove(id)
    }

    /// Replace the remote state of a device
    pub fn set_state(&self, id: &Id, snapshot: StateSnapshot) {
        self.lock().states.insert(id.clone(), snapshot);
    }

    /// Change the connectivity the cloud reports for a device
    pub fn set_status(&self, id: &Id, status: OnlineStatus) {
        if let Some(descriptor) = self.lock().devices.get_mut(id) {
            descriptor.status = status;
        }
    }

    /// Make the next device listing fail with `error`
    pub fn fail_next_discovery(&self, error: ClientError) {
        self.lock().discovery_failures.push_back(error);
    }

    /// Make the next state request for `id` fail with `error`
    pub fn fail_next_refresh(&self, id: &Id, error: ClientError) {
        self.lock()
            .refresh_failures
            .entry(id.clone())
            .or_default()
            .push_back(error);
    }

    /// Push a status notification to every subscriber
    ///
    /// Returns the number of receivers, zero without a push channel.
    pub fn push_status(&self, id: &Id, status: OnlineStatus) -> usize {
        self.set_status(id, status);
        match &self.push {
            Some(sender) => sender
                .send(PushNotification {
                    device_id: id.clone(),
                    status,
                })
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Snapshot of the request counters
    pub fn stats(&self) -> RequestStats {
        self.lock().stats.clone()
    }

    /// Number of state requests issued for `id`
    pub fn state_requests(&self, id: &Id) -> usize {
        self.lock()
            .stats
            .state_requests
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of sessions currently open
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }
}

#[async_trait]
impl CloudClient for InMemoryCloud {
    async fn login(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let mut state = self.lock();
        let valid = state
            .accounts
            .get(&credentials.email)
            .map_or(false, |password| password == credentials.password().expose_secret());
        if !valid {
            return Err(AuthError::InvalidCredentials(credentials.email.clone()));
        }

        let session = Session::new(Id::new().to_string(), Id::from_string(&credentials.email));
        state.sessions.insert(session.token().expose_secret().to_string());
        state.stats.logins += 1;
        info!(email = %credentials.email, "Logged in to in-memory cloud");
        Ok(session)
    }

    async fn logout(&self, session: &Session) -> Result<(), ClientError> {
        let mut state = self.lock();
        if !state.sessions.remove(session.token().expose_secret()) {
            return Err(ClientError::Session("session already closed".to_string()));
        }
        state.stats.logouts += 1;
        Ok(())
    }

    async fn list_devices(&self, session: &Session) -> Result<Vec<DeviceDescriptor>, ClientError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        state.check_session(session)?;
        state.stats.listings += 1;
        if let Some(err) = state.discovery_failures.pop_front() {
            return Err(err);
        }
        Ok(state.devices.values().cloned().collect())
    }

    async fn device_state(
        &self,
        session: &Session,
        device_id: &Id,
    ) -> Result<StateSnapshot, ClientError> {
        let _in_flight = InFlight::enter(self, device_id);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.check_session(session)?;
        if let Some(err) = state
            .refresh_failures
            .get_mut(device_id)
            .and_then(VecDeque::pop_front)
        {
            debug!(%device_id, error = %err, "Injected refresh failure");
            return Err(err);
        }

        let descriptor = state
            .devices
            .get(device_id)
            .ok_or_else(|| ClientError::Rejected(format!("unknown device {}", device_id)))?;
        if descriptor.status == OnlineStatus::Offline {
            return Err(ClientError::DeviceUnreachable(device_id.to_string()));
        }

        Ok(state.states.get(device_id).cloned().unwrap_or_default())
    }

    async fn subscribe_push(
        &self,
        session: &Session,
    ) -> Result<Option<broadcast::Receiver<PushNotification>>, ClientError> {
        let mut state = self.lock();
        state.check_session(session)?;
        Ok(self.push.as_ref().map(|sender| {
            state.stats.push_subscriptions += 1;
            sender.subscribe()
        }))
    }
}
