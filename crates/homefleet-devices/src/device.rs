/*!
 * Device model.
 *
 * A [`Device`] couples an immutable identity and capability set, discovered
 * from the cloud, with a cache of the last synchronized state and its
 * connectivity status. Accessors are gated by capability membership.
 */
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use homefleet_core::types::Id;

use crate::capability::{
    Capability, CapabilityCache, CapabilitySet, ElectricityReading, Rgb, SystemInfo,
};
use crate::client::{CloudClient, DeviceDescriptor, Session};
use crate::error::CapabilityMismatchError;
use crate::event::FleetEvent;

/// Connectivity classification of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlineStatus {
    /// The device answered recently
    Online,
    /// The cloud reports the device as not connected
    Offline,
    /// Nothing reliable is known
    #[default]
    Unknown,
}

impl fmt::Display for OnlineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OnlineStatus::Online => "online",
            OnlineStatus::Offline => "offline",
            OnlineStatus::Unknown => "unknown",
        })
    }
}

/// Device identity, fixed at discovery time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// The device ID
    pub id: Id,
    /// The device name
    pub name: String,
    /// The device model
    pub device_type: String,
    /// The declared capabilities
    pub capabilities: CapabilitySet,
}

impl From<&DeviceDescriptor> for DeviceInfo {
    fn from(descriptor: &DeviceDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            device_type: descriptor.device_type.clone(),
            capabilities: descriptor.capabilities.iter().copied().collect(),
        }
    }
}

/// What a device needs to reach the cloud and report changes
#[derive(Debug, Clone)]
pub(crate) struct DeviceLink {
    pub(crate) client: Arc<dyn CloudClient>,
    pub(crate) session: Arc<Session>,
    pub(crate) events: broadcast::Sender<FleetEvent>,
}

/// The last synchronized state of a device
#[derive(Debug, Default)]
pub(crate) struct CachedState {
    pub(crate) blocks: CapabilityCache,
    pub(crate) refreshed_at: Option<DateTime<Utc>>,
}

/// A discovered device
pub struct Device {
    info: DeviceInfo,
    pub(crate) link: DeviceLink,
    status: RwLock<OnlineStatus>,
    listed: AtomicBool,
    pub(crate) cache: RwLock<CachedState>,
    /// Held for the whole duration of a refresh
    pub(crate) refresh_guard: Mutex<()>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .field("device_type", &self.info.device_type)
            .field("capabilities", &self.info.capabilities)
            .field("status", &self.status())
            .field("listed", &self.listed())
            .finish()
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Device {
    pub(crate) fn from_descriptor(descriptor: &DeviceDescriptor, link: DeviceLink) -> Self {
        Self {
            info: DeviceInfo::from(descriptor),
            link,
            status: RwLock::new(descriptor.status),
            listed: AtomicBool::new(true),
            cache: RwLock::new(CachedState::default()),
            refresh_guard: Mutex::new(()),
        }
    }

    /// Get the device information
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Get the device ID
    pub fn id(&self) -> &Id {
        &self.info.id
    }

    /// Get the device name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Get the device model
    pub fn device_type(&self) -> &str {
        &self.info.device_type
    }

    /// Get the declared capabilities
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.info.capabilities
    }

    /// Whether the device implements `capability`
    pub fn implements(&self, capability: Capability) -> bool {
        self.info.capabilities.contains(capability)
    }

    /// Last known connectivity status
    pub fn status(&self) -> OnlineStatus {
        *read(&self.status)
    }

    /// Whether the most recent discovery still reported this device
    pub fn listed(&self) -> bool {
        self.listed.load(Ordering::Acquire)
    }

    /// When the cache was last filled by a successful refresh
    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        read(&self.cache).refreshed_at
    }

    /// Fail with [`CapabilityMismatchError`] unless `capability` is declared
    pub fn require(&self, capability: Capability) -> Result<(), CapabilityMismatchError> {
        if self.implements(capability) {
            Ok(())
        } else {
            Err(CapabilityMismatchError {
                device_id: self.info.id.clone(),
                capability,
            })
        }
    }

    fn cached<T>(
        &self,
        capability: Capability,
        f: impl FnOnce(&CapabilityCache) -> Option<T>,
    ) -> Result<Option<T>, CapabilityMismatchError> {
        self.require(capability)?;
        Ok(f(&read(&self.cache).blocks))
    }

    /// Whether the master channel is on; `None` until refreshed
    pub fn is_on(&self) -> Result<Option<bool>, CapabilityMismatchError> {
        self.is_on_channel(0)
    }

    /// Whether `channel` is on; `None` until refreshed or if never reported
    ///
    /// A successful refresh only guarantees channel 0. Other channels stay
    /// `None` when the device does not report them.
    pub fn is_on_channel(&self, channel: u8) -> Result<Option<bool>, CapabilityMismatchError> {
        self.cached(Capability::Toggle, |c| {
            c.toggle.as_ref().and_then(|t| t.is_on(channel))
        })
    }

    /// Every reported channel with its state
    pub fn channels(&self) -> Result<Option<Vec<(u8, bool)>>, CapabilityMismatchError> {
        self.cached(Capability::Toggle, |c| {
            c.toggle.as_ref().map(|t| t.channels().collect())
        })
    }

    /// Current light colour
    pub fn rgb_color(&self) -> Result<Option<Rgb>, CapabilityMismatchError> {
        self.cached(Capability::Light, |c| c.light.map(|l| l.rgb))
    }

    /// Current light brightness, 0 to 100
    pub fn luminance(&self) -> Result<Option<u8>, CapabilityMismatchError> {
        self.cached(Capability::Light, |c| c.light.map(|l| l.luminance))
    }

    /// Full system information block
    pub fn system_info(&self) -> Result<Option<SystemInfo>, CapabilityMismatchError> {
        self.cached(Capability::SystemInfo, |c| c.system.clone())
    }

    /// Installed firmware version
    pub fn firmware_version(&self) -> Result<Option<String>, CapabilityMismatchError> {
        self.cached(Capability::SystemInfo, |c| {
            c.system.as_ref().map(|s| s.firmware_version.clone())
        })
    }

    /// Hardware revision
    pub fn hardware_version(&self) -> Result<Option<String>, CapabilityMismatchError> {
        self.cached(Capability::SystemInfo, |c| {
            c.system.as_ref().map(|s| s.hardware_version.clone())
        })
    }

    /// MAC address
    pub fn mac_address(&self) -> Result<Option<String>, CapabilityMismatchError> {
        self.cached(Capability::SystemInfo, |c| {
            c.system.as_ref().map(|s| s.mac_address.clone())
        })
    }

    /// Latest electricity reading
    pub fn electricity(&self) -> Result<Option<ElectricityReading>, CapabilityMismatchError> {
        self.cached(Capability::Electricity, |c| c.electricity)
    }

    /// Set the status, publishing an event when it changes
    pub(crate) fn set_status(&self, new_status: OnlineStatus) -> OnlineStatus {
        let old_status = {
            let mut status = write(&self.status);
            std::mem::replace(&mut *status, new_status)
        };

        if old_status != new_status {
            debug!(id = %self.info.id, %old_status, %new_status, "Device status changed");
            let _ = self.link.events.send(FleetEvent::StatusChanged {
                id: self.info.id.clone(),
                old_status,
                new_status,
            });
        }
        old_status
    }

    /// Reported again by discovery
    pub(crate) fn relist(&self, status: OnlineStatus) {
        self.listed.store(true, Ordering::Release);
        self.set_status(status);
    }

    /// Missing from discovery: keep it, but as offline and unlisted
    ///
    /// Returns whether the device was listed before.
    pub(crate) fn mark_vanished(&self) -> bool {
        let was_listed = self.listed.swap(false, Ordering::AcqRel);
        self.set_status(OnlineStatus::Offline);
        was_listed
    }

    /// No longer held by the registry: unlisted and offline, without an event
    pub(crate) fn retire(&self) {
        self.listed.store(false, Ordering::Release);
        *write(&self.status) = OnlineStatus::Offline;
    }
}
