/*!
 * Device registry.
 *
 * An insertion-ordered collection of devices, unique by ID. The collection
 * lives behind an [`Arc`] and is swapped wholesale by discovery, so readers
 * see either the previous set or the next one, never a mix.
 */
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use homefleet_core::types::Id;

use crate::capability::Capability;
use crate::device::{read, write, Device, OnlineStatus};

/// An immutable view of the registry at one point in time
pub type RegistrySnapshot = Arc<IndexMap<Id, Arc<Device>>>;

/// Predicate over devices used by [`DeviceRegistry::find`]
///
/// Every criterion that is set must hold. An empty filter matches every
/// device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    capabilities: Vec<Capability>,
    status: Option<OnlineStatus>,
    device_type: Option<String>,
    name: Option<String>,
    ids: Option<Vec<Id>>,
    listed_only: bool,
}

impl DeviceFilter {
    /// Create a filter that matches every device
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `capability`; may be given several times
    pub fn capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Require this connectivity status
    pub fn status(mut self, status: OnlineStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Require this device model
    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    /// Require this exact name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Require the ID to be one of `ids`
    pub fn ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Id>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Skip devices the last discovery no longer reported
    pub fn listed_only(mut self, listed_only: bool) -> Self {
        self.listed_only = listed_only;
        self
    }

    /// Whether `device` satisfies every criterion, evaluated now
    pub fn matches(&self, device: &Device) -> bool {
        if !self.capabilities.iter().all(|c| device.implements(*c)) {
            return false;
        }
        if let Some(status) = self.status {
            if device.status() != status {
                return false;
            }
        }
        if let Some(device_type) = &self.device_type {
            if device.device_type() != device_type {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if device.name() != name {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(device.id()) {
                return false;
            }
        }
        !self.listed_only || device.listed()
    }
}

/// Insertion-ordered set of discovered devices
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<RegistrySnapshot>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current set of devices
    pub fn snapshot(&self) -> RegistrySnapshot {
        Arc::clone(&read(&self.devices))
    }

    /// Get a device by ID
    pub fn get(&self, id: &Id) -> Option<Arc<Device>> {
        read(&self.devices).get(id).cloned()
    }

    /// Get every device in insertion order
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.snapshot().values().cloned().collect()
    }

    /// Get the number of devices
    pub fn len(&self) -> usize {
        read(&self.devices).len()
    }

    /// Whether the registry holds no device
    pub fn is_empty(&self) -> bool {
        read(&self.devices).is_empty()
    }

    /// Devices matching `filter`, in insertion order
    ///
    /// Evaluated against one snapshot; an empty result is not an error.
    pub fn find(&self, filter: &DeviceFilter) -> Vec<Arc<Device>> {
        self.snapshot()
            .values()
            .filter(|device| filter.matches(device))
            .cloned()
            .collect()
    }

    /// Swap in a new set of devices
    pub(crate) fn replace(&self, next: IndexMap<Id, Arc<Device>>) {
        *write(&self.devices) = Arc::new(next);
    }
}
