/*!
 * Fleet events published by the manager and its devices.
 */
use chrono::{DateTime, Utc};

use homefleet_core::types::Id;

use crate::device::OnlineStatus;

/// A change in the fleet
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    /// Discovery found a new device
    DeviceAdded {
        /// The device ID
        id: Id,
        /// The device name
        name: String,
    },
    /// Discovery no longer reports a device; it was kept as offline
    DeviceVanished {
        /// The device ID
        id: Id,
    },
    /// Discovery no longer reports a device; it was dropped
    DeviceRemoved {
        /// The device ID
        id: Id,
    },
    /// A device's connectivity status changed
    StatusChanged {
        /// The device ID
        id: Id,
        /// The previous status
        old_status: OnlineStatus,
        /// The new status
        new_status: OnlineStatus,
    },
    /// A device's cache was replaced by a successful refresh
    StateRefreshed {
        /// The device ID
        id: Id,
        /// When the new state was committed
        at: DateTime<Utc>,
    },
}

impl FleetEvent {
    /// The device the event is about
    pub fn device_id(&self) -> &Id {
        match self {
            FleetEvent::DeviceAdded { id, .. }
            | FleetEvent::DeviceVanished { id }
            | FleetEvent::DeviceRemoved { id }
            | FleetEvent::StatusChanged { id, .. }
            | FleetEvent::StateRefreshed { id, .. } => id,
        }
    }
}
