//! Shared fixtures for unit tests.
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::capability::{
    Capability, CapabilityState, ElectricityReading, LightState, Rgb, SystemInfo, ToggleState,
};
use crate::client::{CloudClient, Credentials, DeviceDescriptor, StateSnapshot};
use crate::device::{Device, DeviceLink, OnlineStatus};
use crate::event::FleetEvent;
use crate::memory::InMemoryCloud;

pub(crate) const EMAIL: &str = "me@example.com";
pub(crate) const PASSWORD: &str = "secret";

pub(crate) fn credentials() -> Credentials {
    Credentials::new(EMAIL, PASSWORD)
}

pub(crate) fn cloud() -> InMemoryCloud {
    InMemoryCloud::new().with_account(EMAIL, PASSWORD)
}

pub(crate) fn system_info(mac: &str) -> SystemInfo {
    SystemInfo {
        hardware_type: "mss310".to_string(),
        hardware_version: "2.0.0".to_string(),
        firmware_version: "2.1.17".to_string(),
        mac_address: mac.to_string(),
        lan_ip: Some("192.168.1.20".to_string()),
    }
}

/// Smart plug: toggle, system info and a power meter
pub(crate) fn plug(id: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(id, format!("Plug {}", id), "mss310")
        .with_capability(Capability::Toggle)
        .with_capability(Capability::SystemInfo)
        .with_capability(Capability::Electricity)
        .with_status(OnlineStatus::Online)
}

pub(crate) fn plug_state(on: bool, power_w: f64) -> StateSnapshot {
    StateSnapshot::new()
        .with_state(CapabilityState::Toggle(ToggleState::single(on)))
        .with_state(CapabilityState::SystemInfo(system_info("48:e1:e9:00:00:01")))
        .with_state(CapabilityState::Electricity(ElectricityReading {
            power_w,
            voltage_v: 230.0,
            current_a: power_w / 230.0,
        }))
}

/// Bulb: light and system info
pub(crate) fn bulb(id: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(id, format!("Bulb {}", id), "msl120")
        .with_capability(Capability::Light)
        .with_capability(Capability::SystemInfo)
        .with_status(OnlineStatus::Online)
}

pub(crate) fn bulb_state(rgb: Rgb) -> StateSnapshot {
    StateSnapshot::new()
        .with_state(CapabilityState::Light(LightState { rgb, luminance: 80 }))
        .with_state(CapabilityState::SystemInfo(system_info("48:e1:e9:00:00:02")))
}

/// Build a device wired to `cloud` with a live session
pub(crate) async fn device(
    cloud: &Arc<InMemoryCloud>,
    descriptor: DeviceDescriptor,
) -> (Device, broadcast::Receiver<FleetEvent>) {
    let session = cloud.login(&credentials()).await.unwrap();
    let (events, rx) = broadcast::channel(64);
    let link = DeviceLink {
        client: cloud.clone(),
        session: Arc::new(session),
        events,
    };
    (Device::from_descriptor(&descriptor, link), rx)
}
