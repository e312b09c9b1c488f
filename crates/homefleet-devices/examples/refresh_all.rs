use std::sync::Arc;

use homefleet_core::config::ConfigBuilder;
use homefleet_core::logging;
use homefleet_devices::{
    Capability, Credentials, DeviceFilter, DeviceManager, FleetEvent, InMemoryCloud,
    OnlineStatus,
};

use tracing::info;

const FIXTURE: &str = r#"{
    "accounts": [{ "email": "demo@example.com", "password": "demo" }],
    "devices": [
        {
            "descriptor": { "id": "plug-desk", "name": "Desk plug", "device_type": "mss310",
                            "capabilities": ["toggle", "system_info", "electricity"],
                            "status": "online" },
            "state": [
                { "capability": "toggle",
                  "state": { "channels": [{ "channel": 0, "on": true }] } },
                { "capability": "system_info",
                  "state": { "hardware_type": "mss310", "hardware_version": "2.0.0",
                             "firmware_version": "2.1.17", "mac_address": "48:e1:e9:00:00:01",
                             "lan_ip": "192.168.1.20" } },
                { "capability": "electricity",
                  "state": { "power_w": 41.5, "voltage_v": 229.8, "current_a": 0.18 } }
            ]
        },
        {
            "descriptor": { "id": "bulb-hall", "name": "Hall bulb", "device_type": "msl120",
                            "capabilities": ["light", "system_info"], "status": "online" },
            "state": [
                { "capability": "light",
                  "state": { "rgb": { "red": 255, "green": 160, "blue": 40 }, "luminance": 70 } },
                { "capability": "system_info",
                  "state": { "hardware_type": "msl120", "hardware_version": "3.0.0",
                             "firmware_version": "3.2.4", "mac_address": "48:e1:e9:00:00:02" } }
            ]
        },
        {
            "descriptor": { "id": "plug-garage", "name": "Garage plug", "device_type": "mss210",
                            "capabilities": ["toggle"], "status": "offline" }
        }
    ]
}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration from defaults, overridable through HOMEFLEET__* variables
    let config = ConfigBuilder::new()
        .with_environment_prefix("HOMEFLEET")
        .build()?;
    logging::init_from_config(&config.logging)?;

    let cloud = Arc::new(InMemoryCloud::from_fixture_json(FIXTURE)?.with_push_channel());
    let manager = DeviceManager::connect(
        cloud.clone(),
        &Credentials::new("demo@example.com", "demo"),
        config.manager.clone(),
    )
    .await?;
    manager.initialize().await?;

    // Log fleet events in the background
    let mut events = manager.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                FleetEvent::StatusChanged {
                    id,
                    old_status,
                    new_status,
                } => info!("{} went {} -> {}", id, old_status, new_status),
                other => info!("Fleet event: {:?}", other),
            }
        }
    });

    let report = manager.discover().await?;
    info!("Discovered {} devices", report.added.len());

    let summary = manager.refresh_all().await;
    info!(
        "Refreshed {}, skipped {}, failed {}",
        summary.refreshed.len(),
        summary.skipped.len(),
        summary.failed.len()
    );

    let online_info = DeviceFilter::new()
        .capability(Capability::SystemInfo)
        .status(OnlineStatus::Online);
    for device in manager.find(&online_info) {
        info!(
            "{} ({}): firmware {:?}, mac {:?}",
            device.name(),
            device.device_type(),
            device.firmware_version()?,
            device.mac_address()?
        );
    }

    for device in manager.find(&DeviceFilter::new().capability(Capability::Electricity)) {
        if let Some(reading) = device.electricity()? {
            info!("{} draws {:.1} W", device.name(), reading.power_w);
        }
    }

    // A push from the cloud flips the bulb offline
    cloud.push_status(&"bulb-hall".into(), OnlineStatus::Offline);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    manager.close().await?;
    watcher.abort();
    Ok(())
}
