/*!
 * Refresh protocol.
 *
 * Pulls the authoritative state of one device into its cache. Refreshes of
 * one device are serialized by its refresh guard; distinct devices refresh
 * independently. The cache is replaced in one step after the last await, so
 * a failed or cancelled refresh never leaves a partial write behind.
 */
use chrono::Utc;
use tracing::{debug, warn, Instrument};

use homefleet_core::logging::device_span;

use crate::capability::CapabilityCache;
use crate::device::{write, Device, OnlineStatus};
use crate::error::{ClientError, Connectivity, RefreshError, RefreshErrorKind};
use crate::event::FleetEvent;

/// Status a device takes after a failed state request
///
/// A failure that says nothing about connectivity leaves `current` as is.
pub fn status_after_failure(current: OnlineStatus, error: &ClientError) -> OnlineStatus {
    match error.connectivity() {
        Connectivity::CloudUnreachable => OnlineStatus::Unknown,
        Connectivity::DeviceUnreachable => OnlineStatus::Offline,
        Connectivity::Established => current,
    }
}

impl Device {
    /// Fetch the device's full state and replace its cache
    ///
    /// On success every accessor of a declared capability returns a value
    /// and the status becomes [`OnlineStatus::Online`]. On failure the cache
    /// keeps its previous values; the status follows
    /// [`status_after_failure`]. A device known to be offline is still
    /// queried. Nothing is retried.
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        self.refresh_serialized()
            .instrument(device_span(self.id().as_str()))
            .await
    }

    async fn refresh_serialized(&self) -> Result<(), RefreshError> {
        let _guard = self.refresh_guard.lock().await;
        debug!("Requesting device state");

        let snapshot = match self
            .link
            .client
            .device_state(&self.link.session, self.id())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let status = status_after_failure(self.status(), &err);
                self.set_status(status);
                warn!(error = %err, %status, "Refresh failed");
                return Err(RefreshError::new(self.id().clone(), err));
            }
        };

        let blocks = CapabilityCache::from_states(self.capabilities(), snapshot).map_err(|missing| {
            warn!(capability = %missing, "Refresh returned an incomplete snapshot");
            RefreshError::new(
                self.id().clone(),
                RefreshErrorKind::IncompleteSnapshot(missing),
            )
        })?;

        let at = Utc::now();
        {
            let mut cache = write(&self.cache);
            cache.blocks = blocks;
            cache.refreshed_at = Some(at);
        }
        self.set_status(OnlineStatus::Online);
        let _ = self.link.events.send(FleetEvent::StateRefreshed {
            id: self.id().clone(),
            at,
        });

        debug!("Device state refreshed");
        Ok(())
    }
}
