/*!
 * Device manager.
 *
 * The manager owns one authenticated session, the device registry and the
 * fleet event channel. It runs discovery, bulk refreshes and the optional
 * push task. Each manager is an explicit instance created and closed by its
 * caller.
 */
use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use homefleet_core::config::{ManagerConfig, VanishedPolicy};
use homefleet_core::logging::operation_span;
use homefleet_core::types::Id;

use crate::client::{CloudClient, Credentials, PushNotification, Session};
use crate::device::{Device, DeviceInfo, DeviceLink, OnlineStatus};
use crate::error::{AuthError, ClientError, DiscoveryError, InitError, RefreshError};
use crate::event::FleetEvent;
use crate::registry::{DeviceFilter, DeviceRegistry};

/// Which devices a bulk refresh covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshScope {
    /// Every device not known to be offline
    #[default]
    Reachable,
    /// Every device in the registry
    All,
}

/// Outcome of a bulk refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Devices refreshed successfully, in completion order
    pub refreshed: Vec<Id>,
    /// Devices left out by the scope
    pub skipped: Vec<Id>,
    /// Per-device failures
    pub failed: Vec<RefreshError>,
}

impl RefreshSummary {
    /// Whether every attempted refresh succeeded
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What one discovery changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Devices seen for the first time
    pub added: Vec<Id>,
    /// Known devices reported again
    pub updated: Vec<Id>,
    /// Known IDs whose name, model or capabilities changed
    pub replaced: Vec<Id>,
    /// Devices no longer reported and marked offline
    pub vanished: Vec<Id>,
    /// Devices no longer reported and dropped
    pub removed: Vec<Id>,
}

#[derive(Debug)]
enum Lifecycle {
    Created,
    Initialized { push: Option<JoinHandle<()>> },
    Closed,
}

/// Owner of one cloud session and the fleet discovered through it
#[derive(Debug)]
pub struct DeviceManager {
    client: Arc<dyn CloudClient>,
    session: Arc<Session>,
    config: ManagerConfig,
    registry: Arc<DeviceRegistry>,
    events: broadcast::Sender<FleetEvent>,
    lifecycle: Mutex<Lifecycle>,
    discovery_guard: Mutex<()>,
}

impl DeviceManager {
    /// Log in and create a manager for the new session
    pub async fn connect(
        client: Arc<dyn CloudClient>,
        credentials: &Credentials,
        config: ManagerConfig,
    ) -> Result<Self, AuthError> {
        let session = client.login(credentials).await?;
        info!(user_id = %session.user_id(), "Logged in");
        Ok(Self::new(client, session, config))
    }

    /// Create a manager for an existing session
    pub fn new(client: Arc<dyn CloudClient>, session: Session, config: ManagerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            client,
            session: Arc::new(session),
            config,
            registry: Arc::new(DeviceRegistry::new()),
            events,
            lifecycle: Mutex::new(Lifecycle::Created),
            discovery_guard: Mutex::new(()),
        }
    }

    /// Get the manager configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Get the session the manager works under
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Get the device registry
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Subscribe to fleet events
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Get a device by ID
    pub fn get(&self, id: &Id) -> Option<Arc<Device>> {
        self.registry.get(id)
    }

    /// Devices matching `filter`, in discovery order
    pub fn find(&self, filter: &DeviceFilter) -> Vec<Arc<Device>> {
        self.registry.find(filter)
    }

    /// Subscribe to push updates, when the client offers them
    ///
    /// Calling this again on an initialized manager does nothing.
    pub async fn initialize(&self) -> Result<(), InitError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Initialized { .. } => {
                debug!("Device manager already initialized");
                return Ok(());
            }
            Lifecycle::Closed => return Err(InitError::Closed),
        }

        let push = match self.client.subscribe_push(&self.session).await? {
            Some(receiver) => Some(tokio::spawn(run_push_loop(
                receiver,
                Arc::clone(&self.registry),
            ))),
            None => {
                debug!("Client offers no push channel");
                None
            }
        };

        info!(push = push.is_some(), "Device manager initialized");
        *lifecycle = Lifecycle::Initialized { push };
        Ok(())
    }

    fn link(&self) -> DeviceLink {
        DeviceLink {
            client: Arc::clone(&self.client),
            session: Arc::clone(&self.session),
            events: self.events.clone(),
        }
    }

    /// List the account's devices and swap in the resulting registry
    ///
    /// Known devices keep their `Arc`, so references held by callers stay
    /// valid. Status and listing changes of kept devices are applied before
    /// the swap. Devices that leave the registry, because they were pruned or
    /// replaced by a new identity, are retired: their handles read as
    /// unlisted and offline. On failure the registry is left as it was.
    pub async fn discover(&self) -> Result<DiscoveryReport, DiscoveryError> {
        self.discover_in_span()
            .instrument(operation_span("discover", "manager"))
            .await
    }

    async fn discover_in_span(&self) -> Result<DiscoveryReport, DiscoveryError> {
        if matches!(*self.lifecycle.lock().await, Lifecycle::Closed) {
            return Err(DiscoveryError::Closed);
        }
        let _guard = self.discovery_guard.lock().await;

        let descriptors = self
            .client
            .list_devices(&self.session)
            .await
            .map_err(|err| {
                warn!(error = %err, "Device listing failed");
                DiscoveryError::Client(err)
            })?;

        let previous = self.registry.snapshot();
        let mut next: IndexMap<Id, Arc<Device>> = (*previous).clone();
        let mut report = DiscoveryReport::default();
        let mut seen = HashSet::new();
        let mut relisted = Vec::new();
        let mut fresh = Vec::new();
        let mut retired = Vec::new();

        for descriptor in descriptors {
            if !seen.insert(descriptor.id.clone()) {
                warn!(id = %descriptor.id, "Duplicate device in listing, keeping the first");
                continue;
            }

            match previous.get(&descriptor.id) {
                Some(existing) if *existing.info() == DeviceInfo::from(&descriptor) => {
                    report.updated.push(descriptor.id.clone());
                    relisted.push((Arc::clone(existing), descriptor.status));
                }
                Some(existing) => {
                    debug!(id = %descriptor.id, "Device identity changed, replacing it");
                    let device = Arc::new(Device::from_descriptor(&descriptor, self.link()));
                    next.insert(descriptor.id.clone(), Arc::clone(&device));
                    report.replaced.push(descriptor.id.clone());
                    retired.push(Arc::clone(existing));
                    fresh.push(device);
                }
                None => {
                    let device = Arc::new(Device::from_descriptor(&descriptor, self.link()));
                    next.insert(descriptor.id.clone(), Arc::clone(&device));
                    report.added.push(descriptor.id.clone());
                    fresh.push(device);
                }
            }
        }

        let mut missing = Vec::new();
        for (id, device) in previous.iter() {
            if seen.contains(id) {
                continue;
            }
            match self.config.vanished_policy {
                VanishedPolicy::MarkOffline => missing.push(Arc::clone(device)),
                VanishedPolicy::Prune => {
                    next.shift_remove(id);
                    report.removed.push(id.clone());
                    retired.push(Arc::clone(device));
                }
            }
        }

        for (device, status) in relisted {
            device.relist(status);
        }
        for device in missing {
            if device.mark_vanished() {
                report.vanished.push(device.id().clone());
            }
        }

        self.registry.replace(next);

        for device in retired {
            device.retire();
        }
        for device in fresh {
            let _ = self.events.send(FleetEvent::DeviceAdded {
                id: device.id().clone(),
                name: device.name().to_string(),
            });
        }
        for id in &report.vanished {
            let _ = self.events.send(FleetEvent::DeviceVanished { id: id.clone() });
        }
        for id in &report.removed {
            let _ = self.events.send(FleetEvent::DeviceRemoved { id: id.clone() });
        }

        info!(
            devices = self.registry.len(),
            added = report.added.len(),
            replaced = report.replaced.len(),
            vanished = report.vanished.len(),
            removed = report.removed.len(),
            "Discovery complete"
        );
        Ok(report)
    }

    /// Refresh the fleet with the configured default scope
    pub async fn refresh_all(&self) -> RefreshSummary {
        let scope = if self.config.skip_offline_on_bulk_refresh {
            RefreshScope::Reachable
        } else {
            RefreshScope::All
        };
        self.refresh_all_with(scope).await
    }

    /// Refresh every device in `scope` concurrently
    ///
    /// At most `max_concurrent_refreshes` requests are in flight. Failures
    /// are collected per device.
    pub async fn refresh_all_with(&self, scope: RefreshScope) -> RefreshSummary {
        self.refresh_in_span(scope)
            .instrument(operation_span("refresh_all", "manager"))
            .await
    }

    async fn refresh_in_span(&self, scope: RefreshScope) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let mut targets = Vec::new();
        for device in self.registry.devices() {
            if scope == RefreshScope::Reachable && device.status() == OnlineStatus::Offline {
                summary.skipped.push(device.id().clone());
            } else {
                targets.push(device);
            }
        }

        let limit = self.config.max_concurrent_refreshes.max(1);
        let mut results = stream::iter(targets)
            .map(|device| async move {
                let result = device.refresh().await;
                (device, result)
            })
            .buffer_unordered(limit);

        while let Some((device, result)) = results.next().await {
            match result {
                Ok(()) => summary.refreshed.push(device.id().clone()),
                Err(err) => summary.failed.push(err),
            }
        }

        info!(
            refreshed = summary.refreshed.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "Bulk refresh complete"
        );
        summary
    }

    /// Stop the push task and log out
    ///
    /// Closing twice is not an error; the second call does nothing. If the
    /// logout fails the push task is still stopped, the manager stays open and
    /// `close` can be called again.
    pub async fn close(&self) -> Result<(), ClientError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match &mut *lifecycle {
            Lifecycle::Closed => return Ok(()),
            Lifecycle::Initialized { push } => {
                if let Some(handle) = push.take() {
                    handle.abort();
                }
            }
            Lifecycle::Created => {}
        }

        if let Err(err) = self.client.logout(&self.session).await {
            warn!(error = %err, "Logout failed, manager left open");
            return Err(err);
        }
        *lifecycle = Lifecycle::Closed;
        info!("Device manager closed");
        Ok(())
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Lifecycle::Initialized { push: Some(handle) } = self.lifecycle.get_mut() {
            handle.abort();
        }
    }
}

async fn run_push_loop(
    mut receiver: broadcast::Receiver<PushNotification>,
    registry: Arc<DeviceRegistry>,
) {
    loop {
        match receiver.recv().await {
            Ok(notification) => apply_push(&registry, notification),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Push channel lagged, notifications dropped");
            }
            Err(RecvError::Closed) => {
                debug!("Push channel closed");
                break;
            }
        }
    }
}

fn apply_push(registry: &DeviceRegistry, notification: PushNotification) {
    match registry.get(&notification.device_id) {
        Some(device) => {
            debug!(id = %notification.device_id, status = %notification.status, "Push update");
            device.set_status(notification.status);
        }
        None => {
            warn!(id = %notification.device_id, "Push for unknown device ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::capability::{Capability, Rgb};
    use crate::client::{DeviceDescriptor, StateSnapshot};
    use crate::error::RefreshErrorKind;
    use crate::fixtures::{bulb, bulb_state, cloud, credentials, plug, plug_state, EMAIL};
    use crate::memory::InMemoryCloud;

    async fn manager(cloud: &Arc<InMemoryCloud>, config: ManagerConfig) -> DeviceManager {
        DeviceManager::connect(cloud.clone(), &credentials(), config)
            .await
            .unwrap()
    }

    fn ids(devices: &[Arc<Device>]) -> Vec<&str> {
        devices.iter().map(|d| d.id().as_str()).collect()
    }

    async fn next_status_change(events: &mut broadcast::Receiver<FleetEvent>) -> FleetEvent {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let event = events.recv().await.unwrap();
                if matches!(event, FleetEvent::StatusChanged { .. }) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[derive(Debug)]
    struct FixedListing(Vec<DeviceDescriptor>);

    #[async_trait]
    impl CloudClient for FixedListing {
        async fn login(&self, credentials: &Credentials) -> Result<Session, AuthError> {
            Ok(Session::new("fixed", Id::from_string(&credentials.email)))
        }

        async fn logout(&self, _session: &Session) -> Result<(), ClientError> {
            Ok(())
        }

        async fn list_devices(
            &self,
            _session: &Session,
        ) -> Result<Vec<DeviceDescriptor>, ClientError> {
            Ok(self.0.clone())
        }

        async fn device_state(
            &self,
            _session: &Session,
            device_id: &Id,
        ) -> Result<StateSnapshot, ClientError> {
            Err(ClientError::Rejected(device_id.to_string()))
        }
    }

    #[derive(Debug, Default)]
    struct FlakyLogout {
        logouts: AtomicUsize,
    }

    #[async_trait]
    impl CloudClient for FlakyLogout {
        async fn login(&self, credentials: &Credentials) -> Result<Session, AuthError> {
            Ok(Session::new("flaky", Id::from_string(&credentials.email)))
        }

        async fn logout(&self, _session: &Session) -> Result<(), ClientError> {
            if self.logouts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ClientError::Connection("reset".into()))
            } else {
                Ok(())
            }
        }

        async fn list_devices(
            &self,
            _session: &Session,
        ) -> Result<Vec<DeviceDescriptor>, ClientError> {
            Ok(Vec::new())
        }

        async fn device_state(
            &self,
            _session: &Session,
            device_id: &Id,
        ) -> Result<StateSnapshot, ClientError> {
            Err(ClientError::Rejected(device_id.to_string()))
        }
    }

    #[tokio::test]
    async fn test_bad_credentials_are_fatal() {
        let cloud = Arc::new(cloud());
        let err = DeviceManager::connect(
            cloud.clone(),
            &Credentials::new(EMAIL, "wrong"),
            ManagerConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials(_)));
        assert_eq!(cloud.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_empty_discovery_finds_nothing() {
        let cloud = Arc::new(cloud());
        let manager = manager(&cloud, ManagerConfig::default()).await;

        let report = manager.discover().await.unwrap();
        assert_eq!(report, DiscoveryReport::default());
        assert!(manager.registry().is_empty());
        assert!(manager
            .find(&DeviceFilter::new().capability(Capability::SystemInfo))
            .is_empty());
    }

    #[tokio::test]
    async fn test_discovery_populates_in_listing_order() {
        let cloud = Arc::new(cloud());
        cloud.add_device(plug("plug-1"), None);
        cloud.add_device(bulb("bulb-1").with_status(OnlineStatus::Offline), None);
        let manager = manager(&cloud, ManagerConfig::default()).await;
        let mut events = manager.subscribe();

        let report = manager.discover().await.unwrap();
        assert_eq!(report.added, vec![Id::from("plug-1"), Id::from("bulb-1")]);
        assert_eq!(ids(&manager.registry().devices()), vec!["plug-1", "bulb-1"]);

        let bulb = manager.get(&Id::from("bulb-1")).unwrap();
        assert_eq!(bulb.status(), OnlineStatus::Offline);
        assert_eq!(bulb.rgb_color(), Ok(None));
        assert_eq!(
            events.try_recv().unwrap(),
            FleetEvent::DeviceAdded {
                id: Id::from("plug-1"),
                name: "Plug plug-1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_rediscovery_keeps_device_handles() {
        let cloud = Arc::new(cloud());
        cloud.add_device(plug("plug-1"), Some(plug_state(true, 4.0)));
        let manager = manager(&cloud, ManagerConfig::default()).await;
        manager.discover().await.unwrap();

        let held = manager.get(&Id::from("plug-1")).unwrap();
        held.refresh().await.unwrap();

        cloud.set_status(held.id(), OnlineStatus::Offline);
        let report = manager.discover().await.unwrap();
        assert_eq!(report.updated, vec![Id::from("plug-1")]);
        assert!(report.added.is_empty());

        let again = manager.get(&Id::from("plug-1")).unwrap();
        assert!(Arc::ptr_eq(&held, &again));
        assert_eq!(held.status(), OnlineStatus::Offline);
        assert_eq!(held.is_on(), Ok(Some(true)));
    }

    #[tokio::test]
    async fn test_vanished_device_is_marked_offline() {
        let cloud = Arc::new(cloud());
        cloud.add_device(plug("plug-1"), None);
        cloud.add_device(bulb("bulb-1"), None);
        let manager = manager(&cloud, ManagerConfig::default()).await;
        manager.discover().await.unwrap();
        let held = manager.get(&Id::from("plug-1")).unwrap();

        cloud.remove_device(held.id());
        let report = manager.discover().await.unwrap();
        assert_eq!(report.vanished, vec![Id::from("plug-1")]);
        assert!(!held.listed());
        assert_eq!(held.status(), OnlineStatus::Offline);
        assert_eq!(manager.registry().len(), 2);
        assert_eq!(
            ids(&manager.find(&DeviceFilter::new().listed_only(true))),
            vec!["bulb-1"]
        );

        let report = manager.discover().await.unwrap();
        assert!(report.vanished.is_empty());

        cloud.add_device(plug("plug-1"), None);
        let report = manager.discover().await.unwrap();
        assert_eq!(report.updated, vec![Id::from("bulb-1"), Id::from("plug-1")]);
        assert!(held.listed());
        assert_eq!(held.status(), OnlineStatus::Online);
        assert!(Arc::ptr_eq(&held, &manager.get(held.id()).unwrap()));
        assert_eq!(ids(&manager.registry().devices()), vec!["plug-1", "bulb-1"]);
    }

    #[tokio::test]
    async fn test_prune_policy_drops_vanished_device() {
        let cloud = Arc::new(cloud());
        cloud.add_device(plug("plug-1"), None);
        let config = ManagerConfig {
            vanished_policy: VanishedPolicy::Prune,
            ..ManagerConfig::default()
        };
        let manager = manager(&cloud, config).await;
        manager.discover().await.unwrap();
        let held = manager.get(&Id::from("plug-1")).unwrap();
        let mut events = manager.subscribe();

        cloud.remove_device(held.id());
        let report = manager.discover().await.unwrap();
        assert_eq!(report.removed, vec![Id::from("plug-1")]);
        assert!(manager.registry().is_empty());
        assert_eq!(held.name(), "Plug plug-1");
        assert!(!held.listed());
        assert_eq!(held.status(), OnlineStatus::Offline);
        assert_eq!(
            events.try_recv().unwrap(),
            FleetEvent::DeviceRemoved {
                id: Id::from("plug-1")
            }
        );
    }

    #[tokio::test]
    async fn test_changed_identity_replaces_device() {
        let cloud = Arc::new(cloud());
        cloud.add_device(bulb("bulb-1"), None);
        let manager = manager(&cloud, ManagerConfig::default()).await;
        manager.discover().await.unwrap();
        let old = manager.get(&Id::from("bulb-1")).unwrap();

        cloud.add_device(bulb("bulb-1").with_capability(Capability::Toggle), None);
        let report = manager.discover().await.unwrap();
        assert_eq!(report.replaced, vec![Id::from("bulb-1")]);

        let new = manager.get(&Id::from("bulb-1")).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(new.implements(Capability::Toggle));
        assert!(!old.implements(Capability::Toggle));
        assert!(new.listed());
        assert_eq!(new.status(), OnlineStatus::Online);
        assert!(!old.listed());
        assert_eq!(old.status(), OnlineStatus::Offline);
    }

    #[tokio::test]
    async fn test_statuses_settle_before_new_devices_are_announced() {
        let cloud = Arc::new(cloud());
        cloud.add_device(plug("plug-1"), None);
        let manager = manager(&cloud, ManagerConfig::default()).await;
        manager.discover().await.unwrap();
        let mut events = manager.subscribe();

        cloud.set_status(&Id::from("plug-1"), OnlineStatus::Offline);
        cloud.add_device(bulb("bulb-1"), None);
        manager.discover().await.unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            FleetEvent::StatusChanged {
                id: Id::from("plug-1"),
                old_status: OnlineStatus::Online,
                new_status: OnlineStatus::Offline,
            }
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            FleetEvent::DeviceAdded { id, .. } if id == Id::from("bulb-1")
        ));
    }

    #[tokio::test]
    async fn test_cancelled_discovery_leaves_registry() {
        let cloud = Arc::new(cloud().with_latency(Duration::from_millis(100)));
        cloud.add_device(plug("plug-1"), None);
        let manager = manager(&cloud, ManagerConfig::default()).await;
        manager.discover().await.unwrap();
        let held = manager.get(&Id::from("plug-1")).unwrap();

        cloud.remove_device(held.id());
        cloud.add_device(bulb("bulb-1"), None);
        let cancelled = tokio::time::timeout(Duration::from_millis(10), manager.discover()).await;
        assert!(cancelled.is_err());
        assert_eq!(ids(&manager.registry().devices()), vec!["plug-1"]);
        assert!(held.listed());
        assert_eq!(held.status(), OnlineStatus::Online);
        assert!(manager.discovery_guard.try_lock().is_ok());

        let report = manager.discover().await.unwrap();
        assert_eq!(report.added, vec![Id::from("bulb-1")]);
        assert_eq!(report.vanished, vec![Id::from("plug-1")]);
    }

    #[tokio::test]
    async fn test_find_during_discovery_sees_previous_fleet() {
        let cloud = Arc::new(cloud().with_latency(Duration::from_millis(50)));
        cloud.add_device(plug("plug-1"), None);
        let manager = manager(&cloud, ManagerConfig::default()).await;
        manager.discover().await.unwrap();

        cloud.add_device(bulb("bulb-1"), None);
        cloud.add_device(plug("plug-2"), None);
        let all = DeviceFilter::new();
        let (report, during) = tokio::join!(manager.discover(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.find(&all)
        });

        assert_eq!(report.unwrap().added.len(), 2);
        assert_eq!(ids(&during), vec!["plug-1"]);
        assert_eq!(ids(&manager.find(&all)), vec!["plug-1", "bulb-1", "plug-2"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_find_sees_old_or_new_fleet() {
        let cloud = Arc::new(cloud().with_latency(Duration::from_millis(20)));
        cloud.add_device(plug("plug-1"), None);
        cloud.add_device(plug("plug-2"), None);
        let manager = Arc::new(manager(&cloud, ManagerConfig::default()).await);
        manager.discover().await.unwrap();

        cloud.remove_device(&Id::from("plug-1"));
        cloud.add_device(bulb("bulb-1"), None);
        let done = Arc::new(AtomicBool::new(false));
        let finder = tokio::spawn({
            let manager = Arc::clone(&manager);
            let done = Arc::clone(&done);
            async move {
                let mut seen: Vec<Vec<String>> = Vec::new();
                while !done.load(Ordering::Acquire) {
                    let found = manager.find(&DeviceFilter::new());
                    seen.push(found.iter().map(|d| d.id().to_string()).collect());
                    tokio::task::yield_now().await;
                }
                seen
            }
        });

        manager.discover().await.unwrap();
        done.store(true, Ordering::Release);
        let seen = finder.await.unwrap();

        let old = vec!["plug-1", "plug-2"];
        let new = vec!["plug-1", "plug-2", "bulb-1"];
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|found| *found == old || *found == new));
    }

    #[tokio::test]
    async fn test_duplicate_ids_keep_first() {
        let client = Arc::new(FixedListing(vec![
            DeviceDescriptor::new("dup", "First", "mss210").with_capability(Capability::Toggle),
            DeviceDescriptor::new("other", "Other", "msl120").with_capability(Capability::Light),
            DeviceDescriptor::new("dup", "Second", "msl120").with_capability(Capability::Light),
        ]));
        let manager = DeviceManager::connect(client, &credentials(), ManagerConfig::default())
            .await
            .unwrap();

        let report = manager.discover().await.unwrap();
        assert_eq!(report.added.len(), 2);
        let dup = manager.get(&Id::from("dup")).unwrap();
        assert_eq!(dup.name(), "First");
        assert!(dup.implements(Capability::Toggle));
    }

    #[tokio::test]
    async fn test_failed_discovery_leaves_registry() {
        let cloud = Arc::new(cloud());
        cloud.add_device(plug("plug-1"), None);
        let manager = manager(&cloud, ManagerConfig::default()).await;
        manager.discover().await.unwrap();

        cloud.add_device(bulb("bulb-1"), None);
        cloud.fail_next_discovery(ClientError::Connection("reset".into()));
        let err = manager.discover().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Client(ClientError::Connection(_))));
        assert_eq!(ids(&manager.registry().devices()), vec!["plug-1"]);

        manager.discover().await.unwrap();
        assert_eq!(manager.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_bulk_refresh_skips_offline_by_default() {
        let cloud = Arc::new(cloud());
        cloud.add_device(plug("plug-1"), Some(plug_state(true, 1.0)));
        cloud.add_device(
            bulb("bulb-1").with_status(OnlineStatus::Offline),
            Some(bulb_state(Rgb::new(1, 2, 3))),
        );
        let manager = manager(&cloud, ManagerConfig::default()).await;
        manager.discover().await.unwrap();

        let summary = manager.refresh_all().await;
        assert_eq!(summary.refreshed, vec![Id::from("plug-1")]);
        assert_eq!(summary.skipped, vec![Id::from("bulb-1")]);
        assert!(summary.is_complete());
        assert_eq!(cloud.state_requests(&Id::from("bulb-1")), 0);

        let summary = manager.refresh_all_with(RefreshScope::All).await;
        assert!(summary.skipped.is_empty());
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].device_id, Id::from("bulb-1"));
        assert!(matches!(
            summary.failed[0].kind,
            RefreshErrorKind::Client(ClientError::DeviceUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_config_can_include_offline_devices() {
        let cloud = Arc::new(cloud());
        let bulb_id = Id::from("bulb-1");
        cloud.add_device(
            bulb("bulb-1").with_status(OnlineStatus::Offline),
            Some(bulb_state(Rgb::new(1, 2, 3))),
        );
        let config = ManagerConfig {
            skip_offline_on_bulk_refresh: false,
            ..ManagerConfig::default()
        };
        let manager = manager(&cloud, config).await;
        manager.discover().await.unwrap();

        cloud.set_status(&bulb_id, OnlineStatus::Online);
        let summary = manager.refresh_all().await;
        assert_eq!(summary.refreshed, vec![bulb_id.clone()]);
        assert_eq!(manager.get(&bulb_id).unwrap().status(), OnlineStatus::Online);
    }

    #[tokio::test]
    async fn test_bulk_refresh_is_bounded() {
        let cloud = Arc::new(cloud().with_latency(Duration::from_millis(20)));
        for n in 0..6 {
            cloud.add_device(plug(&format!("plug-{}", n)), Some(plug_state(true, 1.0)));
        }
        let config = ManagerConfig {
            max_concurrent_refreshes: 2,
            ..ManagerConfig::default()
        };
        let manager = manager(&cloud, config).await;
        manager.discover().await.unwrap();

        let summary = manager.refresh_all().await;
        assert_eq!(summary.refreshed.len(), 6);
        assert_eq!(cloud.stats().peak_in_flight, 2);
    }

    #[tokio::test]
    async fn test_bulk_refresh_reports_each_failure() {
        let cloud = Arc::new(cloud());
        cloud.add_device(plug("plug-1"), Some(plug_state(true, 1.0)));
        cloud.add_device(plug("plug-2"), Some(plug_state(false, 0.0)));
        let manager = manager(&cloud, ManagerConfig::default()).await;
        manager.discover().await.unwrap();

        cloud.fail_next_refresh(&Id::from("plug-2"), ClientError::Timeout("slow".into()));
        let summary = manager.refresh_all().await;
        assert!(!summary.is_complete());
        assert_eq!(summary.refreshed, vec![Id::from("plug-1")]);
        assert_eq!(summary.failed[0].device_id, Id::from("plug-2"));
        assert_eq!(
            manager.get(&Id::from("plug-2")).unwrap().status(),
            OnlineStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_initialize_subscribes_once() {
        let cloud = Arc::new(cloud().with_push_channel());
        let manager = manager(&cloud, ManagerConfig::default()).await;

        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();
        assert_eq!(cloud.stats().push_subscriptions, 1);
    }

    #[tokio::test]
    async fn test_initialize_without_push_channel() {
        let cloud = Arc::new(cloud());
        let manager = manager(&cloud, ManagerConfig::default()).await;

        manager.initialize().await.unwrap();
        assert_eq!(cloud.stats().push_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_push_updates_status_only() {
        let cloud = Arc::new(cloud().with_push_channel());
        cloud.add_device(plug("plug-1"), Some(plug_state(true, 2.0)));
        let manager = manager(&cloud, ManagerConfig::default()).await;
        manager.initialize().await.unwrap();
        manager.discover().await.unwrap();
        let device = manager.get(&Id::from("plug-1")).unwrap();
        device.refresh().await.unwrap();
        let mut events = manager.subscribe();

        cloud.push_status(&Id::from("ghost"), OnlineStatus::Online);
        cloud.push_status(device.id(), OnlineStatus::Offline);

        assert_eq!(
            next_status_change(&mut events).await,
            FleetEvent::StatusChanged {
                id: device.id().clone(),
                old_status: OnlineStatus::Online,
                new_status: OnlineStatus::Offline,
            }
        );
        assert_eq!(device.status(), OnlineStatus::Offline);
        assert_eq!(device.is_on(), Ok(Some(true)));
    }

    #[tokio::test]
    async fn test_close_ends_the_session() {
        let cloud = Arc::new(cloud().with_push_channel());
        let manager = manager(&cloud, ManagerConfig::default()).await;
        manager.initialize().await.unwrap();
        assert_eq!(cloud.open_sessions(), 1);

        manager.close().await.unwrap();
        assert_eq!(cloud.open_sessions(), 0);
        assert_eq!(cloud.stats().logouts, 1);

        manager.close().await.unwrap();
        assert_eq!(cloud.stats().logouts, 1);
        assert!(matches!(manager.initialize().await, Err(InitError::Closed)));
        assert!(matches!(manager.discover().await, Err(DiscoveryError::Closed)));
    }

    #[tokio::test]
    async fn test_failed_logout_keeps_manager_open() {
        let client = Arc::new(FlakyLogout::default());
        let manager = DeviceManager::connect(client.clone(), &credentials(), ManagerConfig::default())
            .await
            .unwrap();
        manager.initialize().await.unwrap();

        let err = manager.close().await.unwrap_err();
        assert_eq!(err, ClientError::Connection("reset".into()));
        assert!(manager.discover().await.is_ok());

        manager.close().await.unwrap();
        assert_eq!(client.logouts.load(Ordering::SeqCst), 2);
        assert!(matches!(manager.initialize().await, Err(InitError::Closed)));

        manager.close().await.unwrap();
        assert_eq!(client.logouts.load(Ordering::SeqCst), 2);
    }
}
