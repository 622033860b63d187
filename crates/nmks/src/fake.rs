//! In-memory network service for tests.
//!
//! Behaves like a small NetworkManager: dummy profiles get a device that
//! activates on a later loop turn, deletions disconnect and drop the
//! device, route changes reach the kernel table only on reapply. Every
//! call is recorded in order.

use crate::client::NmClient;
use crate::error::Result;
use crate::profile::{ConnectionProfile, IpRoute};
use crate::routes::RouteTable;
use crate::service::{
    ActiveConnection, Completion, DeviceInfo, DeviceState, DeviceType, NetworkService,
    PropertyTarget, PropertyValue, ServiceBox, ServiceError, ServiceHandle, StateHandler,
    StoredConnection, SubscriptionId,
};
use crate::connectivity::CONNECTIVITY_CHECK_PROPERTY;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Call issued to the fake service
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServiceCall {
    AddConnection { id: String, save_to_disk: bool },
    DeleteConnection { id: String },
    SetConnectivityCheck { enabled: bool },
    SetProperty { property_name: String, value: PropertyValue },
    AddRoute { interface_name: String, route: IpRoute },
    RemoveRoute { interface_name: String, route: IpRoute },
    CommitChanges { interface_name: String, save_to_disk: bool },
    Reapply { interface_name: String },
}

struct FakeDevice {
    device_type: DeviceType,
    state: DeviceState,
    active_connection: Option<String>,
    gateway: Option<String>,
    dhcp4: HashMap<String, String>,
    /// Routes of the device's connection
    routes: Vec<IpRoute>,
    /// Routes the kernel knows about
    applied: Vec<IpRoute>,
    subscribers: Vec<(SubscriptionId, StateHandler)>,
}

impl FakeDevice {
    fn new(device_type: DeviceType, state: DeviceState, active_connection: Option<String>) -> Self {
        Self {
            device_type,
            state,
            active_connection,
            gateway: None,
            dhcp4: HashMap::new(),
            routes: Vec::new(),
            applied: Vec::new(),
            subscribers: Vec::new(),
        }
    }
}

struct FakeState {
    version: String,
    running: bool,
    connectivity_check: bool,
    activate_immediately: bool,
    activation_outcome: DeviceState,
    fail_next_add: Option<String>,
    fail_next_delete: Option<String>,
    next_subscription: u64,
    devices: BTreeMap<String, FakeDevice>,
    connections: BTreeMap<String, StoredConnection>,
    calls: Vec<ServiceCall>,
    added_profiles: Vec<ConnectionProfile>,
    handle: Option<ServiceHandle>,
}

/// Test-side view of the fake service
#[derive(Clone)]
pub(crate) struct FakeNetwork {
    state: Arc<Mutex<FakeState>>,
}

/// The loop-confined half handed to the client
struct FakeService {
    state: Arc<Mutex<FakeState>>,
    handle: ServiceHandle,
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap()
}

/// Move a device to `new_state` and notify its subscribers. Handlers are
/// called without the lock held.
fn transition(state: &Arc<Mutex<FakeState>>, iface: &str, new_state: DeviceState, remove: bool) {
    let mut subscribers = {
        let mut guard = lock(state);
        let Some(device) = guard.devices.get_mut(iface) else {
            return;
        };
        device.state = new_state;
        if new_state != DeviceState::Activated {
            device.active_connection = None;
        }
        std::mem::take(&mut device.subscribers)
    };

    for (_, handler) in subscribers.iter_mut() {
        handler(new_state);
    }

    let mut guard = lock(state);
    if remove {
        guard.devices.remove(iface);
        return;
    }
    if let Some(device) = guard.devices.get_mut(iface) {
        subscribers.append(&mut device.subscribers);
        device.subscribers = subscribers;
    }
}

impl FakeNetwork {
    pub(crate) fn new() -> Self {
        init_tracing();
        Self {
            state: Arc::new(Mutex::new(FakeState {
                version: "1.46.0".to_string(),
                running: true,
                connectivity_check: false,
                activate_immediately: false,
                activation_outcome: DeviceState::Activated,
                fail_next_add: None,
                fail_next_delete: None,
                next_subscription: 1,
                devices: BTreeMap::new(),
                connections: BTreeMap::new(),
                calls: Vec::new(),
                added_profiles: Vec::new(),
                handle: None,
            })),
        }
    }

    /// Service object to create on the loop thread.
    pub(crate) fn service(&self, handle: &ServiceHandle) -> ServiceBox {
        lock(&self.state).handle = Some(handle.clone());
        Box::new(FakeService {
            state: self.state.clone(),
            handle: handle.clone(),
        })
    }

    /// Client on a fresh loop running this service.
    pub(crate) fn client(&self) -> NmClient {
        let network = self.clone();
        NmClient::spawn(move |handle| Ok(network.service(handle))).unwrap()
    }

    pub(crate) fn route_table(&self) -> Arc<dyn RouteTable> {
        Arc::new(FakeRouteTable {
            state: self.state.clone(),
        })
    }

    pub(crate) fn set_version(&self, version: &str) {
        lock(&self.state).version = version.to_string();
    }

    pub(crate) fn set_running(&self, running: bool) {
        lock(&self.state).running = running;
    }

    pub(crate) fn set_connectivity_check(&self, enabled: bool) {
        lock(&self.state).connectivity_check = enabled;
    }

    /// New dummy devices come up already activated.
    pub(crate) fn set_activate_immediately(&self, immediate: bool) {
        lock(&self.state).activate_immediately = immediate;
    }

    /// State new dummy devices end in. `Prepare` means they never move.
    pub(crate) fn set_activation_outcome(&self, outcome: DeviceState) {
        lock(&self.state).activation_outcome = outcome;
    }

    pub(crate) fn fail_next_add(&self, reason: &str) {
        lock(&self.state).fail_next_add = Some(reason.to_string());
    }

    pub(crate) fn fail_next_delete(&self, reason: &str) {
        lock(&self.state).fail_next_delete = Some(reason.to_string());
    }

    pub(crate) fn add_device(&self, iface: &str, device_type: DeviceType, connection: Option<&str>) {
        let state = if connection.is_some() {
            DeviceState::Activated
        } else {
            DeviceState::Disconnected
        };
        lock(&self.state).devices.insert(
            iface.to_string(),
            FakeDevice::new(device_type, state, connection.map(str::to_string)),
        );
    }

    /// Stored, active dummy connection, as left by an earlier session.
    pub(crate) fn seed_connection(&self, id: &str, iface: &str) {
        let mut state = lock(&self.state);
        state.connections.insert(
            id.to_string(),
            StoredConnection {
                id: id.to_string(),
                uuid: uuid::Uuid::new_v4().to_string(),
                interface_name: iface.to_string(),
            },
        );
        state.devices.insert(
            iface.to_string(),
            FakeDevice::new(DeviceType::Dummy, DeviceState::Activated, Some(id.to_string())),
        );
    }

    pub(crate) fn set_static_gateway(&self, iface: &str, gateway: &str) {
        if let Some(device) = lock(&self.state).devices.get_mut(iface) {
            device.gateway = Some(gateway.to_string());
        }
    }

    pub(crate) fn set_dhcp_routers(&self, iface: &str, routers: &str) {
        if let Some(device) = lock(&self.state).devices.get_mut(iface) {
            device.dhcp4.insert("routers".to_string(), routers.to_string());
        }
    }

    pub(crate) fn routes(&self, iface: &str) -> Vec<IpRoute> {
        lock(&self.state)
            .devices
            .get(iface)
            .map(|device| device.routes.clone())
            .unwrap_or_default()
    }

    pub(crate) fn calls(&self) -> Vec<ServiceCall> {
        lock(&self.state).calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub(crate) fn added_profiles(&self) -> Vec<ConnectionProfile> {
        lock(&self.state).added_profiles.clone()
    }

    /// Ids of active connections, sorted.
    pub(crate) fn active_ids(&self) -> Vec<String> {
        let state = lock(&self.state);
        let mut ids: Vec<String> = state
            .devices
            .values()
            .filter(|device| device.state == DeviceState::Activated)
            .filter_map(|device| device.active_connection.clone())
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn stored_ids(&self) -> Vec<String> {
        lock(&self.state).connections.keys().cloned().collect()
    }

    /// Drain the loop, then check every state subscription was dropped.
    pub(crate) async fn wait_for_no_subscriptions(&self) {
        let handle = lock(&self.state).handle.clone().unwrap();
        // Unsubscribe jobs are queued before the result reaches the caller,
        // so one round trip is enough.
        handle.run(|_, _| ()).wait(Duration::from_secs(2)).await.unwrap();

        let state = lock(&self.state);
        let remaining: usize = state.devices.values().map(|d| d.subscribers.len()).sum();
        assert_eq!(remaining, 0, "state subscriptions left behind");
    }
}

impl FakeService {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        lock(&self.state)
    }

    fn record(&self, call: ServiceCall) {
        self.lock().calls.push(call);
    }
}

impl NetworkService for FakeService {
    fn version(&self) -> String {
        self.lock().version.clone()
    }

    fn is_running(&self) -> bool {
        self.lock().running
    }

    fn connectivity_check_enabled(&self) -> bool {
        self.lock().connectivity_check
    }

    fn set_connectivity_check_enabled(&mut self, enabled: bool) -> std::result::Result<(), ServiceError> {
        self.record(ServiceCall::SetConnectivityCheck { enabled });
        self.lock().connectivity_check = enabled;
        Ok(())
    }

    fn set_property(&mut self, target: PropertyTarget, value: PropertyValue, done: Completion<()>) {
        self.record(ServiceCall::SetProperty {
            property_name: target.property_name.clone(),
            value: value.clone(),
        });
        if target.property_name == CONNECTIVITY_CHECK_PROPERTY {
            if let PropertyValue::Bool(enabled) = value {
                self.lock().connectivity_check = enabled;
            }
        }
        done(Ok(()));
    }

    fn add_connection(
        &mut self,
        profile: ConnectionProfile,
        save_to_disk: bool,
        done: Completion<StoredConnection>,
    ) {
        let (stored, immediate, outcome) = {
            let mut state = self.lock();
            state.calls.push(ServiceCall::AddConnection {
                id: profile.id.clone(),
                save_to_disk,
            });
            state.added_profiles.push(profile.clone());

            if let Some(reason) = state.fail_next_add.take() {
                drop(state);
                done(Err(ServiceError::new(reason)));
                return;
            }

            let stored = StoredConnection {
                id: profile.id.clone(),
                uuid: profile.uuid.to_string(),
                interface_name: profile.interface_name.clone(),
            };
            state.connections.insert(profile.id.clone(), stored.clone());

            let immediate = state.activate_immediately;
            let outcome = state.activation_outcome;
            let (device_state, active) = if immediate && outcome == DeviceState::Activated {
                (DeviceState::Activated, Some(profile.id.clone()))
            } else if immediate {
                (outcome, None)
            } else {
                (DeviceState::Prepare, None)
            };
            state.devices.insert(
                profile.interface_name.clone(),
                FakeDevice::new(DeviceType::Dummy, device_state, active),
            );
            (stored, immediate, outcome)
        };

        let iface = stored.interface_name.clone();
        let id = stored.id.clone();
        done(Ok(stored));

        if immediate || outcome == DeviceState::Prepare {
            return;
        }
        let state = self.state.clone();
        self.handle.invoke(move |_, _| {
            if outcome == DeviceState::Activated {
                if let Some(device) = lock(&state).devices.get_mut(&iface) {
                    device.active_connection = Some(id);
                }
            }
            transition(&state, &iface, outcome, false);
        });
    }

    fn delete_connection(&mut self, connection: &StoredConnection, done: Completion<()>) {
        let bound = {
            let mut state = self.lock();
            state.calls.push(ServiceCall::DeleteConnection {
                id: connection.id.clone(),
            });
            if let Some(reason) = state.fail_next_delete.take() {
                drop(state);
                done(Err(ServiceError::new(reason)));
                return;
            }
            if state.connections.remove(&connection.id).is_none() {
                drop(state);
                done(Err(ServiceError::new(format!("no connection {}", connection.id))));
                return;
            }
            state.devices.contains_key(&connection.interface_name)
        };

        done(Ok(()));
        if bound {
            let state = self.state.clone();
            let iface = connection.interface_name.clone();
            self.handle.invoke(move |_, _| {
                transition(&state, &iface, DeviceState::Disconnected, true);
            });
        }
    }

    fn active_connections(&self) -> Vec<ActiveConnection> {
        self.lock()
            .devices
            .iter()
            .filter(|(_, device)| device.state == DeviceState::Activated)
            .filter_map(|(iface, device)| {
                device.active_connection.as_ref().map(|id| ActiveConnection {
                    id: id.clone(),
                    interface_name: iface.clone(),
                })
            })
            .collect()
    }

    fn connection_by_id(&self, id: &str) -> Option<StoredConnection> {
        self.lock().connections.get(id).cloned()
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.lock()
            .devices
            .iter()
            .map(|(iface, device)| DeviceInfo {
                interface_name: iface.clone(),
                device_type: device.device_type,
                state: device.state,
                active_connection: device.active_connection.clone(),
            })
            .collect()
    }

    fn device_state(&self, interface_name: &str) -> Option<DeviceState> {
        self.lock().devices.get(interface_name).map(|device| device.state)
    }

    fn subscribe_state_changed(
        &mut self,
        interface_name: &str,
        handler: StateHandler,
    ) -> Option<SubscriptionId> {
        let mut state = self.lock();
        let id = SubscriptionId(state.next_subscription);
        let device = state.devices.get_mut(interface_name)?;
        device.subscribers.push((id, handler));
        state.next_subscription += 1;
        Some(id)
    }

    fn unsubscribe(&mut self, interface_name: &str, id: SubscriptionId) {
        if let Some(device) = self.lock().devices.get_mut(interface_name) {
            device.subscribers.retain(|(sub, _)| *sub != id);
        }
    }

    fn ipv4_gateway(&self, interface_name: &str) -> Option<String> {
        self.lock()
            .devices
            .get(interface_name)
            .and_then(|device| device.gateway.clone())
    }

    fn dhcp4_options(&self, interface_name: &str) -> HashMap<String, String> {
        self.lock()
            .devices
            .get(interface_name)
            .map(|device| device.dhcp4.clone())
            .unwrap_or_default()
    }

    fn ipv4_routes(&self, interface_name: &str) -> Vec<IpRoute> {
        self.lock()
            .devices
            .get(interface_name)
            .map(|device| device.routes.clone())
            .unwrap_or_default()
    }

    fn add_ipv4_route(&mut self, interface_name: &str, route: IpRoute) -> std::result::Result<(), ServiceError> {
        let mut state = self.lock();
        state.calls.push(ServiceCall::AddRoute {
            interface_name: interface_name.to_string(),
            route: route.clone(),
        });
        let device = state
            .devices
            .get_mut(interface_name)
            .ok_or_else(|| ServiceError::new(format!("no device {interface_name}")))?;
        device.routes.push(route);
        Ok(())
    }

    fn remove_ipv4_route(&mut self, interface_name: &str, route: &IpRoute) -> std::result::Result<(), ServiceError> {
        let mut state = self.lock();
        state.calls.push(ServiceCall::RemoveRoute {
            interface_name: interface_name.to_string(),
            route: route.clone(),
        });
        let device = state
            .devices
            .get_mut(interface_name)
            .ok_or_else(|| ServiceError::new(format!("no device {interface_name}")))?;
        device.routes.retain(|r| r != route);
        Ok(())
    }

    fn commit_changes(&mut self, interface_name: &str, save_to_disk: bool, done: Completion<()>) {
        let exists = {
            let mut state = self.lock();
            state.calls.push(ServiceCall::CommitChanges {
                interface_name: interface_name.to_string(),
                save_to_disk,
            });
            state.devices.contains_key(interface_name)
        };
        if exists {
            done(Ok(()));
        } else {
            done(Err(ServiceError::new(format!("no device {interface_name}"))));
        }
    }

    fn reapply(&mut self, interface_name: &str, done: Completion<()>) {
        let applied = {
            let mut state = self.lock();
            state.calls.push(ServiceCall::Reapply {
                interface_name: interface_name.to_string(),
            });
            match state.devices.get_mut(interface_name) {
                Some(device) => {
                    device.applied = device.routes.clone();
                    true
                }
                None => false,
            }
        };
        if applied {
            done(Ok(()));
        } else {
            done(Err(ServiceError::new(format!("no device {interface_name}"))));
        }
    }
}

/// `ip route`-style dump of every device's applied routes
struct FakeRouteTable {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl RouteTable for FakeRouteTable {
    async fn dump(&self) -> Result<String> {
        let state = lock(&self.state);
        let mut lines = Vec::new();
        for (iface, device) in &state.devices {
            if let Some(gateway) = &device.gateway {
                lines.push(format!("default via {gateway} dev {iface} proto static metric 100"));
            }
            for route in &device.applied {
                let Some(next_hop) = route.next_hop else {
                    continue;
                };
                lines.push(format!(
                    "{} via {} dev {} proto static metric 100",
                    route.destination.ip(),
                    next_hop,
                    iface
                ));
            }
        }
        Ok(lines.join("\n"))
    }
}
