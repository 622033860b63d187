//! NetworkManager client
//!
//! Async wrapper over a [`NetworkService`] living on its own event loop
//! thread. Every method schedules work on the loop and returns a
//! [`Pending`]; callers bound each wait with a timeout.
//!
//! # Usage
//!
//! ```rust,ignore
//! let client = NmClient::shared(|_handle| connect_to_network_manager())?;
//!
//! if client.is_running().wait(Duration::from_secs(5)).await? {
//!     let devices = client.physical_devices().wait(Duration::from_secs(5)).await?;
//! }
//! ```

use crate::connectivity::{self, ConnectivityCheckStrategy};
use crate::error::{KillSwitchError, Result};
use crate::profile::{ConnectionProfile, IpRoute};
use crate::service::{
    ActiveConnection, DeviceInfo, DeviceState, NetworkService, ServiceBox, ServiceError,
    ServiceHandle, StoredConnection,
};
use nmks_loop::{EventLoop, Pending, Promise};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

const LOOP_NAME: &str = "nmks-nm-loop";

static SHARED: OnceLock<NmClient> = OnceLock::new();
static SHARED_INIT: Mutex<()> = Mutex::new(());

/// Client bound to the network service's event loop
#[derive(Clone)]
pub struct NmClient {
    event_loop: Arc<EventLoop<ServiceBox>>,
}

impl NmClient {
    /// Start a dedicated loop and create the service on it.
    pub fn spawn<F>(factory: F) -> Result<Self>
    where
        F: FnOnce(&ServiceHandle) -> std::result::Result<ServiceBox, ServiceError> + Send + 'static,
    {
        let event_loop = EventLoop::spawn(LOOP_NAME, factory)?;
        info!("Network service client started on {}", LOOP_NAME);
        Ok(Self {
            event_loop: Arc::new(event_loop),
        })
    }

    /// Process-wide client, created on first use.
    ///
    /// Concurrent first callers never start two loops: the fast path reads
    /// the initialized client, the slow path re-checks under a lock. Only
    /// the first successful caller's `factory` is used; the loop lives for
    /// the rest of the process.
    pub fn shared<F>(factory: F) -> Result<Self>
    where
        F: FnOnce(&ServiceHandle) -> std::result::Result<ServiceBox, ServiceError> + Send + 'static,
    {
        if let Some(client) = SHARED.get() {
            return Ok(client.clone());
        }

        let _guard = SHARED_INIT.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = SHARED.get() {
            return Ok(client.clone());
        }

        let client = Self::spawn(factory)?;
        let _ = SHARED.set(client.clone());
        Ok(client)
    }

    /// Handle of the underlying loop.
    pub fn handle(&self) -> &ServiceHandle {
        self.event_loop.handle()
    }

    /// Version string reported by the service.
    pub fn version(&self) -> Pending<String> {
        self.handle().run(|svc, _| svc.version())
    }

    /// Whether the service daemon is running.
    pub fn is_running(&self) -> Pending<bool> {
        self.handle().run(|svc, _| svc.is_running())
    }

    /// Whether the service's connectivity check is on.
    pub fn connectivity_check_enabled(&self) -> Pending<bool> {
        self.handle().run(|svc, _| svc.connectivity_check_enabled())
    }

    /// Turn the connectivity check off, choosing the call by service
    /// version. Resolves with the strategy that was used.
    pub fn disable_connectivity_check(&self) -> Pending<Result<ConnectivityCheckStrategy>> {
        const OP: &str = "disable connectivity check";

        self.handle().run_async(|svc, _, promise| {
            let strategy = match ConnectivityCheckStrategy::for_version(&svc.version()) {
                Ok(strategy) => strategy,
                Err(e) => {
                    promise.resolve(Err(e));
                    return;
                }
            };
            debug!("Disabling connectivity check via {:?}", strategy);

            match strategy {
                ConnectivityCheckStrategy::LegacySetter => {
                    let result = svc
                        .set_connectivity_check_enabled(false)
                        .map(|_| strategy)
                        .map_err(|e| KillSwitchError::activation(OP, e));
                    promise.resolve(result);
                }
                ConnectivityCheckStrategy::PropertyWrite => {
                    let (target, value) = connectivity::disable_property();
                    svc.set_property(
                        target,
                        value,
                        Box::new(move |result| {
                            promise.resolve(
                                result
                                    .map(|_| strategy)
                                    .map_err(|e| KillSwitchError::activation(OP, e)),
                            );
                        }),
                    );
                }
            }
        })
    }

    /// Active connection with the given id, if any.
    pub fn active_connection(&self, id: &str) -> Pending<Option<ActiveConnection>> {
        let id = id.to_string();
        self.handle().run(move |svc, _| {
            svc.active_connections()
                .into_iter()
                .find(|connection| connection.id == id)
        })
    }

    /// Stored connection with the given id, if any.
    pub fn connection(&self, id: &str) -> Pending<Option<StoredConnection>> {
        let id = id.to_string();
        self.handle().run(move |svc, _| svc.connection_by_id(&id))
    }

    /// Ethernet/wifi devices that are activated with a live connection.
    pub fn physical_devices(&self) -> Pending<Vec<DeviceInfo>> {
        self.handle().run(|svc, _| {
            svc.devices()
                .into_iter()
                .filter(DeviceInfo::is_active_physical)
                .collect()
        })
    }

    /// Add a profile and resolve once its device is activated.
    pub fn add_connection(
        &self,
        profile: ConnectionProfile,
        save_to_disk: bool,
    ) -> Pending<Result<ActiveConnection>> {
        const OP: &str = "add connection";

        self.handle().run_async(move |svc, handle, promise| {
            let handle = handle.clone();
            let id = profile.id.clone();
            debug!("Adding connection {} (save to disk: {})", id, save_to_disk);

            svc.add_connection(
                profile,
                save_to_disk,
                Box::new(move |result| {
                    let stored = match result {
                        Ok(stored) => stored,
                        Err(e) => {
                            promise.resolve(Err(KillSwitchError::activation(OP, e)));
                            return;
                        }
                    };

                    handle.invoke(move |svc, handle| {
                        let active = ActiveConnection {
                            id,
                            interface_name: stored.interface_name.clone(),
                        };
                        let waiter = StateWaiter {
                            interface_name: stored.interface_name,
                            target: DeviceState::Activated,
                            operation: OP,
                            value: active,
                            promise,
                        };
                        if !waiter.watch(svc, handle) {
                            let iface = waiter.interface_name.clone();
                            waiter.fail(format!("no device {iface} after adding the connection"));
                        }
                    });
                }),
            );
        })
    }

    /// Delete a profile and resolve once its device is disconnected.
    pub fn remove_connection(&self, connection: StoredConnection) -> Pending<Result<()>> {
        const OP: &str = "remove connection";

        self.handle().run_async(move |svc, handle, promise| {
            let bound = svc
                .device_state(&connection.interface_name)
                .is_some_and(|state| state != DeviceState::Disconnected);

            // With a live device, settling waits for DISCONNECTED; without
            // one the delete completion is all there is to wait for.
            if bound {
                let waiter = StateWaiter {
                    interface_name: connection.interface_name.clone(),
                    target: DeviceState::Disconnected,
                    operation: OP,
                    value: (),
                    promise: promise.clone(),
                };
                waiter.watch(svc, handle);
            }

            debug!("Deleting connection {}", connection.id);
            svc.delete_connection(
                &connection,
                Box::new(move |result| match result {
                    Err(e) => {
                        promise.resolve(Err(KillSwitchError::activation(OP, e)));
                    }
                    Ok(()) if !bound => {
                        promise.resolve(Ok(()));
                    }
                    Ok(()) => {}
                }),
            );
        })
    }

    /// Route `new_server/32` through the device's IPv4 gateway, optionally
    /// dropping routes to `old_server` first. Applied to the live device
    /// only, never saved. Resolves with the gateway used.
    pub fn add_route_to_device(
        &self,
        interface_name: &str,
        new_server: Ipv4Addr,
        old_server: Option<Ipv4Addr>,
    ) -> Pending<Result<Ipv4Addr>> {
        let iface = interface_name.to_string();
        self.handle().run_async(move |svc, handle, promise| {
            match stage_server_route(svc, &iface, new_server, old_server) {
                Ok(gateway) => apply_live(svc, handle, &iface, promise, gateway),
                Err(e) => {
                    promise.resolve(Err(e));
                }
            }
        })
    }

    /// Remove every `server/32` route of the device and apply live.
    pub fn remove_route_from_device(
        &self,
        interface_name: &str,
        server: Ipv4Addr,
    ) -> Pending<Result<()>> {
        let iface = interface_name.to_string();
        self.handle().run_async(move |svc, handle, promise| {
            match remove_host_routes(svc, &iface, server) {
                Ok(_) => apply_live(svc, handle, &iface, promise, ()),
                Err(e) => {
                    promise.resolve(Err(e));
                }
            }
        })
    }
}

/// Wait for a loop result, naming the operation if it times out.
pub(crate) async fn settle<T>(pending: Pending<T>, limit: Duration, operation: &str) -> Result<T> {
    pending
        .wait(limit)
        .await
        .map_err(|e| KillSwitchError::from_loop(operation, e))
}

/// Settles a promise the first time a device reaches `target`.
#[derive(Clone)]
struct StateWaiter<T> {
    interface_name: String,
    target: DeviceState,
    operation: &'static str,
    value: T,
    promise: Promise<Result<T>>,
}

impl<T: Clone + Send + 'static> StateWaiter<T> {
    /// Subscribe to the device, unsubscribing once the promise settles by
    /// any path. Returns `false` when the device does not exist.
    fn watch(&self, svc: &mut ServiceBox, handle: &ServiceHandle) -> bool {
        if let Err(e) = handle.assert_owner() {
            self.promise.resolve(Err(e.into()));
            return true;
        }

        let on_change = self.clone();
        let Some(id) = svc.subscribe_state_changed(
            &self.interface_name,
            Box::new(move |state| on_change.observe(state)),
        ) else {
            return false;
        };

        let unsubscribe = handle.clone();
        let iface = self.interface_name.clone();
        self.promise.on_settle(move || {
            unsubscribe.invoke(move |svc, _| {
                svc.unsubscribe(&iface, id);
                debug!("Stopped watching {} state changes", iface);
            });
        });

        // The device may have reached the state before the subscription
        // took effect.
        if let Some(state) = svc.device_state(&self.interface_name) {
            self.observe(state);
        }
        true
    }

    fn observe(&self, state: DeviceState) {
        debug!("{} interface state changed to {}", self.interface_name, state);

        if state == self.target {
            self.promise.resolve(Ok(self.value.clone()));
        } else if state == DeviceState::Failed && self.target == DeviceState::Activated {
            self.fail(format!("{} entered {}", self.interface_name, state));
        } else {
            self.promise.release_if_abandoned();
        }
    }

    fn fail(&self, reason: String) {
        self.promise
            .resolve(Err(KillSwitchError::activation(self.operation, reason)));
    }
}

/// Gateway of a device: static configuration first, then the first router
/// advertised by its DHCP lease.
fn ipv4_gateway_of(svc: &dyn NetworkService, iface: &str) -> Result<Ipv4Addr> {
    let gateway = svc
        .ipv4_gateway(iface)
        .filter(|gateway| !gateway.trim().is_empty())
        .or_else(|| {
            svc.dhcp4_options(iface)
                .get("routers")
                .and_then(|routers| routers.split(',').next())
                .map(|router| router.trim().to_string())
                .filter(|router| !router.is_empty())
        })
        .ok_or_else(|| KillSwitchError::GatewayNotFound(iface.to_string()))?;

    gateway
        .trim()
        .parse()
        .map_err(|e| KillSwitchError::invalid_address(&gateway, e))
}

fn remove_host_routes(svc: &mut ServiceBox, iface: &str, server: Ipv4Addr) -> Result<usize> {
    let stale: Vec<IpRoute> = svc
        .ipv4_routes(iface)
        .into_iter()
        .filter(|route| route.is_host_route_to(server))
        .collect();

    for route in &stale {
        svc.remove_ipv4_route(iface, route)
            .map_err(|e| KillSwitchError::activation("remove server route", e))?;
    }
    debug!("Removed {} route(s) to {} from {}", stale.len(), server, iface);
    Ok(stale.len())
}

fn stage_server_route(
    svc: &mut ServiceBox,
    iface: &str,
    new_server: Ipv4Addr,
    old_server: Option<Ipv4Addr>,
) -> Result<Ipv4Addr> {
    if let Some(old) = old_server {
        remove_host_routes(svc, iface, old)?;
    }

    let gateway = ipv4_gateway_of(&**svc, iface)?;
    svc.add_ipv4_route(iface, IpRoute::host_v4(new_server, gateway))
        .map_err(|e| KillSwitchError::activation("add server route", e))?;
    debug!("Staged route {}/32 via {} on {}", new_server, gateway, iface);
    Ok(gateway)
}

/// Commit the device's connection without saving it, then re-apply it to
/// the live device.
fn apply_live<T: Send + 'static>(
    svc: &mut ServiceBox,
    handle: &ServiceHandle,
    iface: &str,
    promise: Promise<Result<T>>,
    value: T,
) {
    let handle = handle.clone();
    let iface_owned = iface.to_string();

    svc.commit_changes(
        iface,
        false,
        Box::new(move |result| {
            if let Err(e) = result {
                promise.resolve(Err(KillSwitchError::activation("commit route change", e)));
                return;
            }
            handle.invoke(move |svc, _| {
                svc.reapply(
                    &iface_owned,
                    Box::new(move |result| {
                        promise.resolve(
                            result
                                .map(|_| value)
                                .map_err(|e| KillSwitchError::activation("reapply route change", e)),
                        );
                    }),
                );
            });
        }),
    );
}
