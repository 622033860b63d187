//! Network service seam
//!
//! The capability surface of the system network configuration service
//! (NetworkManager) that the kill switch consumes. Implementations are
//! created on the event loop thread and only ever called there, which is
//! why the trait is not `Send`.
//!
//! Asynchronous operations report through a [`Completion`]. Completions
//! run on the loop thread but must not call back into the service
//! directly; anything that needs the service again is re-scheduled with
//! [`LoopHandle::invoke`](nmks_loop::LoopHandle::invoke).

use crate::profile::{ConnectionProfile, IpRoute};
use nmks_loop::LoopHandle;
use std::collections::HashMap;
use std::fmt;

/// Loop-confined service object
pub type ServiceBox = Box<dyn NetworkService>;

/// Handle to the loop owning a [`ServiceBox`]
pub type ServiceHandle = LoopHandle<ServiceBox>;

/// Completion callback of an asynchronous service call
pub type Completion<T> = Box<dyn FnOnce(Result<T, ServiceError>) + Send + 'static>;

/// Device state-change handler
pub type StateHandler = Box<dyn FnMut(DeviceState) + Send + 'static>;

/// Error reported by the network service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

impl ServiceError {
    /// Create an error from a message
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Device kinds the kill switch cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Ethernet,
    Wifi,
    Dummy,
    Other,
}

impl DeviceType {
    /// Ethernet and wifi carry real traffic; everything else is virtual.
    pub fn is_physical(&self) -> bool {
        matches!(self, DeviceType::Ethernet | DeviceType::Wifi)
    }
}

/// Device states, numbered as NetworkManager numbers them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Unknown,
    Unmanaged,
    Unavailable,
    Disconnected,
    Prepare,
    Config,
    NeedAuth,
    IpConfig,
    IpCheck,
    Secondaries,
    Activated,
    Deactivating,
    Failed,
}

impl DeviceState {
    /// Map NetworkManager's `NMDeviceState` value.
    pub fn from_raw(value: u32) -> Self {
        match value {
            10 => DeviceState::Unmanaged,
            20 => DeviceState::Unavailable,
            30 => DeviceState::Disconnected,
            40 => DeviceState::Prepare,
            50 => DeviceState::Config,
            60 => DeviceState::NeedAuth,
            70 => DeviceState::IpConfig,
            80 => DeviceState::IpCheck,
            90 => DeviceState::Secondaries,
            100 => DeviceState::Activated,
            110 => DeviceState::Deactivating,
            120 => DeviceState::Failed,
            _ => DeviceState::Unknown,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Unknown => "UNKNOWN",
            DeviceState::Unmanaged => "UNMANAGED",
            DeviceState::Unavailable => "UNAVAILABLE",
            DeviceState::Disconnected => "DISCONNECTED",
            DeviceState::Prepare => "PREPARE",
            DeviceState::Config => "CONFIG",
            DeviceState::NeedAuth => "NEED_AUTH",
            DeviceState::IpConfig => "IP_CONFIG",
            DeviceState::IpCheck => "IP_CHECK",
            DeviceState::Secondaries => "SECONDARIES",
            DeviceState::Activated => "ACTIVATED",
            DeviceState::Deactivating => "DEACTIVATING",
            DeviceState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Snapshot of a network device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub interface_name: String,
    pub device_type: DeviceType,
    pub state: DeviceState,
    /// Id of the connection currently active on the device
    pub active_connection: Option<String>,
}

impl DeviceInfo {
    /// Physical device currently carrying a live connection.
    pub fn is_active_physical(&self) -> bool {
        self.device_type.is_physical()
            && self.state == DeviceState::Activated
            && self.active_connection.is_some()
    }
}

/// Connection profile instantiated on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConnection {
    pub id: String,
    pub interface_name: String,
}

/// Stored connection profile (active or not)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConnection {
    pub id: String,
    pub uuid: String,
    pub interface_name: String,
}

/// Target of a generic property write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyTarget {
    pub object_path: String,
    pub interface_name: String,
    pub property_name: String,
}

/// Value of a generic property write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    U32(u32),
    Str(String),
}

/// Capability surface of the network configuration service.
pub trait NetworkService {
    /// Service version string, e.g. `"1.46.0"`.
    fn version(&self) -> String;

    /// Whether the service daemon is running.
    fn is_running(&self) -> bool;

    fn connectivity_check_enabled(&self) -> bool;

    /// Direct setter available on older service versions.
    fn set_connectivity_check_enabled(&mut self, enabled: bool) -> Result<(), ServiceError>;

    /// Generic property write used on newer service versions.
    fn set_property(&mut self, target: PropertyTarget, value: PropertyValue, done: Completion<()>);

    /// Add a connection profile. Dummy profiles activate on their own.
    fn add_connection(
        &mut self,
        profile: ConnectionProfile,
        save_to_disk: bool,
        done: Completion<StoredConnection>,
    );

    /// Delete a stored connection profile, deactivating it first.
    fn delete_connection(&mut self, connection: &StoredConnection, done: Completion<()>);

    fn active_connections(&self) -> Vec<ActiveConnection>;

    fn connection_by_id(&self, id: &str) -> Option<StoredConnection>;

    fn devices(&self) -> Vec<DeviceInfo>;

    fn device_state(&self, interface_name: &str) -> Option<DeviceState>;

    /// Subscribe to state changes of a device. `None` when the device
    /// does not exist.
    fn subscribe_state_changed(
        &mut self,
        interface_name: &str,
        handler: StateHandler,
    ) -> Option<SubscriptionId>;

    fn unsubscribe(&mut self, interface_name: &str, id: SubscriptionId);

    /// Static gateway of the device's active IPv4 configuration.
    fn ipv4_gateway(&self, interface_name: &str) -> Option<String>;

    /// Options of the device's current DHCPv4 lease.
    fn dhcp4_options(&self, interface_name: &str) -> HashMap<String, String>;

    /// Routes of the device's active IPv4 configuration.
    fn ipv4_routes(&self, interface_name: &str) -> Vec<IpRoute>;

    fn add_ipv4_route(&mut self, interface_name: &str, route: IpRoute) -> Result<(), ServiceError>;

    fn remove_ipv4_route(&mut self, interface_name: &str, route: &IpRoute) -> Result<(), ServiceError>;

    /// Commit pending changes of the device's active connection.
    fn commit_changes(&mut self, interface_name: &str, save_to_disk: bool, done: Completion<()>);

    /// Re-apply the committed connection to the live device.
    fn reapply(&mut self, interface_name: &str, done: Completion<()>);
}

/// Identifier of a state-change subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);
