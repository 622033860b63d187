//! nmks - NetworkManager VPN Kill Switch
//!
//! Blocks all non-VPN traffic with dummy NetworkManager connections so
//! nothing leaks when the tunnel drops.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ async callers                                              │
//! │                                                            │
//! │  WgKillSwitch ──▶ KillSwitchConnectionHandler ──▶ NmClient │
//! │   (facade)         (profiles, routes)            (Pending) │
//! │                          │                          │      │
//! │                          ▼                          │      │
//! │                   RouteWatcher                      │      │
//! │                   (`ip route` poll)                 │      │
//! └─────────────────────────────────────────────────────│──────┘
//!                                                       │ jobs
//!                                                       ▼
//!                                      ┌──────────────────────────┐
//!                                      │ nmks-nm-loop thread      │
//!                                      │ Box<dyn NetworkService>  │
//!                                      └──────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Block-all profiles**: permanent (saved) or temporary, never both
//! - **VPN server allow-route**: `/32` via each physical device's gateway
//! - **IPv6 leak protection**: separate IPv6-only profile
//! - **Loop confinement**: the service object never leaves its thread
//!
//! The network service itself is supplied by the application through the
//! [`NetworkService`] trait.

mod client;
mod config;
mod connectivity;
mod error;
mod handler;
mod host;
mod killswitch;
mod profile;
mod routes;
mod service;

#[cfg(test)]
mod fake;

pub use client::NmClient;
pub use config::{BlockProfileConfig, ConfigError, KillSwitchConfig, Timeouts};
pub use connectivity::{ConnectivityCheckStrategy, disable_property, parse_service_version};
pub use error::{KillSwitchError, Result};
pub use handler::{
    ConnectionHandler, KillSwitchConnectionHandler, Presence, ProfileKind, ProfileState,
};
pub use host::{HostProbe, SystemHostProbe};
pub use killswitch::{KillSwitch, PRIORITY, SUPPORTED_PROTOCOL, ValidateParams, WgKillSwitch};
pub use profile::{
    ConnectionProfile, GeneralProfileConfig, IpConfig, IpRoute, IpSettings, ManualIpSettings,
    RouteSpec, exclude_from_default_route,
};
pub use routes::{
    BackoffPolicy, Convergence, IpRouteCommand, PollExhausted, RouteConvergenceQuery,
    RouteTable, RouteWatcher, poll_until, route_present,
};
pub use service::{
    ActiveConnection, Completion, DeviceInfo, DeviceState, DeviceType, NetworkService,
    PropertyTarget, PropertyValue, ServiceBox, ServiceError, ServiceHandle, StateHandler,
    StoredConnection, SubscriptionId,
};

pub use nmks_loop::{Pending, Promise};
