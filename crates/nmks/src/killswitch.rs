//! Kill switch facade
//!
//! The interface the VPN client talks to. Blocking always comes first:
//! during `enable` the block-all profile is active before the VPN server
//! allow-route exists, never the other way round.
//!
//! # Usage
//!
//! ```rust,ignore
//! let client = NmClient::shared(connect_to_network_manager)?;
//! let handler = KillSwitchConnectionHandler::new(client, KillSwitchConfig::default())?;
//! let kill_switch = WgKillSwitch::new(handler);
//!
//! if kill_switch.validate(&ValidateParams::protocol("wireguard")).await {
//!     kill_switch.enable(Some(server_ip), false).await?;
//! }
//! ```

use crate::error::Result;
use crate::handler::ConnectionHandler;
use crate::host::{HostProbe, SystemHostProbe};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// VPN protocol this backend supports
pub const SUPPORTED_PROTOCOL: &str = "wireguard";

/// Rank among kill switch backends, above the older implementation (100)
pub const PRIORITY: i32 = 101;

/// Parameters a caller passes to [`KillSwitch::validate`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidateParams {
    #[serde(default)]
    pub protocol: String,
    /// Everything else the caller sent
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ValidateParams {
    /// Parameters naming only a protocol
    pub fn protocol(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            extra: HashMap::new(),
        }
    }
}

/// Kill switch backend interface
#[async_trait]
pub trait KillSwitch: Send + Sync {
    /// Block all traffic, then allow traffic to `server` if given.
    async fn enable(&self, server: Option<Ipv4Addr>, permanent: bool) -> Result<()>;

    async fn disable(&self) -> Result<()>;

    async fn enable_ipv6_leak_protection(&self, permanent: bool) -> Result<()>;

    async fn disable_ipv6_leak_protection(&self) -> Result<()>;

    /// Whether this backend can work here. Never fails; problems read as
    /// "not applicable".
    async fn validate(&self, params: &ValidateParams) -> bool;

    fn priority(&self) -> i32;
}

/// Kill switch built on dummy NetworkManager connections
///
/// The dummy connection blocking non-VPN traffic has a lower priority than
/// the VPN connection and a higher one than every other connection, so the
/// routing table sends anything not bound for the tunnel to it.
pub struct WgKillSwitch<H> {
    handler: H,
    probe: Box<dyn HostProbe>,
    /// Server currently allowed through, if any
    allowed_server: Mutex<Option<Ipv4Addr>>,
}

impl<H: ConnectionHandler> WgKillSwitch<H> {
    /// Create a kill switch probing the real host
    pub fn new(handler: H) -> Self {
        Self::with_probe(handler, SystemHostProbe::default())
    }

    /// Create a kill switch with a custom host probe
    pub fn with_probe(handler: H, probe: impl HostProbe + 'static) -> Self {
        Self {
            handler,
            probe: Box::new(probe),
            allowed_server: Mutex::new(None),
        }
    }

    /// Underlying connection handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Server the allow-route currently points at.
    pub async fn allowed_server(&self) -> Option<Ipv4Addr> {
        *self.allowed_server.lock().await
    }
}

#[async_trait]
impl<H: ConnectionHandler> KillSwitch for WgKillSwitch<H> {
    async fn enable(&self, server: Option<Ipv4Addr>, permanent: bool) -> Result<()> {
        let mut allowed = self.allowed_server.lock().await;

        self.handler.add_kill_switch_connection(permanent, None).await?;

        if let Some(server) = server {
            self.handler.add_vpn_server_route(server, *allowed).await?;
            *allowed = Some(server);
        }
        info!("Kill switch enabled (permanent: {})", permanent);
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        let mut allowed = self.allowed_server.lock().await;

        self.handler.remove_kill_switch_connection().await?;

        if let Some(server) = *allowed {
            self.handler.remove_vpn_server_route(server).await?;
            *allowed = None;
        }
        info!("Kill switch disabled");
        Ok(())
    }

    async fn enable_ipv6_leak_protection(&self, permanent: bool) -> Result<()> {
        // WireGuard already keeps IPv6 inside the tunnel; the profile is
        // for setups sharing this backend with other protocols. It is
        // never saved, whatever `permanent` says.
        debug!("Enabling IPv6 leak protection (requested permanent: {})", permanent);
        self.handler.add_ipv6_leak_protection().await
    }

    async fn disable_ipv6_leak_protection(&self) -> Result<()> {
        self.handler.remove_ipv6_leak_protection().await
    }

    async fn validate(&self, params: &ValidateParams) -> bool {
        if params.protocol != SUPPORTED_PROTOCOL {
            debug!("Protocol {:?} is not handled by this kill switch", params.protocol);
            return false;
        }

        match self.handler.is_network_service_running().await {
            Ok(true) => {}
            Ok(false) => {
                error!("NetworkManager is not running");
                return false;
            }
            Err(e) => {
                error!("NetworkManager is not reachable: {}", e);
                return false;
            }
        }

        // libnetplan1 (Ubuntu 24.04 and later) with IPv6 disabled breaks
        // dummy connections.
        if self.probe.netplan_present().await && self.probe.ipv6_disabled().await {
            error!(
                "Kill switch could not be enabled using libnetplan1 \
                 while IPv6 is disabled via the ipv6.disable=1 kernel parameter"
            );
            return false;
        }
        true
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }
}
