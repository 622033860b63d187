//! Kill switch connection handler
//!
//! Owns the lifecycle of the dummy block-all profiles and of the VPN
//! server allow-route on physical devices.
//!
//! # Profiles
//!
//! | Kind | Connection id | Interface | Saved |
//! |------|---------------|-----------|-------|
//! | permanent block | `pvpn-killswitch-perm` | `pvpnksintrf1` | yes |
//! | temporary block | `pvpn-killswitch` | `pvpnksintrf0` | no |
//! | IPv6 leak | `pvpn-killswitch-ipv6` | `ipv6leakintrf0` | no |
//!
//! Each kind moves through
//!
//! ```text
//!   Absent --add--> PendingAdd --activated--> Active
//!   Active --remove--> PendingRemove --disconnected--> Absent
//! ```
//!
//! and falls back to where it was when a step fails.
//!
//! The block profiles use a route metric worse than the VPN tunnel but
//! better than physical interfaces: traffic takes the tunnel when it is
//! up and goes nowhere when it is not.

use crate::client::{NmClient, settle};
use crate::config::{BlockProfileConfig, KillSwitchConfig};
use crate::error::Result;
use crate::profile::{ConnectionProfile, GeneralProfileConfig, IpConfig, RouteSpec, exclude_from_default_route};
use crate::routes::{BackoffPolicy, IpRouteCommand, RouteConvergenceQuery, RouteTable, RouteWatcher};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Logical kill switch profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileKind {
    /// Block-all profile saved to disk
    BlockPermanent,
    /// Block-all profile for this session only
    BlockTemporary,
    /// IPv6-only block profile
    Ipv6Leak,
}

impl ProfileKind {
    /// Block-all kind for the given permanence.
    pub fn block(permanent: bool) -> Self {
        if permanent {
            ProfileKind::BlockPermanent
        } else {
            ProfileKind::BlockTemporary
        }
    }

    /// Human-readable connection id, also the lookup key.
    pub fn connection_id(&self) -> &'static str {
        match self {
            ProfileKind::BlockPermanent => "pvpn-killswitch-perm",
            ProfileKind::BlockTemporary => "pvpn-killswitch",
            ProfileKind::Ipv6Leak => "pvpn-killswitch-ipv6",
        }
    }

    /// Name of the dummy interface the profile creates.
    pub fn interface_name(&self) -> &'static str {
        match self {
            ProfileKind::BlockPermanent => "pvpnksintrf1",
            ProfileKind::BlockTemporary => "pvpnksintrf0",
            ProfileKind::Ipv6Leak => "ipv6leakintrf0",
        }
    }

    /// Whether the profile is saved to disk.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProfileKind::BlockPermanent)
    }

    /// The other permanence variant of a block profile.
    pub fn counterpart(&self) -> Option<ProfileKind> {
        match self {
            ProfileKind::BlockPermanent => Some(ProfileKind::BlockTemporary),
            ProfileKind::BlockTemporary => Some(ProfileKind::BlockPermanent),
            ProfileKind::Ipv6Leak => None,
        }
    }

    fn general(&self) -> GeneralProfileConfig {
        GeneralProfileConfig::new(self.connection_id(), self.interface_name())
    }
}

/// Lifecycle state of a profile kind, as seen by this handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfileState {
    #[default]
    Absent,
    PendingAdd,
    Active,
    PendingRemove,
}

/// Outcome of an add or remove
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// The service was changed
    Changed,
    /// Add found the profile already active
    AlreadyPresent,
    /// Remove found nothing to remove
    NotFound,
}

/// Profile and route operations behind the kill switch facade.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Add the block-all profile of the given permanence, then remove the
    /// other variant. The add is skipped when the profile is already
    /// active; the other variant is removed either way.
    ///
    /// With `allow_server`, the profile swallows everything except that
    /// address instead of everything.
    async fn add_kill_switch_connection(
        &self,
        permanent: bool,
        allow_server: Option<Ipv4Addr>,
    ) -> Result<()>;

    /// Remove both block-all profiles. Absent profiles are skipped, and a
    /// failure on one does not stop the other.
    async fn remove_kill_switch_connection(&self) -> Result<()>;

    /// Route `new_server/32` through every active physical device,
    /// replacing routes to `old_server`.
    async fn add_vpn_server_route(
        &self,
        new_server: Ipv4Addr,
        old_server: Option<Ipv4Addr>,
    ) -> Result<()>;

    /// Remove the `server/32` route from every active physical device.
    async fn remove_vpn_server_route(&self, server: Ipv4Addr) -> Result<()>;

    /// Add the IPv6-only block profile. Never saved to disk.
    async fn add_ipv6_leak_protection(&self) -> Result<()>;

    /// Remove the IPv6-only block profile if present.
    async fn remove_ipv6_leak_protection(&self) -> Result<()>;

    /// Turn the service's connectivity check off if it is on.
    async fn ensure_connectivity_check_disabled(&self) -> Result<()>;

    /// Whether the network service daemon is up.
    async fn is_network_service_running(&self) -> Result<bool>;
}

/// [`ConnectionHandler`] driving NetworkManager through an [`NmClient`]
pub struct KillSwitchConnectionHandler {
    client: NmClient,
    config: KillSwitchConfig,
    routes: RouteWatcher,
    states: RwLock<HashMap<ProfileKind, ProfileState>>,
}

impl KillSwitchConnectionHandler {
    /// Handler reading the routing table with the configured command.
    pub fn new(client: NmClient, config: KillSwitchConfig) -> Result<Self> {
        let table = Arc::new(IpRouteCommand::from_config(&config)?);
        Self::with_route_table(client, config, table)
    }

    /// Handler reading routes from `table`.
    pub fn with_route_table(
        client: NmClient,
        config: KillSwitchConfig,
        table: Arc<dyn RouteTable>,
    ) -> Result<Self> {
        config.validate()?;
        let routes = RouteWatcher::new(table, BackoffPolicy::from_config(&config));
        Ok(Self {
            client,
            config,
            routes,
            states: RwLock::new(HashMap::new()),
        })
    }

    /// Client used for every service call.
    pub fn client(&self) -> &NmClient {
        &self.client
    }

    /// Active configuration.
    pub fn config(&self) -> &KillSwitchConfig {
        &self.config
    }

    /// Last known lifecycle state of a profile kind.
    pub async fn profile_state(&self, kind: ProfileKind) -> ProfileState {
        self.states.read().await.get(&kind).copied().unwrap_or_default()
    }

    /// Record a new state, returning the previous one.
    async fn set_state(&self, kind: ProfileKind, state: ProfileState) -> ProfileState {
        let previous = self.states.write().await.insert(kind, state);
        previous.unwrap_or_default()
    }

    /// IPv4 settings of the block profile. With a server, everything but
    /// that server; otherwise everything, through the dummy gateway.
    fn ipv4_settings(&self, allow_server: Option<Ipv4Addr>) -> IpConfig {
        let mut settings = block_settings(&self.config.ipv4);
        if let Some(server) = allow_server {
            settings.gateway = None;
            settings.routes = exclude_from_default_route(server)
                .into_iter()
                .map(|network| RouteSpec::to(network.to_string()))
                .collect();
        }
        settings
    }

    fn ipv6_settings(&self) -> IpConfig {
        block_settings(&self.config.ipv6)
    }

    async fn add_profile(
        &self,
        kind: ProfileKind,
        ipv4: Option<IpConfig>,
        ipv6: Option<IpConfig>,
    ) -> Result<Presence> {
        let timeouts = &self.config.timeouts;
        let id = kind.connection_id();

        let active = settle(
            self.client.active_connection(id),
            timeouts.call(),
            "look up active connection",
        )
        .await?;
        if active.is_some() {
            debug!("{} was already present", id);
            self.set_state(kind, ProfileState::Active).await;
            return Ok(Presence::AlreadyPresent);
        }

        let profile = ConnectionProfile::build(&kind.general(), ipv4.as_ref(), ipv6.as_ref())?;
        let previous = self.set_state(kind, ProfileState::PendingAdd).await;

        let added = settle(
            self.client.add_connection(profile, kind.is_permanent()),
            timeouts.activation(),
            &format!("add {id}"),
        )
        .await
        .and_then(|added| added);

        match added {
            Ok(connection) => {
                self.set_state(kind, ProfileState::Active).await;
                info!("Added {} on {}", id, connection.interface_name);
                Ok(Presence::Changed)
            }
            Err(e) => {
                self.set_state(kind, previous).await;
                error!("Failed to add {}: {}", id, e);
                Err(e)
            }
        }
    }

    async fn remove_profile(&self, kind: ProfileKind) -> Result<Presence> {
        let timeouts = &self.config.timeouts;
        let id = kind.connection_id();

        let stored = settle(self.client.connection(id), timeouts.call(), "look up connection").await?;
        let Some(connection) = stored else {
            debug!("There was no {} to remove", id);
            self.set_state(kind, ProfileState::Absent).await;
            return Ok(Presence::NotFound);
        };

        debug!("Removing {} ({})", id, connection.uuid);
        let previous = self.set_state(kind, ProfileState::PendingRemove).await;

        let removed = settle(
            self.client.remove_connection(connection),
            timeouts.activation(),
            &format!("remove {id}"),
        )
        .await
        .and_then(|removed| removed);

        match removed {
            Ok(()) => {
                self.set_state(kind, ProfileState::Absent).await;
                info!("Removed {}", id);
                Ok(Presence::Changed)
            }
            Err(e) => {
                self.set_state(kind, previous).await;
                error!("Failed to remove {}: {}", id, e);
                Err(e)
            }
        }
    }

    async fn physical_devices(&self) -> Result<Vec<String>> {
        let devices = settle(
            self.client.physical_devices(),
            self.config.timeouts.call(),
            "list physical devices",
        )
        .await?;
        Ok(devices.into_iter().map(|device| device.interface_name).collect())
    }

    async fn add_route_on(
        &self,
        iface: &str,
        new_server: Ipv4Addr,
        old_server: Option<Ipv4Addr>,
    ) -> Result<()> {
        let gateway = settle(
            self.client.add_route_to_device(iface, new_server, old_server),
            self.config.timeouts.activation(),
            "add server route",
        )
        .await??;
        debug!("Route to {} via {} applied on {}", new_server, gateway, iface);

        self.routes
            .wait_for(&RouteConvergenceQuery {
                server_ip: new_server,
                interface_name: iface.to_string(),
                expected_present: true,
            })
            .await
    }

    async fn remove_route_on(&self, iface: &str, server: Ipv4Addr) -> Result<()> {
        settle(
            self.client.remove_route_from_device(iface, server),
            self.config.timeouts.activation(),
            "remove server route",
        )
        .await??;

        self.routes
            .wait_for(&RouteConvergenceQuery {
                server_ip: server,
                interface_name: iface.to_string(),
                expected_present: false,
            })
            .await
    }
}

fn block_settings(profile: &BlockProfileConfig) -> IpConfig {
    IpConfig {
        addresses: vec![profile.address.clone()],
        dns: profile.dns.clone(),
        dns_priority: profile.dns_priority,
        ignore_auto_dns: true,
        route_metric: profile.route_metric,
        gateway: Some(profile.gateway.clone()),
        routes: Vec::new(),
    }
}

/// Keep the first error, log the rest.
fn first_error(results: Vec<(String, Result<()>)>, what: &str) -> Result<()> {
    let mut first = None;
    for (iface, result) in results {
        if let Err(e) = result {
            error!("Failed to {} on {}: {}", what, iface, e);
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

#[async_trait]
impl ConnectionHandler for KillSwitchConnectionHandler {
    async fn add_kill_switch_connection(
        &self,
        permanent: bool,
        allow_server: Option<Ipv4Addr>,
    ) -> Result<()> {
        self.ensure_connectivity_check_disabled().await?;

        let kind = ProfileKind::block(permanent);
        self.add_profile(kind, Some(self.ipv4_settings(allow_server)), Some(self.ipv6_settings()))
            .await?;

        // Also when the profile was already there: an earlier enable may
        // have left both variants behind. The new profile stays even if the
        // old variant cannot be removed.
        if let Some(other) = kind.counterpart() {
            if let Err(e) = self.remove_profile(other).await {
                warn!("Kept {} but could not remove {}: {}", kind.connection_id(), other.connection_id(), e);
            }
        }
        Ok(())
    }

    async fn remove_kill_switch_connection(&self) -> Result<()> {
        debug!("Removing full kill switch");
        let mut results = Vec::with_capacity(2);
        for kind in [ProfileKind::BlockPermanent, ProfileKind::BlockTemporary] {
            let result = self.remove_profile(kind).await.map(|_| ());
            results.push((kind.connection_id().to_string(), result));
        }
        first_error(results, "remove block profile")?;
        debug!("Full kill switch removed");
        Ok(())
    }

    async fn add_vpn_server_route(
        &self,
        new_server: Ipv4Addr,
        old_server: Option<Ipv4Addr>,
    ) -> Result<()> {
        self.ensure_connectivity_check_disabled().await?;

        let devices = self.physical_devices().await?;
        if devices.is_empty() {
            warn!("No active physical device to route {} through", new_server);
        }

        let mut results = Vec::with_capacity(devices.len());
        for iface in devices {
            let result = self.add_route_on(&iface, new_server, old_server).await;
            results.push((iface, result));
        }
        first_error(results, "add VPN server route")?;

        info!("VPN server route to {} added", new_server);
        Ok(())
    }

    async fn remove_vpn_server_route(&self, server: Ipv4Addr) -> Result<()> {
        let devices = self.physical_devices().await?;

        let mut results = Vec::with_capacity(devices.len());
        for iface in devices {
            let result = self.remove_route_on(&iface, server).await;
            results.push((iface, result));
        }
        first_error(results, "remove VPN server route")?;

        info!("VPN server route to {} removed", server);
        Ok(())
    }

    async fn add_ipv6_leak_protection(&self) -> Result<()> {
        self.ensure_connectivity_check_disabled().await?;
        self.add_profile(ProfileKind::Ipv6Leak, None, Some(self.ipv6_settings()))
            .await?;
        Ok(())
    }

    async fn remove_ipv6_leak_protection(&self) -> Result<()> {
        self.remove_profile(ProfileKind::Ipv6Leak).await?;
        Ok(())
    }

    async fn ensure_connectivity_check_disabled(&self) -> Result<()> {
        let call = self.config.timeouts.call();

        let enabled = settle(
            self.client.connectivity_check_enabled(),
            call,
            "read connectivity check",
        )
        .await?;
        if !enabled {
            return Ok(());
        }

        let strategy = settle(
            self.client.disable_connectivity_check(),
            call,
            "disable connectivity check",
        )
        .await??;
        info!("Network connectivity check was disabled ({:?})", strategy);
        Ok(())
    }

    async fn is_network_service_running(&self) -> Result<bool> {
        settle(
            self.client.is_running(),
            self.config.timeouts.call(),
            "check network service",
        )
        .await
    }
}
