//! Connection profile builder
//!
//! Turns the semantic description of a dummy kill switch connection into
//! the descriptor handed to the network service. Pure: no I/O, and the
//! only failure is a malformed address.
//!
//! A family without an [`IpConfig`] is *disabled*, not "manual with
//! nothing in it".

use crate::error::{KillSwitchError, Result};
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

/// NetworkManager's "use the default metric" route sentinel
pub const DEFAULT_ROUTE_METRIC: i64 = -1;

/// Connection type of every kill switch profile
pub const DUMMY_CONNECTION_TYPE: &str = "dummy";

/// Identity of a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralProfileConfig {
    /// Human-readable id, also the lookup key
    pub id: String,
    /// Name of the dummy interface
    pub interface_name: String,
}

impl GeneralProfileConfig {
    /// Create a general section for a profile id and interface
    pub fn new(id: impl Into<String>, interface_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            interface_name: interface_name.into(),
        }
    }
}

/// Semantic IP configuration of one address family
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpConfig {
    /// Addresses in CIDR notation
    pub addresses: Vec<String>,
    pub dns: Vec<String>,
    pub dns_priority: i32,
    pub ignore_auto_dns: bool,
    pub route_metric: i64,
    pub gateway: Option<String>,
    pub routes: Vec<RouteSpec>,
}

/// Route requested by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    /// Destination in CIDR notation
    pub destination: String,
    /// Explicit next hop for this route only
    pub next_hop: Option<String>,
}

impl RouteSpec {
    /// Route without an explicit next hop.
    pub fn to(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            next_hop: None,
        }
    }
}

/// Route as it appears in a built profile or a device's configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRoute {
    pub destination: IpNetwork,
    pub next_hop: Option<IpAddr>,
    /// `None` means the system default metric
    pub metric: Option<u32>,
}

impl IpRoute {
    /// Host route (`/32`) to `dest` via `next_hop` with the default metric.
    pub fn host_v4(dest: Ipv4Addr, next_hop: Ipv4Addr) -> Self {
        Self {
            destination: IpNetwork::V4(Ipv4Network::from(dest)),
            next_hop: Some(IpAddr::V4(next_hop)),
            metric: None,
        }
    }

    /// Metric as NetworkManager expects it, with `-1` for the default.
    pub fn metric_or_default(&self) -> i64 {
        self.metric.map_or(DEFAULT_ROUTE_METRIC, i64::from)
    }

    /// Whether this is a `/32` route to `ip`.
    pub fn is_host_route_to(&self, ip: Ipv4Addr) -> bool {
        matches!(self.destination, IpNetwork::V4(net) if net.prefix() == 32 && net.ip() == ip)
    }
}

/// Per-family settings of a built profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum IpSettings {
    Disabled,
    Manual(ManualIpSettings),
}

impl IpSettings {
    /// NetworkManager `method` value
    pub fn method(&self) -> &'static str {
        match self {
            IpSettings::Disabled => "disabled",
            IpSettings::Manual(_) => "manual",
        }
    }

    /// Manual settings, if the family is enabled
    pub fn manual(&self) -> Option<&ManualIpSettings> {
        match self {
            IpSettings::Manual(settings) => Some(settings),
            IpSettings::Disabled => None,
        }
    }
}

/// Settings of a manually configured family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualIpSettings {
    pub addresses: Vec<IpNetwork>,
    pub dns: Vec<IpAddr>,
    pub dns_priority: i32,
    pub ignore_auto_dns: bool,
    pub route_metric: i64,
    pub gateway: Option<IpAddr>,
    pub routes: Vec<IpRoute>,
}

/// Connection profile descriptor handed to the network service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Fresh for every built profile
    pub uuid: Uuid,
    pub id: String,
    pub interface_name: String,
    pub connection_type: String,
    pub ipv4: IpSettings,
    pub ipv6: IpSettings,
}

#[derive(Clone, Copy)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn matches(self, ip: IpAddr) -> bool {
        match self {
            Family::V4 => ip.is_ipv4(),
            Family::V6 => ip.is_ipv6(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Family::V4 => "IPv4",
            Family::V6 => "IPv6",
        }
    }
}

impl ConnectionProfile {
    /// Build a dummy connection profile.
    pub fn build(
        general: &GeneralProfileConfig,
        ipv4: Option<&IpConfig>,
        ipv6: Option<&IpConfig>,
    ) -> Result<Self> {
        Ok(Self {
            uuid: Uuid::new_v4(),
            id: general.id.clone(),
            interface_name: general.interface_name.clone(),
            connection_type: DUMMY_CONNECTION_TYPE.to_string(),
            ipv4: build_ip_settings(ipv4, Family::V4)?,
            ipv6: build_ip_settings(ipv6, Family::V6)?,
        })
    }
}

fn build_ip_settings(config: Option<&IpConfig>, family: Family) -> Result<IpSettings> {
    let Some(config) = config else {
        return Ok(IpSettings::Disabled);
    };

    let addresses = config
        .addresses
        .iter()
        .map(|a| parse_network(a, family))
        .collect::<Result<Vec<_>>>()?;
    let dns = config
        .dns
        .iter()
        .map(|d| parse_ip(d, family))
        .collect::<Result<Vec<_>>>()?;
    let routes = config
        .routes
        .iter()
        .map(|r| {
            Ok(IpRoute {
                destination: parse_network(&r.destination, family)?,
                next_hop: r.next_hop.as_deref().map(|h| parse_ip(h, family)).transpose()?,
                metric: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let gateway = config
        .gateway
        .as_deref()
        .map(|g| parse_ip(g, family))
        .transpose()?;

    Ok(IpSettings::Manual(ManualIpSettings {
        addresses,
        dns,
        dns_priority: config.dns_priority,
        ignore_auto_dns: config.ignore_auto_dns,
        route_metric: config.route_metric,
        gateway,
        routes,
    }))
}

fn parse_network(value: &str, family: Family) -> Result<IpNetwork> {
    // Require an explicit prefix: a bare address is almost always a mistake here.
    if !value.contains('/') {
        return Err(KillSwitchError::invalid_address(value, "missing prefix length"));
    }
    let network: IpNetwork = value
        .parse()
        .map_err(|e| KillSwitchError::invalid_address(value, e))?;
    if !family.matches(network.ip()) {
        return Err(KillSwitchError::invalid_address(
            value,
            format!("not an {} network", family.name()),
        ));
    }
    Ok(network)
}

fn parse_ip(value: &str, family: Family) -> Result<IpAddr> {
    let ip: IpAddr = value
        .parse()
        .map_err(|e| KillSwitchError::invalid_address(value, e))?;
    if !family.matches(ip) {
        return Err(KillSwitchError::invalid_address(
            value,
            format!("not an {} address", family.name()),
        ));
    }
    Ok(ip)
}

/// `0.0.0.0/0` minus `server/32`, largest networks first.
pub fn exclude_from_default_route(server: Ipv4Addr) -> Vec<Ipv4Network> {
    let server_bits = u32::from(server);
    (1..=32u8)
        .filter_map(|prefix| {
            // Sibling of the server's /prefix network: same leading bits,
            // last prefix bit flipped.
            let mask = u32::MAX << (32 - u32::from(prefix));
            let flip = 1u32 << (32 - u32::from(prefix));
            let sibling = (server_bits & mask) ^ flip;
            Ipv4Network::new(Ipv4Addr::from(sibling), prefix).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn general() -> GeneralProfileConfig {
        GeneralProfileConfig::new("pvpn-killswitch", "pvpnksintrf0")
    }

    fn ipv4_block() -> IpConfig {
        IpConfig {
            addresses: vec!["100.85.0.1/24".into()],
            dns: vec!["0.0.0.0".into()],
            dns_priority: -1400,
            ignore_auto_dns: true,
            route_metric: 98,
            gateway: Some("100.85.0.1".into()),
            routes: vec![],
        }
    }

    #[test]
    fn test_missing_family_is_disabled() {
        let profile = ConnectionProfile::build(&general(), None, None).unwrap();

        assert_eq!(profile.ipv4, IpSettings::Disabled);
        assert_eq!(profile.ipv4.method(), "disabled");
        assert_eq!(profile.ipv6.method(), "disabled");
        assert_eq!(profile.connection_type, "dummy");
    }

    #[test]
    fn test_manual_family_keeps_every_setting() {
        let profile = ConnectionProfile::build(&general(), Some(&ipv4_block()), None).unwrap();
        let ipv4 = profile.ipv4.manual().unwrap();

        assert_eq!(profile.ipv4.method(), "manual");
        assert_eq!(ipv4.addresses, vec!["100.85.0.1/24".parse::<IpNetwork>().unwrap()]);
        assert_eq!(ipv4.dns, vec!["0.0.0.0".parse::<IpAddr>().unwrap()]);
        assert_eq!(ipv4.gateway, Some("100.85.0.1".parse().unwrap()));
        assert_eq!(ipv4.dns_priority, -1400);
        assert_eq!(ipv4.route_metric, 98);
        assert!(ipv4.ignore_auto_dns);
        assert!(ipv4.routes.is_empty());
    }

    #[test]
    fn test_routes_use_default_metric() {
        let mut config = ipv4_block();
        config.routes = vec![
            RouteSpec::to("10.0.0.0/8"),
            RouteSpec {
                destination: "192.168.0.0/16".into(),
                next_hop: Some("100.85.0.254".into()),
            },
        ];

        let profile = ConnectionProfile::build(&general(), Some(&config), None).unwrap();
        let routes = &profile.ipv4.manual().unwrap().routes;

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].next_hop, None);
        assert_eq!(routes[0].metric_or_default(), DEFAULT_ROUTE_METRIC);
        assert_eq!(routes[1].next_hop, Some("100.85.0.254".parse().unwrap()));
    }

    #[test]
    fn test_each_build_gets_fresh_uuid() {
        let a = ConnectionProfile::build(&general(), None, None).unwrap();
        let b = ConnectionProfile::build(&general(), None, None).unwrap();
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn test_malformed_cidr_is_rejected() {
        let mut config = ipv4_block();
        config.addresses = vec!["100.85.0.1/99".into()];
        let err = ConnectionProfile::build(&general(), Some(&config), None).unwrap_err();
        assert!(matches!(err, KillSwitchError::InvalidAddressFormat { .. }));

        config.addresses = vec!["100.85.0.1".into()];
        assert!(ConnectionProfile::build(&general(), Some(&config), None).is_err());
    }

    #[test]
    fn test_wrong_family_is_rejected() {
        let err = ConnectionProfile::build(&general(), None, Some(&ipv4_block())).unwrap_err();
        assert!(matches!(err, KillSwitchError::InvalidAddressFormat { .. }));
    }

    #[test]
    fn test_exclusion_covers_everything_but_server() {
        let server: Ipv4Addr = "185.159.157.1".parse().unwrap();
        let routes = exclude_from_default_route(server);

        assert_eq!(routes.len(), 32);
        assert_eq!(routes[0].prefix(), 1);
        assert_eq!(routes[31].prefix(), 32);
        assert!(routes.iter().all(|net| !net.contains(server)));

        // Total size of the pieces is the address space minus one host.
        let covered: u64 = routes.iter().map(|net| 1u64 << (32 - net.prefix())).sum();
        assert_eq!(covered, (1u64 << 32) - 1);

        for probe in ["0.0.0.0", "8.8.8.8", "185.159.157.0", "185.159.157.2", "255.255.255.255"] {
            let ip: Ipv4Addr = probe.parse().unwrap();
            assert!(routes.iter().any(|net| net.contains(ip)), "{probe} not covered");
        }
    }

    #[test]
    fn test_descriptor_serializes_method_tag() {
        let profile = ConnectionProfile::build(&general(), Some(&ipv4_block()), None).unwrap();
        let json = serde_json::to_value(&profile).unwrap();

        assert_eq!(json["ipv4"]["method"], "manual");
        assert_eq!(json["ipv6"]["method"], "disabled");
    }
}
