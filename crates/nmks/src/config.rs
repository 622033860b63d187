//! Kill switch configuration
//!
//! Addresses and priorities of the dummy block-all profiles, bridge
//! timeouts and the route convergence schedule. Everything has a default;
//! a TOML file only needs the sections it overrides (a profile section,
//! when present, must be complete):
//!
//! ```toml
//! route_backoff_ms = [250, 250, 500]
//!
//! [timeouts]
//! activation_ms = 15000
//! ```

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Full kill switch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// IPv4 block-all profile
    pub ipv4: BlockProfileConfig,
    /// IPv6 block-all / leak protection profile
    pub ipv6: BlockProfileConfig,
    /// Bridge wait limits
    pub timeouts: Timeouts,
    /// Delays between routing-table checks (milliseconds)
    pub route_backoff_ms: Vec<u64>,
    /// Command printing the kernel routing table
    pub route_command: Vec<String>,
}

/// Static settings of one block-all profile family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockProfileConfig {
    /// Address of the dummy interface (CIDR)
    pub address: String,
    /// Gateway used when the whole address space is swallowed
    pub gateway: String,
    /// DNS servers pinned on the dummy interface
    pub dns: Vec<String>,
    /// Negative so these DNS servers win over every other interface
    pub dns_priority: i32,
    /// Worse than the VPN tunnel, better than physical interfaces
    pub route_metric: i64,
}

/// How long callers wait on the event loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Plain queries and quick calls
    pub call_ms: u64,
    /// Adding/removing profiles and applying routes
    pub activation_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            call_ms: 5_000,
            activation_ms: 10_000,
        }
    }
}

impl Timeouts {
    /// Limit for a single service call
    pub fn call(&self) -> Duration {
        Duration::from_millis(self.call_ms)
    }

    /// Limit for a device to reach its target state
    pub fn activation(&self) -> Duration {
        Duration::from_millis(self.activation_ms)
    }
}

impl BlockProfileConfig {
    /// Defaults for the IPv4 block-all profile.
    pub fn ipv4_default() -> Self {
        Self {
            address: "100.85.0.1/24".to_string(),
            gateway: "100.85.0.1".to_string(),
            dns: vec!["0.0.0.0".to_string()],
            dns_priority: -1400,
            route_metric: 98,
        }
    }

    /// Defaults for the IPv6 block-all profile.
    pub fn ipv6_default() -> Self {
        Self {
            address: "fdeb:446c:912d:08da::/64".to_string(),
            gateway: "fdeb:446c:912d:08da::1".to_string(),
            dns: vec!["::1".to_string()],
            dns_priority: -1400,
            route_metric: 95,
        }
    }

    fn validate(&self, family: &str, want_v4: bool) -> Result<(), ConfigError> {
        let network: IpNetwork = self
            .address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{family}.address {:?}", self.address)))?;
        let gateway: IpAddr = self
            .gateway
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{family}.gateway {:?}", self.gateway)))?;
        if network.is_ipv4() != want_v4 || gateway.is_ipv4() != want_v4 {
            return Err(ConfigError::Invalid(format!("{family} uses the wrong address family")));
        }
        for dns in &self.dns {
            dns.parse::<IpAddr>()
                .map_err(|_| ConfigError::Invalid(format!("{family}.dns {dns:?}")))?;
        }
        Ok(())
    }
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            ipv4: BlockProfileConfig::ipv4_default(),
            ipv6: BlockProfileConfig::ipv6_default(),
            timeouts: Timeouts::default(),
            route_backoff_ms: vec![500, 500, 1_000, 1_000, 2_000],
            route_command: vec!["ip".to_string(), "route".to_string()],
        }
    }
}

impl KillSwitchConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Route convergence delays as durations.
    pub fn route_backoff(&self) -> Vec<Duration> {
        self.route_backoff_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ipv4.validate("ipv4", true)?;
        self.ipv6.validate("ipv6", false)?;

        if self.timeouts.call_ms == 0 || self.timeouts.activation_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.route_backoff_ms.is_empty() {
            return Err(ConfigError::Invalid("route_backoff_ms is empty".into()));
        }
        if self.route_command.first().is_none_or(|program| program.is_empty()) {
            return Err(ConfigError::Invalid("route_command is empty".into()));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
