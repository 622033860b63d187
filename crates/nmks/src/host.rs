//! Host facts consulted when validating the backend.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Questions about the host the kill switch runs on
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Whether the netplan frontend library is installed.
    async fn netplan_present(&self) -> bool;

    /// Whether IPv6 is disabled on the kernel command line.
    async fn ipv6_disabled(&self) -> bool;
}

/// Probe asking the package manager and sysfs
#[derive(Debug, Clone)]
pub struct SystemHostProbe {
    apt: PathBuf,
    ipv6_disable_flag: PathBuf,
}

impl Default for SystemHostProbe {
    fn default() -> Self {
        Self::with_paths("/usr/bin/apt", "/sys/module/ipv6/parameters/disable")
    }
}

impl SystemHostProbe {
    /// Probe using the given apt binary and IPv6 flag file
    pub fn with_paths(apt: impl Into<PathBuf>, ipv6_disable_flag: impl Into<PathBuf>) -> Self {
        Self {
            apt: apt.into(),
            ipv6_disable_flag: ipv6_disable_flag.into(),
        }
    }
}

#[async_trait]
impl HostProbe for SystemHostProbe {
    async fn netplan_present(&self) -> bool {
        let apt = self.apt.clone();
        let output = tokio::task::spawn_blocking(move || {
            Command::new(apt).args(["show", "libnetplan1"]).output()
        })
        .await;

        // A missing apt or package both mean "no netplan".
        match output {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(e)) => {
                debug!("Could not run {}: {}", self.apt.display(), e);
                false
            }
            Err(e) => {
                debug!("Package query task failed: {}", e);
                false
            }
        }
    }

    async fn ipv6_disabled(&self) -> bool {
        let flag = self.ipv6_disable_flag.clone();
        let content = tokio::task::spawn_blocking(move || std::fs::read_to_string(flag)).await;

        match content {
            Ok(Ok(value)) => value.trim() == "1",
            _ => false,
        }
    }
}
