//! Routing-table convergence
//!
//! The kernel routing table picks up route changes applied through the
//! network service eventually, with no "done" signal. Convergence is
//! observed by polling a text dump of the table on a fixed backoff
//! schedule:
//!
//! ```text
//!   sleep 0.5s -> check -> sleep 0.5s -> check -> sleep 1s -> check
//!   -> sleep 1s -> check -> sleep 2s -> check -> Timeout
//! ```

use crate::config::KillSwitchConfig;
use crate::error::{KillSwitchError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Ordered delays between successive checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    delays: Vec<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            [500, 500, 1_000, 1_000, 2_000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
        )
    }
}

impl BackoffPolicy {
    /// Create a policy sleeping `delays` in order
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Policy from the configured backoff schedule
    pub fn from_config(config: &KillSwitchConfig) -> Self {
        Self::new(config.route_backoff())
    }

    /// Sleep before each check
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Time spent sleeping when every check fails.
    pub fn total(&self) -> Duration {
        self.delays.iter().sum()
    }
}

/// Result of [`poll_until`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// The check passed on attempt `attempts` (1-based)
    Reached { attempts: usize, waited: Duration },
    /// Every attempt failed
    Exhausted(PollExhausted),
}

/// The schedule ran out before the check passed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollExhausted {
    pub attempts: usize,
    pub waited: Duration,
}

/// For each delay of `policy`: sleep, then run `check`. Stops at the
/// first `Ok(true)`; a check error aborts the poll.
pub async fn poll_until<F, Fut>(policy: &BackoffPolicy, mut check: F) -> Result<Convergence>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();

    for (index, delay) in policy.delays().iter().enumerate() {
        tokio::time::sleep(*delay).await;
        if check().await? {
            return Ok(Convergence::Reached {
                attempts: index + 1,
                waited: start.elapsed(),
            });
        }
    }

    Ok(Convergence::Exhausted(PollExhausted {
        attempts: policy.delays().len(),
        waited: start.elapsed(),
    }))
}

/// Source of the kernel routing table as text
#[async_trait]
pub trait RouteTable: Send + Sync {
    async fn dump(&self) -> Result<String>;
}

/// Runs an external command (`ip route` by default) printing the table.
#[derive(Debug, Clone)]
pub struct IpRouteCommand {
    program: String,
    args: Vec<String>,
}

impl IpRouteCommand {
    /// Command from program and arguments; fails when empty
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            KillSwitchError::BackendUnavailable("empty route command".to_string())
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// Command from the configured route command
    pub fn from_config(config: &KillSwitchConfig) -> Result<Self> {
        Self::new(&config.route_command)
    }
}

#[async_trait]
impl RouteTable for IpRouteCommand {
    async fn dump(&self) -> Result<String> {
        let program = self.program.clone();
        let args = self.args.clone();

        // Blocking process call, kept off both the runtime workers and the
        // network service loop.
        let output = tokio::task::spawn_blocking(move || Command::new(program).args(args).output())
            .await
            .map_err(|e| KillSwitchError::BackendUnavailable(format!("route command task failed: {e}")))?
            .map_err(|e| {
                KillSwitchError::BackendUnavailable(format!("failed to run {}: {e}", self.program))
            })?;

        if !output.status.success() {
            return Err(KillSwitchError::BackendUnavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// What a convergence poll waits for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConvergenceQuery {
    pub server_ip: Ipv4Addr,
    pub interface_name: String,
    pub expected_present: bool,
}

/// Whether the dump has a line `<server>[/32] via <gateway> dev <iface>`.
pub fn route_present(table: &str, server: Ipv4Addr, interface_name: &str) -> bool {
    table.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let Some(destination) = fields.next() else {
            return false;
        };
        let destination = destination.strip_suffix("/32").unwrap_or(destination);
        if destination.parse::<Ipv4Addr>().ok() != Some(server) {
            return false;
        }

        let rest: Vec<&str> = fields.collect();
        let via = rest
            .windows(2)
            .any(|pair| pair[0] == "via" && pair[1].parse::<IpAddr>().is_ok());
        let dev = rest
            .windows(2)
            .any(|pair| pair[0] == "dev" && pair[1] == interface_name);
        via && dev
    })
}

/// Polls a [`RouteTable`] until a query holds
#[derive(Clone)]
pub struct RouteWatcher {
    table: Arc<dyn RouteTable>,
    policy: BackoffPolicy,
}

impl RouteWatcher {
    /// Create a watcher polling `table`
    pub fn new(table: Arc<dyn RouteTable>, policy: BackoffPolicy) -> Self {
        Self { table, policy }
    }

    /// Polling schedule
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Wait until the route's presence matches the query. `Timeout` when
    /// the schedule runs out.
    pub async fn wait_for(&self, query: &RouteConvergenceQuery) -> Result<()> {
        let table = &*self.table;
        let outcome = poll_until(&self.policy, move || async move {
            let dump = table.dump().await?;
            Ok(route_present(&dump, query.server_ip, &query.interface_name) == query.expected_present)
        })
        .await?;

        let state = if query.expected_present { "present" } else { "absent" };
        match outcome {
            Convergence::Reached { attempts, waited } => {
                debug!(
                    "Route to {} via {} {} after {} check(s), {:?}",
                    query.server_ip, query.interface_name, state, attempts, waited
                );
                Ok(())
            }
            Convergence::Exhausted(exhausted) => {
                warn!(
                    "Route to {} via {} still not {} after {} checks",
                    query.server_ip, query.interface_name, state, exhausted.attempts
                );
                Err(KillSwitchError::Timeout {
                    operation: format!(
                        "waiting for route to {} via {} to be {}",
                        query.server_ip, query.interface_name, state
                    ),
                    after: exhausted.waited,
                })
            }
        }
    }
}
