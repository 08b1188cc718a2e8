//! Controller configuration
//!
//! Loaded once at startup from a JSON file:
//!
//! ```json
//! {
//!   "vip": "10.0.0.100",
//!   "service_port": 8080,
//!   "hosts": [
//!     { "name": "host-a", "ssh": "root@10.10.0.1", "egress": 1 },
//!     { "name": "host-b", "ssh": "root@10.10.0.2", "egress": 2 }
//!   ],
//!   "nodes": [
//!     { "ipv4": "10.0.0.11", "mac": "02:00:00:00:00:11", "host": "host-a" },
//!     { "ipv4": "10.0.0.50", "mac": "02:00:00:00:00:50", "host": "host-b", "is_lb_node": false }
//!   ],
//!   "migration": { "drain_ceiling_ms": 2000, "teardown_policy": "auto" }
//! }
//! ```

use crate::error::{OrchestratorError, Result};
use crate::job::TeardownPolicy;
use ferry_core::{CoreError, EgressPort, HostId, MacAddr, NeighborEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Address the control API listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Virtual IP clients connect to
    pub vip: Ipv4Addr,

    /// Well-known service port (NAT rules rewrite replies from this port to the VIP)
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    /// Number of member slots in the VIP group (defaults to the number of LB nodes)
    #[serde(default)]
    pub group_capacity: Option<u16>,

    /// Drop the service-port NAT rule when an endpoint migrates keeping its own address
    #[serde(default = "default_true")]
    pub suppress_nat_on_same_identity: bool,

    /// Physical hosts endpoints can live on
    pub hosts: Vec<HostConfig>,

    /// Endpoints provisioned at startup
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Always-on peers pre-seeded in the neighbour cache of restored endpoints
    #[serde(default)]
    pub always_on_peers: Vec<NeighborEntry>,

    #[serde(default)]
    pub migration: MigrationConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Directory for the rolling controller log
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_service_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

/// A physical host reachable over SSH
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: HostId,

    /// SSH destination (`user@addr`); `localhost` runs commands locally
    #[serde(default = "default_ssh")]
    pub ssh: String,

    /// Switch port the host is cabled to
    pub egress: EgressPort,

    /// Physical interface virtual identities are stacked on
    #[serde(default = "default_uplink")]
    pub uplink: String,

    /// Where checkpoint archives are written and received
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
}

fn default_ssh() -> String {
    "localhost".to_string()
}

fn default_uplink() -> String {
    "eth0".to_string()
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("/var/lib/ferry/checkpoints")
}

impl HostConfig {
    pub fn is_local(&self) -> bool {
        self.ssh == "localhost"
    }
}

/// An endpoint provisioned at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub ipv4: Ipv4Addr,
    pub mac: MacAddr,
    pub host: HostId,

    #[serde(default = "default_container")]
    pub container: String,

    /// Member slot in the VIP group (LB nodes only; defaults to declaration order)
    #[serde(default)]
    pub member_index: Option<u16>,

    /// `false` marks the client node, which gets the service-port NAT rule
    #[serde(default = "default_true")]
    pub is_lb_node: bool,
}

fn default_container() -> String {
    "server".to_string()
}

/// Migration timing knobs and policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Send-queue poll interval while draining
    pub drain_poll_interval_ms: u64,
    /// Give up draining after this long and checkpoint anyway
    pub drain_ceiling_ms: u64,
    /// Bound on checkpoint export and restore
    pub agent_timeout_ms: u64,
    /// Bound on snapshot transfer
    pub transfer_timeout_ms: u64,
    /// Bound on any other remote command
    pub command_timeout_ms: u64,
    pub teardown_policy: TeardownPolicy,
    /// Image that must exist on the target host before restoring
    pub image: Option<String>,
    /// Signal asking the service to stop originating data
    pub quiesce_signal: String,
    /// Signal undoing the quiesce after an aborted migration
    pub resume_signal: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            drain_poll_interval_ms: 100,
            drain_ceiling_ms: 2_000,
            agent_timeout_ms: 30_000,
            transfer_timeout_ms: 60_000,
            command_timeout_ms: 60_000,
            teardown_policy: TeardownPolicy::Auto,
            image: None,
            quiesce_signal: "SIGUSR1".to_string(),
            resume_signal: "SIGUSR2".to_string(),
        }
    }
}

impl MigrationConfig {
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn drain_ceiling(&self) -> Duration {
        Duration::from_millis(self.drain_ceiling_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Set the drain ceiling
    pub fn with_drain_ceiling(mut self, ceiling: Duration) -> Self {
        self.drain_ceiling_ms = ceiling.as_millis() as u64;
        self
    }

    /// Set the teardown policy
    pub fn with_teardown_policy(mut self, policy: TeardownPolicy) -> Self {
        self.teardown_policy = policy;
        self
    }

    /// Set the agent timeout
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// Where migration records are published for external samplers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// One `<job_id>.timing` file per finished job
    pub record_dir: Option<PathBuf>,
    /// Flag file touched (with the latest record) after every successful migration
    pub flag_file: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            record_dir: None,
            flag_file: Some(PathBuf::from("/tmp/migration_event")),
        }
    }
}

impl ControllerConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a configuration document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Member slots in the VIP group
    pub fn group_capacity(&self) -> u16 {
        self.group_capacity.unwrap_or_else(|| {
            let lb_nodes = self.nodes.iter().filter(|n| n.is_lb_node).count();
            lb_nodes.max(1) as u16
        })
    }

    /// LB nodes paired with their member index
    pub fn lb_members(&self) -> Vec<(u16, &NodeConfig)> {
        self.nodes
            .iter()
            .filter(|n| n.is_lb_node)
            .enumerate()
            .map(|(position, node)| (node.member_index.unwrap_or(position as u16), node))
            .collect()
    }

    pub fn inventory(&self) -> HostInventory {
        HostInventory::new(self.hosts.clone())
    }

    /// Check cross references and bounds
    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for host in &self.hosts {
            if !names.insert(&host.name) {
                return Err(OrchestratorError::config(format!(
                    "host {} declared twice",
                    host.name
                )));
            }
        }

        let mut addrs = BTreeSet::new();
        for node in &self.nodes {
            if !names.contains(&node.host) {
                return Err(OrchestratorError::config(format!(
                    "node {} refers to unknown host {}",
                    node.ipv4, node.host
                )));
            }
            if !addrs.insert(node.ipv4) {
                return Err(OrchestratorError::config(format!(
                    "node {} declared twice",
                    node.ipv4
                )));
            }
        }

        let capacity = self.group_capacity();
        if capacity == 0 {
            return Err(OrchestratorError::config("group_capacity must be at least 1"));
        }
        let mut indexes = BTreeSet::new();
        for (index, node) in self.lb_members() {
            if index >= capacity {
                return Err(OrchestratorError::config(format!(
                    "node {} member index {} outside group capacity {}",
                    node.ipv4, index, capacity
                )));
            }
            if !indexes.insert(index) {
                return Err(OrchestratorError::config(format!(
                    "member index {} used twice",
                    index
                )));
            }
        }

        let migration = &self.migration;
        if migration.drain_poll_interval_ms == 0 {
            return Err(OrchestratorError::config("drain_poll_interval_ms must be positive"));
        }
        if migration.drain_ceiling_ms < migration.drain_poll_interval_ms {
            return Err(OrchestratorError::config(
                "drain_ceiling_ms must not be shorter than drain_poll_interval_ms",
            ));
        }

        Ok(())
    }
}

/// Host lookup shared by the remote collaborators
#[derive(Debug, Clone, Default)]
pub struct HostInventory {
    hosts: BTreeMap<HostId, HostConfig>,
}

impl HostInventory {
    pub fn new(hosts: impl IntoIterator<Item = HostConfig>) -> Self {
        Self {
            hosts: hosts.into_iter().map(|h| (h.name.clone(), h)).collect(),
        }
    }

    pub fn get(&self, host: &HostId) -> std::result::Result<&HostConfig, CoreError> {
        self.hosts
            .get(host)
            .ok_or_else(|| CoreError::UnknownHost(host.clone()))
    }

    pub fn contains(&self, host: &HostId) -> bool {
        self.hosts.contains_key(host)
    }
}
