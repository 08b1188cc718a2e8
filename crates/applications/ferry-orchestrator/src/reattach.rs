//! Network identity reattachment with iproute2
//!
//! A restored endpoint must answer on the same address with the same MAC from its new
//! host, otherwise peers keep sending to a stale neighbour entry. On the target host we:
//!
//! 1. Recreate a macvlan link on the uplink carrying the preserved MAC
//! 2. Assign the address as a /32 and bring the link up
//! 3. Flush the route cache
//! 4. Pre-seed permanent neighbour entries for the always-on peers
//!
//! and then announce the address with an unsolicited ARP so the switch and peers learn
//! the new location before the first reply leaves.

use crate::remote::{SshExecutor, shell_quote};
use async_trait::async_trait;
use ferry_core::{CoreError, Endpoint, NeighborEntry, NetworkReattacher};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

type Result<T> = std::result::Result<T, CoreError>;

/// Interface name carrying an endpoint identity (fits IFNAMSIZ)
pub fn link_name(addr: Ipv4Addr) -> String {
    format!("fy{:08x}", u32::from(addr))
}

/// Shell script that binds `endpoint.identity` to `uplink`
pub fn reattach_script(endpoint: &Endpoint, uplink: &str, peers: &[NeighborEntry]) -> String {
    let link = link_name(endpoint.addr());
    let mut steps = vec![
        format!("ip link del {} 2>/dev/null || true", link),
        format!(
            "ip link add link {} name {} address {} type macvlan mode bridge",
            shell_quote(uplink),
            link,
            endpoint.mac()
        ),
        format!("ip addr replace {}/32 dev {}", endpoint.addr(), link),
        format!("ip link set {} up", link),
        "ip route flush cache".to_string(),
    ];
    for peer in peers {
        steps.push(format!(
            "ip neigh replace {} lladdr {} dev {} nud permanent",
            peer.addr, peer.mac, link
        ));
    }
    steps.join(" && ")
}

/// Unsolicited ARP for the endpoint address
pub fn announce_command(endpoint: &Endpoint) -> String {
    format!(
        "arping -U -c 1 -I {} {}",
        link_name(endpoint.addr()),
        endpoint.addr()
    )
}

/// Identity removal (idempotent)
pub fn detach_command(endpoint: &Endpoint) -> String {
    format!("ip link del {} 2>/dev/null || true", link_name(endpoint.addr()))
}

/// Network reattacher driving iproute2 and arping over SSH
pub struct IpReattacher {
    executor: Arc<SshExecutor>,
}

impl IpReattacher {
    pub fn new(executor: Arc<SshExecutor>) -> Self {
        Self { executor }
    }

    async fn run(&self, endpoint: &Endpoint, command: &str) -> Result<()> {
        let result = self.executor.run_command(&endpoint.host, command).await?;
        if !result.is_success() {
            return Err(CoreError::Reattach(format!(
                "{} on {}: {}",
                endpoint.identity,
                endpoint.host,
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkReattacher for IpReattacher {
    async fn reattach(&self, endpoint: &Endpoint, peers: &[NeighborEntry]) -> Result<()> {
        let uplink = self.executor.host(&endpoint.host)?.uplink.clone();

        info!(
            host = %endpoint.host,
            identity = %endpoint.identity,
            uplink = %uplink,
            peers = peers.len(),
            "Reattaching identity"
        );

        self.run(endpoint, &reattach_script(endpoint, &uplink, peers))
            .await
    }

    async fn announce(&self, endpoint: &Endpoint) -> Result<()> {
        debug!(host = %endpoint.host, addr = %endpoint.addr(), "Announcing address");
        self.run(endpoint, &announce_command(endpoint)).await
    }

    async fn detach(&self, endpoint: &Endpoint) -> Result<()> {
        info!(host = %endpoint.host, identity = %endpoint.identity, "Detaching identity");
        self.run(endpoint, &detach_command(endpoint)).await
    }
}
