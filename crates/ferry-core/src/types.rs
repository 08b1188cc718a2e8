//! Core types shared across Ferry components

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CoreError;

/// Unique identifier for a physical host
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(pub String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Switch egress port an endpoint is physically attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EgressPort(pub u16);

impl fmt::Display for EgressPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 48-bit hardware (MAC) address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({})", self)
    }
}

impl FromStr for MacAddr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| CoreError::Parse(format!("MAC address too short: {s}")))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| CoreError::Parse(format!("invalid MAC octet '{part}' in {s}")))?;
        }
        if parts.next().is_some() {
            return Err(CoreError::Parse(format!("MAC address too long: {s}")));
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

/// Virtual network identity of an endpoint: what clients and peers see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkIdentity {
    pub addr: Ipv4Addr,
    pub mac: MacAddr,
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.mac)
    }
}

/// A backend process instance and its current location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Stable identity (survives same-identity migration unchanged)
    pub identity: NetworkIdentity,
    /// Host currently running the process
    pub host: HostId,
    /// Switch port the host is attached to
    pub egress: EgressPort,
    /// Name the checkpoint agent knows the process (container) by
    pub container: String,
}

impl Endpoint {
    pub fn addr(&self) -> Ipv4Addr {
        self.identity.addr
    }

    pub fn mac(&self) -> MacAddr {
        self.identity.mac
    }

    /// The same process identity placed on another host/attachment.
    pub fn relocated(&self, host: HostId, egress: EgressPort) -> Self {
        Self {
            host,
            egress,
            ..self.clone()
        }
    }
}

/// A neighbour that should be pre-seeded in the cache of a restored endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub addr: Ipv4Addr,
    pub mac: MacAddr,
}

/// Protocol numbers used in five-tuples
pub const IPPROTO_TCP: u8 = 6;

/// Hash input for connection-consistent member selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FiveTuple {
    pub fn tcp(src_addr: Ipv4Addr, src_port: u16, dst_addr: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            src_addr,
            dst_addr,
            protocol: IPPROTO_TCP,
            src_port,
            dst_port,
        }
    }

    /// Canonical byte layout fed to the selection hash
    pub fn to_bytes(&self) -> [u8; 13] {
        let mut out = [0u8; 13];
        out[0..4].copy_from_slice(&self.src_addr.octets());
        out[4..8].copy_from_slice(&self.dst_addr.octets());
        out[8] = self.protocol;
        out[9..11].copy_from_slice(&self.src_port.to_be_bytes());
        out[11..13].copy_from_slice(&self.dst_port.to_be_bytes());
        out
    }
}

/// Opaque exported snapshot of an endpoint's process and transport state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Snapshot identifier (unique per migration job)
    pub id: String,
    /// Endpoint the snapshot was taken from
    pub endpoint: Ipv4Addr,
    /// Host the snapshot file currently lives on
    pub host: HostId,
    /// Location of the snapshot archive on `host`
    pub path: PathBuf,
    /// Size of the archive in bytes, as measured where it was produced
    pub size_bytes: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    /// The same snapshot after delivery to another host
    pub fn delivered_to(&self, host: HostId, path: PathBuf) -> Self {
        Self {
            host,
            path,
            ..self.clone()
        }
    }
}

/// Options for importing a snapshot on the target host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOptions {
    /// Restore established TCP connections (repair mode)
    pub resume_transport: bool,
    /// Identity rewrite applied to the snapshot (member-rebind migration)
    pub rewrite: Option<IdentityRewrite>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            resume_transport: true,
            rewrite: None,
        }
    }
}

/// Replace one network identity with another inside a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRewrite {
    pub from: NetworkIdentity,
    pub to: NetworkIdentity,
}
