//! Forwarding state: VIP groups, member slots, forwarding and NAT rules
//!
//! This is the controller-side mirror of the switch pipeline tables and the only legal
//! way to change them:
//!
//! ```text
//! five-tuple ──hash──▶ member slot ──▶ endpoint ──▶ forwarding rule ──▶ egress port
//!   (VIP group)        (stable index)   (mutable)    (one per address)
//! ```
//!
//! ## Referential integrity
//!
//! Records are created after, and deleted before, the records they reference:
//!
//! - member slots reference a group and a registered endpoint
//! - forwarding rules reference a registered endpoint
//! - NAT rules reference a group
//!
//! Every mutation goes through a [`ForwardingBatch`]. A batch is validated and applied
//! against a staged copy of the tables and only published when every operation
//! succeeded, so a batch is one atomic mutation: either all of it is visible or none.
//!
//! ## Migration leases
//!
//! An endpoint being migrated is leased to its job ([`MigrationLease`]). While the lease
//! is held, any write touching that endpoint fails with `Conflict` unless it is issued
//! through the lease itself. Dropping the lease releases the endpoint.
//!
//! A lease taken for a member rebind also reserves the replacement address, so no two
//! jobs can bring up the same new identity.

use crate::config::ControllerConfig;
use crate::error::{OrchestratorError, Result};
use crate::selector;
use ferry_core::{EgressPort, Endpoint, FiveTuple, HostId, MacAddr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One occupied slot of a member group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub index: u16,
    pub endpoint: Ipv4Addr,
    pub active: bool,
}

/// Fixed-size array of member slots serving one VIP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberGroup {
    pub vip: Ipv4Addr,
    slots: Vec<Option<Member>>,
}

impl MemberGroup {
    fn new(vip: Ipv4Addr, capacity: u16) -> Self {
        Self {
            vip,
            slots: vec![None; capacity as usize],
        }
    }

    pub fn capacity(&self) -> u16 {
        self.slots.len() as u16
    }

    pub fn member(&self, index: u16) -> Option<&Member> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.slots.iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn eligible(&self) -> Vec<bool> {
        self.slots
            .iter()
            .map(|slot| slot.is_some_and(|m| m.active))
            .collect()
    }

    fn slot_mut(&mut self, index: u16) -> Result<&mut Option<Member>> {
        let vip = self.vip;
        self.slots.get_mut(index as usize).ok_or_else(|| {
            OrchestratorError::not_found(format!("member index {} in group {}", index, vip))
        })
    }
}

/// Destination address -> physical attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub destination: Ipv4Addr,
    pub egress: EgressPort,
    /// Destination MAC written into forwarded frames
    pub hw_rewrite: Option<MacAddr>,
}

/// Where the pipeline sends a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// VIP group the packet was balanced through, if any
    pub vip: Option<Ipv4Addr>,
    /// Member slot that served the packet
    pub member_index: Option<u16>,
    pub endpoint: Ipv4Addr,
    pub egress: EgressPort,
    pub hw_rewrite: Option<MacAddr>,
}

/// A single table mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ForwardingOp {
    CreateGroup { vip: Ipv4Addr, capacity: u16 },
    DeleteGroup { vip: Ipv4Addr },
    UpsertEndpoint { endpoint: Endpoint },
    RemoveEndpoint { addr: Ipv4Addr },
    BindMember { vip: Ipv4Addr, index: u16, endpoint: Ipv4Addr },
    UnbindMember { vip: Ipv4Addr, index: u16 },
    SetActive { vip: Ipv4Addr, index: u16, active: bool },
    UpsertForward {
        destination: Ipv4Addr,
        egress: EgressPort,
        hw_rewrite: Option<MacAddr>,
    },
    RemoveForward { destination: Ipv4Addr },
    UpsertNat { service_port: u16, vip: Ipv4Addr },
    DeleteNat { service_port: u16 },
}

/// Ordered list of mutations applied atomically
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingBatch {
    ops: Vec<ForwardingOp>,
}

impl ForwardingBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, op: ForwardingOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn ops(&self) -> &[ForwardingOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl From<ForwardingOp> for ForwardingBatch {
    fn from(op: ForwardingOp) -> Self {
        Self { ops: vec![op] }
    }
}

/// Serializable copy of the whole store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingSnapshot {
    pub groups: BTreeMap<Ipv4Addr, MemberGroup>,
    pub endpoints: BTreeMap<Ipv4Addr, Endpoint>,
    pub forwards: BTreeMap<Ipv4Addr, ForwardingRule>,
    pub nat: BTreeMap<u16, Ipv4Addr>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    state: ForwardingSnapshot,
    /// endpoint or reserved replacement address -> owning migration job
    leases: BTreeMap<Ipv4Addr, Uuid>,
}

impl Tables {
    /// Endpoints an operation writes to (lease check)
    fn touched(&self, op: &ForwardingOp) -> Vec<Ipv4Addr> {
        let occupant = |vip: &Ipv4Addr, index: &u16| {
            self.state
                .groups
                .get(vip)
                .and_then(|g| g.member(*index))
                .map(|m| m.endpoint)
        };
        match op {
            ForwardingOp::UpsertEndpoint { endpoint } => vec![endpoint.addr()],
            ForwardingOp::RemoveEndpoint { addr } => vec![*addr],
            ForwardingOp::BindMember {
                vip,
                index,
                endpoint,
            } => std::iter::once(*endpoint)
                .chain(occupant(vip, index))
                .collect(),
            ForwardingOp::UnbindMember { vip, index }
            | ForwardingOp::SetActive { vip, index, .. } => {
                occupant(vip, index).into_iter().collect()
            }
            ForwardingOp::UpsertForward { destination, .. }
            | ForwardingOp::RemoveForward { destination } => vec![*destination],
            ForwardingOp::CreateGroup { .. }
            | ForwardingOp::DeleteGroup { .. }
            | ForwardingOp::UpsertNat { .. }
            | ForwardingOp::DeleteNat { .. } => Vec::new(),
        }
    }

    fn check_lease(&self, op: &ForwardingOp, holder: Option<Uuid>) -> Result<()> {
        for addr in self.touched(op) {
            if let Some(owner) = self.leases.get(&addr) {
                if Some(*owner) != holder {
                    return Err(OrchestratorError::conflict(format!(
                        "endpoint {} is being migrated by job {}",
                        addr, owner
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply one operation, returning whether anything changed
    fn apply(&mut self, op: &ForwardingOp) -> Result<bool> {
        let state = &mut self.state;
        match op {
            ForwardingOp::CreateGroup { vip, capacity } => {
                if *capacity == 0 {
                    return Err(OrchestratorError::invalid("group capacity must be positive"));
                }
                match state.groups.get(vip) {
                    Some(group) if group.capacity() == *capacity => Ok(false),
                    Some(group) => Err(OrchestratorError::conflict(format!(
                        "group {} already exists with capacity {}",
                        vip,
                        group.capacity()
                    ))),
                    None => {
                        state.groups.insert(*vip, MemberGroup::new(*vip, *capacity));
                        Ok(true)
                    }
                }
            }
            ForwardingOp::DeleteGroup { vip } => {
                let group = state
                    .groups
                    .get(vip)
                    .ok_or_else(|| OrchestratorError::not_found(format!("group {}", vip)))?;
                if !group.is_empty() {
                    return Err(OrchestratorError::ReferentialIntegrity(format!(
                        "group {} still has members",
                        vip
                    )));
                }
                if let Some(port) = state.nat.iter().find(|(_, v)| *v == vip).map(|(p, _)| *p) {
                    return Err(OrchestratorError::ReferentialIntegrity(format!(
                        "NAT rule for port {} still references group {}",
                        port, vip
                    )));
                }
                state.groups.remove(vip);
                Ok(true)
            }
            ForwardingOp::UpsertEndpoint { endpoint } => {
                let previous = state.endpoints.insert(endpoint.addr(), endpoint.clone());
                Ok(previous.as_ref() != Some(endpoint))
            }
            ForwardingOp::RemoveEndpoint { addr } => {
                if !state.endpoints.contains_key(addr) {
                    return Err(OrchestratorError::not_found(format!("endpoint {}", addr)));
                }
                if let Some(member) = state
                    .groups
                    .values()
                    .flat_map(MemberGroup::members)
                    .find(|m| m.endpoint == *addr)
                {
                    return Err(OrchestratorError::ReferentialIntegrity(format!(
                        "endpoint {} is still bound to member {}",
                        addr, member.index
                    )));
                }
                if state.forwards.contains_key(addr) {
                    return Err(OrchestratorError::ReferentialIntegrity(format!(
                        "endpoint {} still has a forwarding rule",
                        addr
                    )));
                }
                state.endpoints.remove(addr);
                Ok(true)
            }
            ForwardingOp::BindMember {
                vip,
                index,
                endpoint,
            } => {
                if !state.endpoints.contains_key(endpoint) {
                    return Err(OrchestratorError::not_found(format!("endpoint {}", endpoint)));
                }
                let group = state
                    .groups
                    .get_mut(vip)
                    .ok_or_else(|| OrchestratorError::not_found(format!("group {}", vip)))?;
                let slot = group.slot_mut(*index)?;
                match slot {
                    Some(member) if member.endpoint == *endpoint => Ok(false),
                    Some(member) => {
                        member.endpoint = *endpoint;
                        Ok(true)
                    }
                    None => {
                        *slot = Some(Member {
                            index: *index,
                            endpoint: *endpoint,
                            active: true,
                        });
                        Ok(true)
                    }
                }
            }
            ForwardingOp::UnbindMember { vip, index } => {
                let group = state
                    .groups
                    .get_mut(vip)
                    .ok_or_else(|| OrchestratorError::not_found(format!("group {}", vip)))?;
                let slot = group.slot_mut(*index)?;
                if slot.take().is_none() {
                    return Err(OrchestratorError::not_found(format!(
                        "member {} in group {}",
                        index, vip
                    )));
                }
                Ok(true)
            }
            ForwardingOp::SetActive { vip, index, active } => {
                let group = state
                    .groups
                    .get_mut(vip)
                    .ok_or_else(|| OrchestratorError::not_found(format!("group {}", vip)))?;
                let member = group.slot_mut(*index)?.as_mut().ok_or_else(|| {
                    OrchestratorError::not_found(format!("member {} in group {}", index, vip))
                })?;
                let changed = member.active != *active;
                member.active = *active;
                Ok(changed)
            }
            ForwardingOp::UpsertForward {
                destination,
                egress,
                hw_rewrite,
            } => {
                let endpoint = state.endpoints.get_mut(destination).ok_or_else(|| {
                    OrchestratorError::not_found(format!("endpoint {}", destination))
                })?;
                endpoint.egress = *egress;
                let rule = ForwardingRule {
                    destination: *destination,
                    egress: *egress,
                    hw_rewrite: *hw_rewrite,
                };
                let previous = state.forwards.insert(*destination, rule);
                Ok(previous != Some(rule))
            }
            ForwardingOp::RemoveForward { destination } => {
                if !state.forwards.contains_key(destination) {
                    return Err(OrchestratorError::not_found(format!(
                        "forwarding rule for {}",
                        destination
                    )));
                }
                if state
                    .groups
                    .values()
                    .flat_map(MemberGroup::members)
                    .any(|m| m.endpoint == *destination)
                {
                    return Err(OrchestratorError::ReferentialIntegrity(format!(
                        "forwarding rule for {} is still used by a member",
                        destination
                    )));
                }
                state.forwards.remove(destination);
                Ok(true)
            }
            ForwardingOp::UpsertNat { service_port, vip } => {
                if !state.groups.contains_key(vip) {
                    return Err(OrchestratorError::not_found(format!("group {}", vip)));
                }
                Ok(state.nat.insert(*service_port, *vip) != Some(*vip))
            }
            ForwardingOp::DeleteNat { service_port } => Ok(state.nat.remove(service_port).is_some()),
        }
    }
}

/// In-memory forwarding tables shared by the API and the orchestrator
#[derive(Debug, Default)]
pub struct ForwardingStore {
    tables: RwLock<Tables>,
}

impl ForwardingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the initial tables from the node list of a configuration
    pub fn provision(config: &ControllerConfig) -> Result<Self> {
        let store = Self::new();
        let inventory = config.inventory();

        let mut batch = ForwardingBatch::new().push(ForwardingOp::CreateGroup {
            vip: config.vip,
            capacity: config.group_capacity(),
        });

        for node in &config.nodes {
            let host = inventory.get(&node.host)?;
            batch = batch
                .push(ForwardingOp::UpsertEndpoint {
                    endpoint: Endpoint {
                        identity: ferry_core::NetworkIdentity {
                            addr: node.ipv4,
                            mac: node.mac,
                        },
                        host: node.host.clone(),
                        egress: host.egress,
                        container: node.container.clone(),
                    },
                })
                .push(ForwardingOp::UpsertForward {
                    destination: node.ipv4,
                    egress: host.egress,
                    hw_rewrite: Some(node.mac),
                });
        }

        for (index, node) in config.lb_members() {
            batch = batch.push(ForwardingOp::BindMember {
                vip: config.vip,
                index,
                endpoint: node.ipv4,
            });
        }

        batch = batch.push(ForwardingOp::UpsertNat {
            service_port: config.service_port,
            vip: config.vip,
        });

        store.apply(&batch)?;

        info!(
            vip = %config.vip,
            capacity = config.group_capacity(),
            nodes = config.nodes.len(),
            "Initialized load balancer"
        );

        Ok(store)
    }

    /// Apply a batch outside of any migration
    ///
    /// Returns whether the tables changed. Fails with `Conflict` if the batch touches
    /// an endpoint leased to a migration job.
    pub fn apply(&self, batch: &ForwardingBatch) -> Result<bool> {
        self.apply_as(batch, None)
    }

    fn apply_as(&self, batch: &ForwardingBatch, holder: Option<Uuid>) -> Result<bool> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);

        let mut staged = tables.clone();
        let mut changed = false;
        for op in batch.ops() {
            staged.check_lease(op, holder)?;
            changed |= staged.apply(op)?;
        }

        if changed {
            debug!(ops = batch.ops().len(), "Forwarding batch applied");
            *tables = staged;
        }
        Ok(changed)
    }

    /// Take the migration lease for an endpoint
    pub fn lease(self: &Arc<Self>, endpoint: Ipv4Addr, job: Uuid) -> Result<MigrationLease> {
        self.take_lease(endpoint, None, job)
    }

    /// Take the migration lease for an endpoint and reserve the address replacing it
    ///
    /// The replacement must be neither registered nor reserved by another job. Both
    /// addresses are taken under one lock.
    pub fn lease_with_replacement(
        self: &Arc<Self>,
        endpoint: Ipv4Addr,
        replacement: Ipv4Addr,
        job: Uuid,
    ) -> Result<MigrationLease> {
        self.take_lease(endpoint, Some(replacement), job)
    }

    fn take_lease(
        self: &Arc<Self>,
        endpoint: Ipv4Addr,
        replacement: Option<Ipv4Addr>,
        job: Uuid,
    ) -> Result<MigrationLease> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);

        if !tables.state.endpoints.contains_key(&endpoint) {
            return Err(OrchestratorError::not_found(format!("endpoint {}", endpoint)));
        }
        if let Some(owner) = tables.leases.get(&endpoint) {
            return Err(OrchestratorError::conflict(format!(
                "endpoint {} already has migration {} in flight",
                endpoint, owner
            )));
        }
        if let Some(addr) = replacement {
            if tables.state.endpoints.contains_key(&addr) {
                return Err(OrchestratorError::conflict(format!(
                    "address {} is already registered",
                    addr
                )));
            }
            if let Some(owner) = tables.leases.get(&addr) {
                return Err(OrchestratorError::conflict(format!(
                    "address {} is reserved by migration {}",
                    addr, owner
                )));
            }
            tables.leases.insert(addr, job);
        }
        tables.leases.insert(endpoint, job);

        Ok(MigrationLease {
            store: Arc::clone(self),
            endpoint,
            replacement,
            job,
        })
    }

    fn release(&self, endpoint: Ipv4Addr, job: Uuid) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if tables.leases.get(&endpoint) == Some(&job) {
            tables.leases.remove(&endpoint);
        }
    }

    /// Job currently holding the lease on `endpoint`
    pub fn lease_holder(&self, endpoint: Ipv4Addr) -> Option<Uuid> {
        self.read(|t| t.leases.get(&endpoint).copied())
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f(&tables)
    }

    pub fn create_group(&self, vip: Ipv4Addr, capacity: u16) -> Result<bool> {
        self.apply(&ForwardingOp::CreateGroup { vip, capacity }.into())
    }

    pub fn delete_group(&self, vip: Ipv4Addr) -> Result<bool> {
        self.apply(&ForwardingOp::DeleteGroup { vip }.into())
    }

    pub fn add_endpoint(&self, endpoint: Endpoint) -> Result<bool> {
        self.apply(&ForwardingOp::UpsertEndpoint { endpoint }.into())
    }

    pub fn remove_endpoint(&self, addr: Ipv4Addr) -> Result<bool> {
        self.apply(&ForwardingOp::RemoveEndpoint { addr }.into())
    }

    pub fn bind_member(&self, vip: Ipv4Addr, index: u16, endpoint: Ipv4Addr) -> Result<bool> {
        self.apply(
            &ForwardingOp::BindMember {
                vip,
                index,
                endpoint,
            }
            .into(),
        )
    }

    pub fn unbind_member(&self, vip: Ipv4Addr, index: u16) -> Result<bool> {
        self.apply(&ForwardingOp::UnbindMember { vip, index }.into())
    }

    pub fn set_active(&self, vip: Ipv4Addr, index: u16, active: bool) -> Result<bool> {
        self.apply(&ForwardingOp::SetActive { vip, index, active }.into())
    }

    pub fn upsert_forward(
        &self,
        destination: Ipv4Addr,
        egress: EgressPort,
        hw_rewrite: Option<MacAddr>,
    ) -> Result<bool> {
        self.apply(
            &ForwardingOp::UpsertForward {
                destination,
                egress,
                hw_rewrite,
            }
            .into(),
        )
    }

    pub fn remove_forward(&self, destination: Ipv4Addr) -> Result<bool> {
        self.apply(&ForwardingOp::RemoveForward { destination }.into())
    }

    pub fn upsert_nat(&self, service_port: u16, vip: Ipv4Addr) -> Result<bool> {
        self.apply(&ForwardingOp::UpsertNat { service_port, vip }.into())
    }

    pub fn delete_nat(&self, service_port: u16) -> Result<bool> {
        self.apply(&ForwardingOp::DeleteNat { service_port }.into())
    }

    /// Point an existing endpoint at a new attachment without migrating it
    ///
    /// Used when an identical endpoint is already running elsewhere. Applying the same
    /// arguments twice leaves the tables unchanged and returns `false`.
    pub fn relocate(
        &self,
        addr: Ipv4Addr,
        egress: EgressPort,
        hw_rewrite: Option<MacAddr>,
        host: Option<HostId>,
    ) -> Result<bool> {
        let current = self
            .endpoint(addr)
            .ok_or_else(|| OrchestratorError::not_found(format!("endpoint {}", addr)))?;
        let hw_rewrite = hw_rewrite.or_else(|| self.forward(addr).and_then(|r| r.hw_rewrite));

        let mut batch = ForwardingBatch::new();
        if let Some(host) = host {
            batch = batch.push(ForwardingOp::UpsertEndpoint {
                endpoint: current.relocated(host, egress),
            });
        }
        batch = batch.push(ForwardingOp::UpsertForward {
            destination: addr,
            egress,
            hw_rewrite,
        });
        self.apply(&batch)
    }

    /// Remove every entry in reverse referential order
    ///
    /// Returns the number of removed records.
    pub fn teardown_all(&self) -> Result<usize> {
        let snapshot = self.snapshot();

        let mut batch = ForwardingBatch::new();
        for port in snapshot.nat.keys() {
            batch = batch.push(ForwardingOp::DeleteNat {
                service_port: *port,
            });
        }
        for group in snapshot.groups.values() {
            for member in group.members() {
                batch = batch.push(ForwardingOp::UnbindMember {
                    vip: group.vip,
                    index: member.index,
                });
            }
        }
        for vip in snapshot.groups.keys() {
            batch = batch.push(ForwardingOp::DeleteGroup { vip: *vip });
        }
        for destination in snapshot.forwards.keys() {
            batch = batch.push(ForwardingOp::RemoveForward {
                destination: *destination,
            });
        }
        for addr in snapshot.endpoints.keys() {
            batch = batch.push(ForwardingOp::RemoveEndpoint { addr: *addr });
        }

        let removed = batch.ops().len();
        self.apply(&batch)?;
        info!(removed, "Forwarding tables cleared");
        Ok(removed)
    }

    /// Revoke every migration lease and remove every entry
    ///
    /// For controller exit only. Jobs still holding a lease lose it.
    pub fn shutdown(&self) -> Result<usize> {
        let revoked = {
            let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut tables.leases)
        };
        if !revoked.is_empty() {
            warn!(revoked = revoked.len(), "Revoked migration leases at shutdown");
        }
        self.teardown_all()
    }

    pub fn endpoint(&self, addr: Ipv4Addr) -> Option<Endpoint> {
        self.read(|t| t.state.endpoints.get(&addr).cloned())
    }

    pub fn group(&self, vip: Ipv4Addr) -> Option<MemberGroup> {
        self.read(|t| t.state.groups.get(&vip).cloned())
    }

    pub fn forward(&self, destination: Ipv4Addr) -> Option<ForwardingRule> {
        self.read(|t| t.state.forwards.get(&destination).copied())
    }

    pub fn nat(&self, service_port: u16) -> Option<Ipv4Addr> {
        self.read(|t| t.state.nat.get(&service_port).copied())
    }

    /// Group and member index an endpoint is bound to
    pub fn member_of(&self, endpoint: Ipv4Addr) -> Option<(Ipv4Addr, u16)> {
        self.read(|t| {
            t.state.groups.values().find_map(|g| {
                g.members()
                    .find(|m| m.endpoint == endpoint)
                    .map(|m| (g.vip, m.index))
            })
        })
    }

    pub fn snapshot(&self) -> ForwardingSnapshot {
        self.read(|t| t.state.clone())
    }

    /// Where the pipeline would send a packet with this five-tuple
    pub fn resolve(&self, tuple: &FiveTuple) -> Option<Resolution> {
        self.read(|t| {
            let state = &t.state;
            match state.groups.get(&tuple.dst_addr) {
                Some(group) => {
                    let index = selector::select(selector::flow_hash(tuple), &group.eligible())?;
                    let member = group.member(index as u16)?;
                    let rule = state.forwards.get(&member.endpoint)?;
                    Some(Resolution {
                        vip: Some(group.vip),
                        member_index: Some(member.index),
                        endpoint: member.endpoint,
                        egress: rule.egress,
                        hw_rewrite: rule.hw_rewrite,
                    })
                }
                None => {
                    let rule = state.forwards.get(&tuple.dst_addr)?;
                    Some(Resolution {
                        vip: None,
                        member_index: None,
                        endpoint: rule.destination,
                        egress: rule.egress,
                        hw_rewrite: rule.hw_rewrite,
                    })
                }
            }
        })
    }

    /// Source address rewrite for reply traffic leaving from `src_port`
    pub fn reply_source(&self, src_port: u16) -> Option<Ipv4Addr> {
        self.nat(src_port)
    }
}

/// Exclusive right to migrate one endpoint, held for a job's lifetime
#[derive(Debug)]
pub struct MigrationLease {
    store: Arc<ForwardingStore>,
    endpoint: Ipv4Addr,
    /// Reserved address of the endpoint's replacement
    replacement: Option<Ipv4Addr>,
    job: Uuid,
}

impl MigrationLease {
    pub fn endpoint(&self) -> Ipv4Addr {
        self.endpoint
    }

    pub fn replacement(&self) -> Option<Ipv4Addr> {
        self.replacement
    }

    pub fn job(&self) -> Uuid {
        self.job
    }

    /// Apply a batch on behalf of the owning job
    pub fn apply(&self, batch: &ForwardingBatch) -> Result<bool> {
        self.store.apply_as(batch, Some(self.job))
    }
}

impl Drop for MigrationLease {
    fn drop(&mut self) {
        self.store.release(self.endpoint, self.job);
        if let Some(addr) = self.replacement {
            self.store.release(addr, self.job);
        }
    }
}
