//! # Ferry Orchestrator
//!
//! Live migration of TCP endpoints behind a stable VIP.
//!
//! ## Architecture
//!
//! ```text
//!  clients ──► VIP ──► ForwardingStore ──► member slot ──► endpoint ──► egress port
//!                           ▲
//!                           │ one atomic batch per migration
//!                           │
//!  Control API ──► MigrationOrchestrator ──► CheckpointAgent   (podman over SSH)
//!                                        ──► TransferChannel   (scp / local copy)
//!                                        ──► NetworkReattacher (iproute2 + arping)
//! ```
//!
//! The controller owns all critical logic:
//! - Connection-consistent member selection (CRC-32C five-tuple hash, fixed slot array)
//! - Per-endpoint migration leases so two jobs never touch the same endpoint
//! - Quiesce, drain, checkpoint with socket state, transfer, verify, restore
//! - Identity reattachment (same MAC, neighbour pre-seeding, gratuitous ARP)
//! - A single forwarding write that ends the outage
//!
//! ## Same-identity migration
//!
//! 1. **Quiesce + drain**: stop originating data, wait for the send queue to empty
//! 2. **Checkpoint**: export with established sockets while the target prepares
//! 3. **Move**: transfer and size-verify the archive
//! 4. **Restore**: import with transport replay on the target host
//! 5. **Route**: reattach the identity and repoint the forwarding rule
//!
//! See [`orchestrator`] and [`forwarding`] for details.

#![warn(clippy::all)]

pub mod api;
pub mod checkpoint;
pub mod config;
pub mod drain;
pub mod error;
pub mod forwarding;
pub mod job;
pub mod orchestrator;
pub mod reattach;
pub mod remote;
pub mod selector;
pub mod telemetry;
pub mod transfer;

#[cfg(test)]
mod testing;

// ============================================================================
// Public exports - Migration
// ============================================================================

// Orchestration
pub use orchestrator::{JobHandle, MigrationOrchestrator, MigrationRequest};

// Jobs and diagnostics
pub use job::{
    Diagnostic, JobReport, JobStatus, JobTimings, MigrationJob, MigrationMode, Phase,
    TeardownPolicy,
};

// Drain management
pub use drain::{DrainManager, DrainResult, DrainStatus};

// ============================================================================
// Public exports - Forwarding
// ============================================================================

pub use forwarding::{
    ForwardingBatch, ForwardingOp, ForwardingRule, ForwardingSnapshot, ForwardingStore, Member,
    MemberGroup, MigrationLease, Resolution,
};
pub use selector::{flow_hash, home_slot};

// ============================================================================
// Public exports - Infrastructure
// ============================================================================

// Error handling
pub use error::{ErrorKind, OrchestratorError, Result};

// Configuration
pub use config::{ControllerConfig, HostConfig, HostInventory, MigrationConfig, TelemetryConfig};

// Host collaborators
pub use checkpoint::PodmanAgent;
pub use reattach::IpReattacher;
pub use remote::{CommandResult, CommandStatus, SshExecutor};
pub use transfer::ScpChannel;

// Observability
pub use telemetry::TelemetrySink;

// Control API
pub use api::{AppState, router};
