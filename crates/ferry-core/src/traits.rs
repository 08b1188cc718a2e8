//! Core traits for Ferry
//!
//! The migration orchestrator only talks to the outside world through these three
//! capability interfaces. Each call is request/response: it either completes or returns
//! an error, and the orchestrator bounds the slow ones with its own timeouts.

use async_trait::async_trait;

use crate::error::CoreError;
use crate::types::*;

/// Result type for collaborator operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Process-level freeze, snapshot and restore on a single host.
#[async_trait]
pub trait CheckpointAgent: Send + Sync {
    /// Stop the endpoint from originating new application data. Connections stay open.
    async fn quiesce(&self, endpoint: &Endpoint) -> Result<()>;

    /// Undo [`quiesce`](Self::quiesce) (and a stopped checkpoint) after an aborted migration.
    async fn resume(&self, endpoint: &Endpoint) -> Result<()>;

    /// Bytes sitting unacknowledged in the endpoint's TCP send queues.
    async fn send_queue_bytes(&self, endpoint: &Endpoint) -> Result<u64>;

    /// Export a snapshot including established socket state.
    async fn export(&self, endpoint: &Endpoint, checkpoint_id: &str) -> Result<Checkpoint>;

    /// Target-side preparation: checkpoint directory, image presence.
    async fn prepare_target(&self, host: &HostId, image: Option<&str>) -> Result<()>;

    /// Import `checkpoint` on `target.host` and resume the process as `target`.
    async fn import(
        &self,
        checkpoint: &Checkpoint,
        target: &Endpoint,
        options: &ImportOptions,
    ) -> Result<()>;

    /// Remove the endpoint's process from its host.
    async fn teardown(&self, endpoint: &Endpoint) -> Result<()>;

    /// Delete a snapshot archive from the host it lives on.
    async fn discard(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// Point-to-point bulk mover between two hosts.
#[async_trait]
pub trait TransferChannel: Send + Sync {
    /// Copy the snapshot to `target`, returning its description on the target host.
    async fn send(&self, checkpoint: &Checkpoint, target: &HostId) -> Result<Checkpoint>;

    /// Size of the delivered archive as observed on the receiving host.
    async fn verify(&self, delivered: &Checkpoint) -> Result<u64>;
}

/// Rebinds an endpoint's virtual network identity to a host attachment.
#[async_trait]
pub trait NetworkReattacher: Send + Sync {
    /// Recreate `endpoint.identity` on `endpoint.host`, keeping the MAC, flushing cached
    /// routes and pre-seeding `peers` in the neighbour cache.
    async fn reattach(&self, endpoint: &Endpoint, peers: &[NeighborEntry]) -> Result<()>;

    /// Send an unsolicited neighbour advertisement for the endpoint's address.
    async fn announce(&self, endpoint: &Endpoint) -> Result<()>;

    /// Remove the identity from `endpoint.host`.
    async fn detach(&self, endpoint: &Endpoint) -> Result<()>;
}
