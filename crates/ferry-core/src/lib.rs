//! Ferry Core - Shared types and traits
//!
//! This crate defines the core abstractions used across:
//! - ferry-orchestrator (controller binary + library)
//! - host-side collaborators (checkpoint agent, transfer channel, network reattacher)
//!
//! Key types:
//! - Endpoint identity (address + hardware identity), hosts and switch egress ports
//! - Five-tuple used for connection-consistent selection
//! - CheckpointAgent / TransferChannel / NetworkReattacher traits
//! - Error types

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
