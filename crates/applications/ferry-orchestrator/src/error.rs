//! Error types for the orchestrator

use crate::job::Phase;
use ferry_core::{CoreError, RestoreFailure};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Orchestrator result type
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur in the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Forwarding reference to an unknown group, member or endpoint
    #[error("Not found: {0}")]
    NotFound(String),

    /// Overlapping migration on the same endpoint
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Mutation would leave a dangling reference
    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    /// Delivered snapshot size differs from the exported one
    #[error("Transfer integrity error: expected {expected} bytes, received {actual}")]
    TransferIntegrity { expected: u64, actual: u64 },

    /// Restore rejected by the checkpoint agent
    #[error("Restore error ({kind:?}): {message}")]
    Restore {
        kind: RestoreFailure,
        message: String,
        log: String,
    },

    /// Checkpoint agent exceeded its bound
    #[error("{operation} timed out after {after:?}")]
    AgentTimeout {
        operation: &'static str,
        after: Duration,
    },

    /// Identity could not be rebound on the target host
    #[error("Network reattach error: {0}")]
    NetworkReattach(String),

    /// Transient command or channel failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Job cancelled by the operator
    #[error("Migration cancelled")]
    Cancelled,

    /// Malformed or impossible request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Error raised while a migration phase was running
    #[error("{phase}: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<OrchestratorError>,
    },

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Flat classification of an error, as reported in job diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    ReferentialIntegrity,
    TransferIntegrity,
    RestoreReplayRejected,
    Restore,
    AgentTimeout,
    NetworkReattach,
    Transport,
    Cancelled,
    InvalidRequest,
    Internal,
}

impl OrchestratorError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an invalid-request error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Attach the phase an error was raised in (idempotent)
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Self::Phase { .. } => self,
            other => Self::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// Phase the error was raised in, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// The error without its phase annotation
    pub fn root(&self) -> &OrchestratorError {
        match self {
            Self::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::ReferentialIntegrity(_) => ErrorKind::ReferentialIntegrity,
            Self::TransferIntegrity { .. } => ErrorKind::TransferIntegrity,
            Self::Restore {
                kind: RestoreFailure::TransportReplayRejected,
                ..
            } => ErrorKind::RestoreReplayRejected,
            Self::Restore { .. } => ErrorKind::Restore,
            Self::AgentTimeout { .. } => ErrorKind::AgentTimeout,
            Self::NetworkReattach(_) => ErrorKind::NetworkReattach,
            Self::Transport(_) | Self::Http(_) | Self::Io(_) => ErrorKind::Transport,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidRequest(_) | Self::Json(_) => ErrorKind::InvalidRequest,
            Self::Config(_) | Self::Phase { .. } => ErrorKind::Internal,
        }
    }

    /// Diagnostic log attached by the checkpoint agent, if any
    pub fn agent_log(&self) -> Option<&str> {
        match self.root() {
            Self::Restore { log, .. } if !log.is_empty() => Some(log.as_str()),
            _ => None,
        }
    }

    /// Known remediation for explainable failure modes
    pub fn remediation(&self) -> Option<&'static str> {
        match self.kind() {
            ErrorKind::RestoreReplayRejected => Some(
                "unacknowledged send-queue data was rejected on replay: quiesce the source \
                 earlier or reduce its output rate so draining empties the send queue before \
                 the checkpoint, then submit a new migration",
            ),
            ErrorKind::TransferIntegrity => {
                Some("the snapshot arrived truncated; check target disk space and retry")
            }
            _ => None,
        }
    }
}

impl From<CoreError> for OrchestratorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Restore { kind, message, log } => Self::Restore { kind, message, log },
            CoreError::TransferIntegrity { expected, actual } => {
                Self::TransferIntegrity { expected, actual }
            }
            CoreError::Reattach(msg) => Self::NetworkReattach(msg),
            CoreError::UnknownHost(host) => Self::NotFound(format!("host {}", host)),
            CoreError::Timeout(after) => Self::Transport(format!("command timed out after {after:?}")),
            other => Self::Transport(other.to_string()),
        }
    }
}
