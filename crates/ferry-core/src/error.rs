//! Error types for Ferry collaborators

use std::time::Duration;
use thiserror::Error;

use crate::types::HostId;

/// How a restore attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreFailure {
    /// The kernel refused to replay unacknowledged send-queue data into the
    /// restored socket (stale peer transport state).
    TransportReplayRejected,
    /// Any other restore failure.
    Other,
}

/// Core error type for collaborator operations
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("command `{command}` on {host} failed (exit {exit_code:?}): {stderr}")]
    Command {
        host: HostId,
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("restore failed ({kind:?}): {message}")]
    Restore {
        kind: RestoreFailure,
        message: String,
        /// Diagnostic log produced by the restore tool
        log: String,
    },

    #[error("transfer size mismatch: expected {expected} bytes, found {actual}")]
    TransferIntegrity { expected: u64, actual: u64 },

    #[error("network reattach failed: {0}")]
    Reattach(String),

    #[error("Timeout: {0:?}")]
    Timeout(Duration),

    #[error("Unknown host: {0}")]
    UnknownHost(HostId),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
