//! Send-queue draining before a checkpoint
//!
//! Once the source is quiesced it stops originating new application data, but bytes it
//! already wrote may still sit unacknowledged in its TCP send queues. Those bytes have to
//! be replayed on restore, and a large queue is the main reason replay gets rejected. We
//! therefore poll the queue until it is empty:
//!
//! 1. Probe the unacknowledged send-queue bytes
//! 2. Stop when the queue is empty
//! 3. Stop (and warn) when the ceiling is reached or the probe fails
//!
//! Draining never fails a migration; the worst case is checkpointing with data in flight.

use ferry_core::{CheckpointAgent, Endpoint};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default send-queue poll interval
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default drain ceiling
pub const DEFAULT_CEILING_MS: u64 = 2_000;

/// How a drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStatus {
    /// Send queues empty
    Drained,
    /// Gave up after the ceiling with data still queued
    CeilingReached,
    /// Probe failed; proceeded without knowing the queue size
    ProbeFailed,
}

/// Result of a completed drain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainResult {
    pub status: DrainStatus,
    /// Time spent draining (milliseconds)
    pub drain_ms: f64,
    /// Last observed send-queue size
    pub last_queue_bytes: Option<u64>,
    /// Number of probes issued
    pub polls: u32,
}

/// Polls an endpoint's send queue until it empties or the ceiling passes
#[derive(Debug, Clone)]
pub struct DrainManager {
    poll_interval: Duration,
    ceiling: Duration,
}

impl DrainManager {
    pub fn new() -> Self {
        Self::with_limits(
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            Duration::from_millis(DEFAULT_CEILING_MS),
        )
    }

    pub fn with_limits(poll_interval: Duration, ceiling: Duration) -> Self {
        Self {
            poll_interval,
            ceiling,
        }
    }

    /// Drain the source's send queues
    pub async fn drain(&self, agent: &dyn CheckpointAgent, endpoint: &Endpoint) -> DrainResult {
        let start = Instant::now();
        let mut polls = 0u32;
        let mut last_queue_bytes = None;

        info!(
            endpoint = %endpoint.addr(),
            ceiling_ms = self.ceiling.as_millis() as u64,
            "Draining send queues"
        );

        let status = loop {
            polls += 1;
            match agent.send_queue_bytes(endpoint).await {
                Ok(0) => {
                    last_queue_bytes = Some(0);
                    break DrainStatus::Drained;
                }
                Ok(bytes) => {
                    last_queue_bytes = Some(bytes);
                    debug!(endpoint = %endpoint.addr(), queued_bytes = bytes, "Send queue not empty");
                }
                Err(e) => {
                    warn!(
                        endpoint = %endpoint.addr(),
                        error = %e,
                        "Send-queue probe failed, checkpointing without drain"
                    );
                    break DrainStatus::ProbeFailed;
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.ceiling {
                warn!(
                    endpoint = %endpoint.addr(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    queued_bytes = ?last_queue_bytes,
                    "Drain ceiling reached, checkpointing with data in flight"
                );
                break DrainStatus::CeilingReached;
            }

            let remaining = self.ceiling - elapsed;
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        };

        let result = DrainResult {
            status,
            drain_ms: start.elapsed().as_micros() as f64 / 1_000.0,
            last_queue_bytes,
            polls,
        };

        info!(
            status = ?result.status,
            drain_ms = result.drain_ms,
            polls = result.polls,
            "Drain completed"
        );

        result
    }
}

impl Default for DrainManager {
    fn default() -> Self {
        Self::new()
    }
}
