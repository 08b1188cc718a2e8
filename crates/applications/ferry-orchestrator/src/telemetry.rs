//! Migration records for external samplers
//!
//! Every finished job is written as flat `key=value` lines, one per field, to
//! `<record_dir>/<job_id>.timing`. After a successful migration the same record is
//! written to the flag file, whose presence tells metric collectors that "a migration
//! just happened". Collectors remove the flag once they have sampled it.

use crate::config::TelemetryConfig;
use crate::error::Result;
use crate::job::{JobStatus, MigrationJob};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Writes migration records and the event flag
#[derive(Debug, Clone, Default)]
pub struct TelemetrySink {
    record_dir: Option<PathBuf>,
    flag_file: Option<PathBuf>,
}

impl TelemetrySink {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            record_dir: config.record_dir.clone(),
            flag_file: config.flag_file.clone(),
        }
    }

    /// Sink that writes nothing
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Publish a terminal job. Failures are logged and swallowed.
    pub async fn publish(&self, job: &MigrationJob) {
        if let Err(e) = self.write(job).await {
            warn!(job_id = %job.id, error = %e, "Failed to write migration record");
        }
    }

    async fn write(&self, job: &MigrationJob) -> Result<()> {
        let record = to_kv_lines(job);

        if let Some(dir) = &self.record_dir {
            tokio::fs::create_dir_all(dir).await?;
            let path = dir.join(format!("{}.timing", job.id));
            tokio::fs::write(&path, &record).await?;
            debug!(path = %path.display(), "Migration record written");
        }

        if job.status == JobStatus::Succeeded {
            if let Some(flag) = &self.flag_file {
                write_flag(flag, &record).await?;
            }
        }

        Ok(())
    }
}

async fn write_flag(path: &Path, record: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Readers must never see a half-written flag
    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, record).await?;
    tokio::fs::rename(&staging, path).await?;
    debug!(path = %path.display(), "Migration flag raised");
    Ok(())
}

/// Flat `key=value` rendering of a job
pub fn to_kv_lines(job: &MigrationJob) -> String {
    let mut out = String::new();
    let mut line = |key: &str, value: &dyn std::fmt::Display| {
        let _ = writeln!(out, "{}={}", key, value);
    };

    line("job_id", &job.id);
    line("status", &serde_label(&job.status));
    line("mode", &serde_label(&job.mode));
    line("source_ip", &job.source.addr());
    line("source_mac", &job.source.mac());
    line("source_host", &job.source.host);
    line("target_host", &job.target_host);
    if let Some(identity) = &job.new_identity {
        line("target_ip", &identity.addr);
        line("target_mac", &identity.mac);
    }
    line("teardown_policy", &serde_label(&job.teardown_policy));
    if let Some(bytes) = job.snapshot_bytes {
        line("snapshot_bytes", &bytes);
    }
    if let Some(drain) = &job.drain {
        line("drain_status", &serde_label(&drain.status));
        if let Some(queued) = drain.last_queue_bytes {
            line("drain_last_queue_bytes", &queued);
        }
    }

    let timings = job.timings();
    let durations = [
        ("quiesce_ms", timings.quiesce_ms),
        ("drain_ms", timings.drain_ms),
        ("checkpoint_ms", timings.checkpoint_ms),
        ("prepare_ms", timings.prepare_ms),
        ("transfer_ms", timings.transfer_ms),
        ("verify_ms", timings.verify_ms),
        ("restore_ms", timings.restore_ms),
        ("reattach_ms", timings.reattach_ms),
        ("forwarding_ms", timings.forwarding_ms),
        ("teardown_ms", timings.teardown_ms),
        ("time_to_ready_ms", timings.time_to_ready_ms),
        ("total_ms", timings.total_ms),
    ];
    for (key, value) in durations {
        if let Some(ms) = value {
            line(key, &format!("{:.3}", ms));
        }
    }

    if let Some(diagnostic) = &job.diagnostic {
        line("failed_phase", &diagnostic.phase);
        line("error_kind", &serde_label(&diagnostic.kind));
        line("source_removed", &diagnostic.source_removed);
    }

    out
}

/// snake_case name of a unit enum variant
fn serde_label<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}
