//! Podman checkpoint agent
//!
//! Implements [`CheckpointAgent`] with `podman container checkpoint/restore` (CRIU under
//! the hood) driven over [`SshExecutor`]. Established TCP connections are carried in the
//! snapshot (`--tcp-established`), so clients keep their sockets across the move.
//!
//! ```text
//! source host                                target host
//!   kill -s <quiesce>                          mkdir -p <checkpoint_dir>
//!   ss -tnH (send queue, polled)               podman image exists <image>
//!   podman container checkpoint --export ──▶  podman container restore --import
//!   podman rm -f (teardown)
//! ```
//!
//! A member-rebind import passes the replacement identity with `--ip` / `--mac-address`,
//! which rewrites the addresses recorded in the snapshot.

use crate::remote::{SshExecutor, shell_quote};
use async_trait::async_trait;
use chrono::Utc;
use ferry_core::{
    Checkpoint, CheckpointAgent, CoreError, Endpoint, HostId, ImportOptions, RestoreFailure,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, CoreError>;

/// Patterns CRIU prints when the kernel refuses to replay queued TCP data
const REPLAY_REJECTED_PATTERNS: &[&str] = &[
    "sk-tcp",
    "queue data",
    "tcp_repair",
    "Can't restore TCP",
    "restore_tcp_conn",
];

/// Checkpoint agent backed by podman on each host
pub struct PodmanAgent {
    executor: Arc<SshExecutor>,
    /// Signal that stops the service from originating data
    quiesce_signal: String,
    /// Signal undoing the quiesce
    resume_signal: String,
}

impl PodmanAgent {
    pub fn new(executor: Arc<SshExecutor>) -> Self {
        Self {
            executor,
            quiesce_signal: "SIGUSR1".to_string(),
            resume_signal: "SIGUSR2".to_string(),
        }
    }

    /// Set the quiesce and resume signals
    pub fn with_signals(mut self, quiesce: impl Into<String>, resume: impl Into<String>) -> Self {
        self.quiesce_signal = quiesce.into();
        self.resume_signal = resume.into();
        self
    }

    fn archive_path(&self, host: &HostId, checkpoint_id: &str) -> Result<PathBuf> {
        let config = self.executor.host(host)?;
        Ok(config.checkpoint_dir.join(format!("{}.tar", checkpoint_id)))
    }

    async fn archive_size(&self, host: &HostId, path: &Path) -> Result<u64> {
        let result = self
            .executor
            .run_checked(host, &stat_size_command(path))
            .await?;
        parse_size(&result.stdout)
    }

    async fn is_running(&self, endpoint: &Endpoint) -> Result<bool> {
        let result = self
            .executor
            .run_command(
                &endpoint.host,
                &format!(
                    "podman container inspect -f '{{{{.State.Running}}}}' {}",
                    shell_quote(&endpoint.container)
                ),
            )
            .await?;
        Ok(result.is_success() && result.stdout.trim() == "true")
    }
}

#[async_trait]
impl CheckpointAgent for PodmanAgent {
    async fn quiesce(&self, endpoint: &Endpoint) -> Result<()> {
        info!(
            host = %endpoint.host,
            container = %endpoint.container,
            signal = %self.quiesce_signal,
            "Quiescing endpoint"
        );
        self.executor
            .run_checked(
                &endpoint.host,
                &signal_command(&endpoint.container, &self.quiesce_signal),
            )
            .await?;
        Ok(())
    }

    async fn resume(&self, endpoint: &Endpoint) -> Result<()> {
        // An aborted export may have left the container stopped
        if !self.is_running(endpoint).await? {
            info!(
                host = %endpoint.host,
                container = %endpoint.container,
                "Container stopped by checkpoint, restoring in place"
            );
            self.executor
                .run_checked(
                    &endpoint.host,
                    &format!(
                        "podman container restore --tcp-established {}",
                        shell_quote(&endpoint.container)
                    ),
                )
                .await?;
        }

        self.executor
            .run_checked(
                &endpoint.host,
                &signal_command(&endpoint.container, &self.resume_signal),
            )
            .await?;

        info!(host = %endpoint.host, container = %endpoint.container, "Endpoint resumed");
        Ok(())
    }

    async fn send_queue_bytes(&self, endpoint: &Endpoint) -> Result<u64> {
        let command = format!(
            "nsenter -t \"$(podman container inspect -f '{{{{.State.Pid}}}}' {})\" -n ss -tnH state established",
            shell_quote(&endpoint.container)
        );
        let result = self.executor.run_checked(&endpoint.host, &command).await?;
        parse_send_queue(&result.stdout)
    }

    async fn export(&self, endpoint: &Endpoint, checkpoint_id: &str) -> Result<Checkpoint> {
        let path = self.archive_path(&endpoint.host, checkpoint_id)?;

        info!(
            host = %endpoint.host,
            container = %endpoint.container,
            path = %path.display(),
            "Exporting checkpoint"
        );

        self.executor
            .run_checked(&endpoint.host, &checkpoint_command(&endpoint.container, &path))
            .await?;

        let size_bytes = self.archive_size(&endpoint.host, &path).await?;

        info!(size_bytes, "Checkpoint exported");

        Ok(Checkpoint {
            id: checkpoint_id.to_string(),
            endpoint: endpoint.addr(),
            host: endpoint.host.clone(),
            path,
            size_bytes,
            created_at: Utc::now(),
        })
    }

    async fn prepare_target(&self, host: &HostId, image: Option<&str>) -> Result<()> {
        let dir = self.executor.host(host)?.checkpoint_dir.clone();
        self.executor
            .run_checked(
                host,
                &format!("mkdir -p {}", shell_quote(&dir.to_string_lossy())),
            )
            .await?;

        if let Some(image) = image {
            debug!(host = %host, image = %image, "Checking image presence");
            self.executor
                .run_checked(host, &format!("podman image exists {}", shell_quote(image)))
                .await?;
        }

        Ok(())
    }

    async fn import(
        &self,
        checkpoint: &Checkpoint,
        target: &Endpoint,
        options: &ImportOptions,
    ) -> Result<()> {
        info!(
            host = %target.host,
            container = %target.container,
            identity = %target.identity,
            resume_transport = options.resume_transport,
            "Importing checkpoint"
        );

        // Leftover from an earlier aborted attempt would collide with --name
        self.executor
            .run_best_effort(
                &target.host,
                &format!("podman rm -f --ignore {}", shell_quote(&target.container)),
            )
            .await;

        let command = restore_command(checkpoint, target, options);
        let result = self.executor.run_command(&target.host, &command).await?;

        if !result.is_success() {
            let log = format!("{}{}", result.stdout, result.stderr);
            let kind = classify_restore_failure(&log);
            warn!(
                host = %target.host,
                kind = ?kind,
                exit_code = ?result.exit_code,
                "Restore rejected"
            );
            return Err(CoreError::Restore {
                kind,
                message: format!(
                    "podman restore of {} on {} exited with {:?}",
                    checkpoint.id, target.host, result.exit_code
                ),
                log,
            });
        }

        Ok(())
    }

    async fn teardown(&self, endpoint: &Endpoint) -> Result<()> {
        info!(host = %endpoint.host, container = %endpoint.container, "Removing source container");
        self.executor
            .run_checked(
                &endpoint.host,
                &format!("podman rm -f {}", shell_quote(&endpoint.container)),
            )
            .await?;
        Ok(())
    }

    async fn discard(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!(host = %checkpoint.host, path = %checkpoint.path.display(), "Discarding checkpoint");
        self.executor
            .run_checked(
                &checkpoint.host,
                &format!("rm -f {}", shell_quote(&checkpoint.path.to_string_lossy())),
            )
            .await?;
        Ok(())
    }
}

fn signal_command(container: &str, signal: &str) -> String {
    format!(
        "podman kill --signal {} {}",
        shell_quote(signal),
        shell_quote(container)
    )
}

fn stat_size_command(path: &Path) -> String {
    format!("stat -c %s {}", shell_quote(&path.to_string_lossy()))
}

/// Checkpoint export; the container stops once its state is captured
pub fn checkpoint_command(container: &str, archive: &Path) -> String {
    format!(
        "podman container checkpoint --tcp-established --keep --export {} {}",
        shell_quote(&archive.to_string_lossy()),
        shell_quote(container)
    )
}

/// Checkpoint import on the target host
pub fn restore_command(checkpoint: &Checkpoint, target: &Endpoint, options: &ImportOptions) -> String {
    let mut args = vec![
        "podman container restore".to_string(),
        format!("--import {}", shell_quote(&checkpoint.path.to_string_lossy())),
        format!("--name {}", shell_quote(&target.container)),
        "--keep".to_string(),
    ];
    if options.resume_transport {
        args.push("--tcp-established".to_string());
    }
    if let Some(rewrite) = &options.rewrite {
        args.push(format!("--ip {}", rewrite.to.addr));
        args.push(format!("--mac-address {}", rewrite.to.mac));
    }
    args.join(" ")
}

/// Size printed by `stat -c %s`
pub fn parse_size(stdout: &str) -> Result<u64> {
    stdout
        .trim()
        .parse()
        .map_err(|_| CoreError::Parse(format!("unexpected stat output: {:?}", stdout.trim())))
}

/// Sum of the Send-Q column of `ss -tnH` output
///
/// With a state filter `ss` omits the State column, so the first numeric column is
/// Recv-Q either way.
pub fn parse_send_queue(stdout: &str) -> Result<u64> {
    let mut total = 0u64;
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.split_whitespace().peekable();
        if fields
            .peek()
            .is_some_and(|f| f.parse::<u64>().is_err())
        {
            fields.next();
        }
        let _recv_q = fields.next();
        let send_q = fields
            .next()
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or_else(|| CoreError::Parse(format!("unexpected ss line: {:?}", line)))?;
        total += send_q;
    }
    Ok(total)
}

/// Tell replay rejections apart from other restore failures
pub fn classify_restore_failure(log: &str) -> RestoreFailure {
    if REPLAY_REJECTED_PATTERNS.iter().any(|p| log.contains(p)) {
        RestoreFailure::TransportReplayRejected
    } else {
        RestoreFailure::Other
    }
}
