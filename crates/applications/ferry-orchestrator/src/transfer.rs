//! Snapshot transfer between hosts
//!
//! The archive is pushed from the source host straight to the target host with `scp`,
//! so it never passes through the controller. When both hosts are the controller host
//! a plain `cp` is enough, and when source and target are the same host nothing moves.

use crate::checkpoint::parse_size;
use crate::config::HostConfig;
use crate::remote::{SshExecutor, shell_quote};
use async_trait::async_trait;
use ferry_core::{Checkpoint, CoreError, HostId, TransferChannel};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

type Result<T> = std::result::Result<T, CoreError>;

/// How an archive gets from one host to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPlan {
    /// Source and target are the same host and path
    InPlace,
    /// Both hosts are the controller host
    LocalCopy(String),
    /// `scp` run on the source host
    Scp(String),
}

impl TransferPlan {
    pub fn new(source: &HostConfig, target: &HostConfig, from: &Path, to: &Path) -> Self {
        if source.name == target.name && from == to {
            return Self::InPlace;
        }
        let from_arg = shell_quote(&from.to_string_lossy());
        let to_arg = shell_quote(&to.to_string_lossy());
        if source.is_local() && target.is_local() {
            Self::LocalCopy(format!("cp {} {}", from_arg, to_arg))
        } else {
            Self::Scp(format!(
                "scp -q -o BatchMode=yes {} {}:{}",
                from_arg,
                shell_quote(&target.ssh),
                to_arg
            ))
        }
    }
}

/// Transfer channel using `scp` (or `cp` for same-machine hosts)
pub struct ScpChannel {
    executor: Arc<SshExecutor>,
}

impl ScpChannel {
    pub fn new(executor: Arc<SshExecutor>) -> Self {
        Self { executor }
    }

    fn destination(&self, checkpoint: &Checkpoint, target: &HostConfig) -> PathBuf {
        let file_name = checkpoint
            .path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("{}.tar", checkpoint.id)));
        target.checkpoint_dir.join(file_name)
    }
}

#[async_trait]
impl TransferChannel for ScpChannel {
    async fn send(&self, checkpoint: &Checkpoint, target: &HostId) -> Result<Checkpoint> {
        let source_config = self.executor.host(&checkpoint.host)?;
        let target_config = self.executor.host(target)?;
        let destination = self.destination(checkpoint, target_config);

        let plan = TransferPlan::new(source_config, target_config, &checkpoint.path, &destination);
        let start = Instant::now();

        match &plan {
            TransferPlan::InPlace => {
                debug!(host = %target, "Snapshot already in place, skipping transfer");
            }
            TransferPlan::LocalCopy(command) | TransferPlan::Scp(command) => {
                info!(
                    from = %checkpoint.host,
                    to = %target,
                    size_bytes = checkpoint.size_bytes,
                    "Transferring snapshot"
                );
                self.executor.run_checked(&checkpoint.host, command).await?;
            }
        }

        let elapsed = start.elapsed();
        info!(
            to = %target,
            elapsed_ms = elapsed.as_millis() as u64,
            "Snapshot delivered"
        );

        Ok(checkpoint.delivered_to(target.clone(), destination))
    }

    async fn verify(&self, delivered: &Checkpoint) -> Result<u64> {
        let result = self
            .executor
            .run_checked(
                &delivered.host,
                &format!("stat -c %s {}", shell_quote(&delivered.path.to_string_lossy())),
            )
            .await?;
        parse_size(&result.stdout)
    }
}
