//! Remote execution over SSH
//!
//! Every host-side action (podman, iproute2, scp, stat) is a shell command run on the
//! host that owns the resource. Hosts configured with `ssh: "localhost"` run commands
//! through `sh -c` directly, everything else goes through `ssh -o BatchMode=yes`.
//!
//! ## Prerequisites
//!
//! Controller hosts need:
//! - Key-based SSH access to every configured host (no password prompts)
//! - `podman`, `iproute2`, `arping` and `ss` installed on every host

use crate::config::{HostConfig, HostInventory};
use ferry_core::{CoreError, HostId};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error, info};

type Result<T> = std::result::Result<T, CoreError>;

/// Default timeout for a single remote command
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// SSH connect timeout passed to the client
const SSH_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Runs shell commands on inventory hosts
#[derive(Debug, Clone)]
pub struct SshExecutor {
    inventory: HostInventory,
    /// Timeout for individual commands
    command_timeout: Duration,
}

impl SshExecutor {
    pub fn new(inventory: HostInventory) -> Self {
        Self {
            inventory,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    /// Set command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn host(&self, host: &HostId) -> Result<&HostConfig> {
        self.inventory.get(host)
    }

    /// Execute a shell command on a host
    ///
    /// A non-zero exit status is reported through [`CommandResult::status`], not as an
    /// error. Only spawn failures and timeouts are errors.
    pub async fn run_command(&self, host: &HostId, command: &str) -> Result<CommandResult> {
        let config = self.host(host)?;
        let (program, args) = invocation(config, command);

        debug!(host = %host, command = %command, "Running remote command");
        let start = Instant::now();

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await
        {
            Ok(output) => output?,
            Err(_) => {
                error!(
                    host = %host,
                    command = %command,
                    timeout_secs = self.command_timeout.as_secs(),
                    "Remote command timed out"
                );
                return Err(CoreError::Timeout(self.command_timeout));
            }
        };

        let status = if output.status.success() {
            CommandStatus::Success
        } else {
            CommandStatus::Failed
        };

        let result = CommandResult {
            host: host.clone(),
            command: command.to_string(),
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            duration: start.elapsed(),
        };

        debug!(
            host = %host,
            status = ?result.status,
            exit_code = ?result.exit_code,
            elapsed_ms = result.duration.as_millis() as u64,
            "Remote command finished"
        );

        Ok(result)
    }

    /// Execute a command and turn a non-zero exit into [`CoreError::Command`]
    pub async fn run_checked(&self, host: &HostId, command: &str) -> Result<CommandResult> {
        let result = self.run_command(host, command).await?;
        if result.is_success() {
            Ok(result)
        } else {
            Err(result.into_error())
        }
    }

    /// Execute a command whose failure is not worth surfacing
    pub async fn run_best_effort(&self, host: &HostId, command: &str) {
        match self.run_command(host, command).await {
            Ok(result) if result.is_success() => {}
            Ok(result) => {
                info!(
                    host = %host,
                    command = %command,
                    stderr = %result.stderr.trim(),
                    "Best-effort command failed, ignoring"
                );
            }
            Err(e) => {
                info!(host = %host, command = %command, error = %e, "Best-effort command failed, ignoring");
            }
        }
    }
}

/// Program and arguments that run `command` on `host`
pub fn invocation(host: &HostConfig, command: &str) -> (String, Vec<String>) {
    if host.is_local() {
        ("sh".to_string(), vec!["-c".to_string(), command.to_string()])
    } else {
        (
            "ssh".to_string(),
            vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                format!("ConnectTimeout={}", SSH_CONNECT_TIMEOUT_SECS),
                host.ssh.clone(),
                command.to_string(),
            ],
        )
    }
}

/// Quote a value for inclusion in a POSIX shell command
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Result of a remote command execution
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Host the command ran on
    pub host: HostId,

    /// Command line as sent to the shell
    pub command: String,

    /// Command status
    pub status: CommandStatus,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// Exit code (absent when killed by a signal)
    pub exit_code: Option<i32>,

    /// Wall-clock time of the command
    pub duration: Duration,
}

impl CommandResult {
    /// Check if command succeeded
    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }

    pub fn into_error(self) -> CoreError {
        CoreError::Command {
            host: self.host,
            command: self.command,
            exit_code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        }
    }
}

/// Status of a command execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Command exited with status 0
    Success,
    /// Command exited non-zero or was killed
    Failed,
}
