//! Migration jobs: phases, timing records and the job registry

use crate::drain::DrainResult;
use crate::error::{ErrorKind, OrchestratorError};
use chrono::{DateTime, Utc};
use ferry_core::{Endpoint, HostId, NetworkIdentity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

/// Migration phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Quiescing,
    Draining,
    Checkpointing,
    TargetPreparing,
    Transferring,
    Verifying,
    Restoring,
    ReattachingNetwork,
    ForwardingUpdate,
    SourceTeardown,
    Done,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Quiescing => "quiescing",
            Phase::Draining => "draining",
            Phase::Checkpointing => "checkpointing",
            Phase::TargetPreparing => "target_preparing",
            Phase::Transferring => "transferring",
            Phase::Verifying => "verifying",
            Phase::Restoring => "restoring",
            Phase::ReattachingNetwork => "reattaching_network",
            Phase::ForwardingUpdate => "forwarding_update",
            Phase::SourceTeardown => "source_teardown",
            Phase::Done => "done",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the migrated endpoint is addressed afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// The endpoint keeps its address and MAC; only its attachment moves
    SameIdentity,
    /// A replacement endpoint with a new identity takes over the member index
    MemberRebind,
}

/// When the source process is removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// `BeforeRestore` for same-identity, `AfterForwarding` for member-rebind
    #[default]
    Auto,
    /// After the snapshot is verified, so a stale source never answers for the identity
    BeforeRestore,
    /// After the identity is reattached on the target
    BeforeForwarding,
    /// After the forwarding update; the source stays recoverable until then
    AfterForwarding,
}

impl TeardownPolicy {
    pub fn resolve(self, mode: MigrationMode) -> Self {
        match (self, mode) {
            (Self::Auto, MigrationMode::SameIdentity) => Self::BeforeRestore,
            (Self::Auto, MigrationMode::MemberRebind) => Self::AfterForwarding,
            (explicit, _) => explicit,
        }
    }
}

/// Terminal (or running) outcome of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Start/end of one phase, in microseconds since the job started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub started_us: u64,
    pub ended_us: Option<u64>,
}

impl PhaseRecord {
    pub fn duration_ms(&self) -> Option<f64> {
        self.ended_us
            .map(|end| end.saturating_sub(self.started_us) as f64 / 1_000.0)
    }
}

/// Why a job did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub phase: Phase,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    /// The source process was already removed when the job failed
    pub source_removed: bool,
}

impl Diagnostic {
    pub fn from_error(err: &OrchestratorError, fallback: Phase, source_removed: bool) -> Self {
        Self {
            phase: err.phase().unwrap_or(fallback),
            kind: err.kind(),
            message: err.root().to_string(),
            agent_log: err.agent_log().map(str::to_string),
            remediation: err.remediation().map(str::to_string),
            source_removed,
        }
    }
}

/// Per-phase durations derived from the phase records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTimings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiesce_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drain_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepare_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reattach_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarding_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_ms: Option<f64>,
    /// Checkpoint start to forwarding end: the service outage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_ready_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<f64>,
}

/// One migration attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: Uuid,
    pub source: Endpoint,
    pub target_host: HostId,
    pub mode: MigrationMode,
    /// Replacement identity (member-rebind only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_identity: Option<NetworkIdentity>,
    /// Teardown position after resolving `Auto`
    pub teardown_policy: TeardownPolicy,
    pub phase: Phase,
    pub status: JobStatus,
    pub records: Vec<PhaseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drain: Option<DrainResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
    /// Operator asked to cancel; honoured at the next phase boundary
    #[serde(default)]
    pub cancel_requested: bool,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationJob {
    pub fn new(
        source: Endpoint,
        target_host: HostId,
        new_identity: Option<NetworkIdentity>,
        policy: TeardownPolicy,
    ) -> Self {
        let mode = if new_identity.is_some() {
            MigrationMode::MemberRebind
        } else {
            MigrationMode::SameIdentity
        };
        Self {
            id: Uuid::new_v4(),
            source,
            target_host,
            mode,
            new_identity,
            teardown_policy: policy.resolve(mode),
            phase: Phase::Idle,
            status: JobStatus::Running,
            records: Vec::new(),
            snapshot_bytes: None,
            drain: None,
            diagnostic: None,
            cancel_requested: false,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != JobStatus::Running
    }

    /// Open a phase record and make it the current phase
    pub fn begin(&mut self, phase: Phase, at_us: u64) {
        self.phase = phase;
        self.records.push(PhaseRecord {
            phase,
            started_us: at_us,
            ended_us: None,
        });
    }

    /// Close the latest open record for `phase`
    pub fn end(&mut self, phase: Phase, at_us: u64) {
        if let Some(record) = self
            .records
            .iter_mut()
            .rev()
            .find(|r| r.phase == phase && r.ended_us.is_none())
        {
            record.ended_us = Some(at_us);
        }
    }

    /// Close every record still open (job aborted mid-phase)
    pub fn close_open(&mut self, at_us: u64) {
        for record in self.records.iter_mut().filter(|r| r.ended_us.is_none()) {
            record.ended_us = Some(at_us);
        }
    }

    pub fn record(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.records.iter().find(|r| r.phase == phase)
    }

    /// Whether the job still accepts cancellation
    pub fn cancellable(&self) -> bool {
        !self.is_terminal()
            && !matches!(
                self.phase,
                Phase::Restoring
                    | Phase::ReattachingNetwork
                    | Phase::ForwardingUpdate
                    | Phase::SourceTeardown
            )
            && self.record(Phase::SourceTeardown).is_none()
    }

    pub fn timings(&self) -> JobTimings {
        let ms = |phase| self.record(phase).and_then(PhaseRecord::duration_ms);

        let time_to_ready_ms = match (
            self.record(Phase::Checkpointing),
            self.record(Phase::ForwardingUpdate).and_then(|r| r.ended_us),
        ) {
            (Some(start), Some(end)) => {
                Some(end.saturating_sub(start.started_us) as f64 / 1_000.0)
            }
            _ => None,
        };

        let total_ms = self
            .records
            .iter()
            .filter_map(|r| r.ended_us)
            .max()
            .map(|end| end as f64 / 1_000.0);

        JobTimings {
            quiesce_ms: ms(Phase::Quiescing),
            drain_ms: ms(Phase::Draining),
            checkpoint_ms: ms(Phase::Checkpointing),
            prepare_ms: ms(Phase::TargetPreparing),
            transfer_ms: ms(Phase::Transferring),
            verify_ms: ms(Phase::Verifying),
            restore_ms: ms(Phase::Restoring),
            reattach_ms: ms(Phase::ReattachingNetwork),
            forwarding_ms: ms(Phase::ForwardingUpdate),
            teardown_ms: ms(Phase::SourceTeardown),
            time_to_ready_ms,
            total_ms,
        }
    }

    pub fn report(&self) -> JobReport {
        JobReport {
            job_id: self.id,
            phase: self.phase,
            status: self.status,
            mode: self.mode,
            source_identity: self.source.identity,
            source_host: self.source.host.clone(),
            target_host: self.target_host.clone(),
            new_identity: self.new_identity,
            teardown_policy: self.teardown_policy,
            timings_ms: self.timings(),
            snapshot_bytes: self.snapshot_bytes,
            drain: self.drain.clone(),
            diagnostic: self.diagnostic.clone(),
            cancel_requested: self.cancel_requested,
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
        }
    }
}

/// API view of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub phase: Phase,
    pub status: JobStatus,
    pub mode: MigrationMode,
    pub source_identity: NetworkIdentity,
    pub source_host: HostId,
    pub target_host: HostId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_identity: Option<NetworkIdentity>,
    pub teardown_policy: TeardownPolicy,
    pub timings_ms: JobTimings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drain: Option<DrainResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
    pub cancel_requested: bool,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// All jobs seen by this controller, terminal ones included
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, MigrationJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: MigrationJob) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.insert(job.id, job);
    }

    /// Mutate a job in place; terminal jobs are left untouched
    pub fn update<T>(&self, id: Uuid, f: impl FnOnce(&mut MigrationJob) -> T) -> Option<T> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.get_mut(&id).filter(|j| !j.is_terminal()).map(f)
    }

    pub fn get(&self, id: Uuid) -> Option<MigrationJob> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.get(&id).cloned()
    }

    /// Jobs in submission order
    pub fn list(&self) -> Vec<MigrationJob> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<MigrationJob> = jobs.values().cloned().collect();
        list.sort_by_key(|j| j.submitted_at);
        list
    }

    pub fn running(&self) -> usize {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.values().filter(|j| !j.is_terminal()).count()
    }
}
