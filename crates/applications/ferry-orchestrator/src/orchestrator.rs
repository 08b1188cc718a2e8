//! Live migration orchestration
//!
//! Moves one endpoint, with its established TCP connections, to another host:
//!
//! ```text
//! Submit (lease the source endpoint)
//!     │
//!     ├── 1. Quiescing          stop originating application data
//!     ├── 2. Draining           poll Send-Q until empty or the ceiling passes
//!     ├── 3. Checkpointing  ┐   export with socket state (outage starts)
//!     │      TargetPreparing┘   directory + image on the target, concurrently
//!     ├── 4. Transferring       move the archive
//!     ├── 5. Verifying          delivered size == exported size
//!     ├── 6. Restoring          import with transport replay
//!     ├── 7. ReattachingNetwork same MAC, route flush, neighbours, gratuitous ARP
//!     ├── 8. ForwardingUpdate   one atomic store batch (outage ends)
//!     └── SourceTeardown        before restore, before forwarding or after forwarding
//! ```
//!
//! ## Key Design Decisions
//!
//! - **One task per job**: phases run serially except the checkpoint/prepare overlap
//! - **Single forwarding write**: the store is touched exactly once, after a successful
//!   restore, through the job's lease
//! - **Abort leaves the source serving**: until teardown, any failure resumes the source
//!   and discards every snapshot copy
//! - **No retries**: a failed job stays failed; a retry is a new job

use crate::config::{ControllerConfig, HostInventory, MigrationConfig};
use crate::drain::DrainManager;
use crate::error::{OrchestratorError, Result};
use crate::forwarding::{ForwardingBatch, ForwardingOp, ForwardingStore, MigrationLease};
use crate::job::{
    Diagnostic, JobRegistry, JobReport, JobStatus, MigrationJob, MigrationMode, Phase,
    TeardownPolicy,
};
use crate::telemetry::TelemetrySink;
use chrono::Utc;
use ferry_core::{
    Checkpoint, CheckpointAgent, CoreError, Endpoint, HostId, IdentityRewrite, ImportOptions,
    NeighborEntry, NetworkIdentity, NetworkReattacher, TransferChannel,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A request to migrate one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRequest {
    /// Address of the endpoint to move
    pub source: Ipv4Addr,
    pub target_host: HostId,
    /// Replacement identity; `None` keeps the source identity
    #[serde(default)]
    pub new_identity: Option<NetworkIdentity>,
}

/// Handle to a submitted job
#[derive(Debug)]
pub struct JobHandle {
    pub id: Uuid,
    task: JoinHandle<Option<MigrationJob>>,
}

impl JobHandle {
    /// Wait for the job to reach a terminal state
    pub async fn wait(self) -> Result<MigrationJob> {
        let id = self.id;
        self.task
            .await
            .map_err(std::io::Error::from)?
            .ok_or_else(|| OrchestratorError::not_found(format!("job {}", id)))
    }
}

/// Everything a job needs, fixed at submission
#[derive(Debug, Clone)]
struct JobPlan {
    id: Uuid,
    source: Endpoint,
    /// The endpoint as it will exist on the target host
    target: Endpoint,
    mode: MigrationMode,
    policy: TeardownPolicy,
    /// Group and member index the source serves
    member: Option<(Ipv4Addr, u16)>,
}

impl JobPlan {
    fn checkpoint_id(&self) -> String {
        format!("ferry-{}", self.id)
    }

    fn import_options(&self) -> ImportOptions {
        let rewrite = match self.mode {
            MigrationMode::SameIdentity => None,
            MigrationMode::MemberRebind => Some(IdentityRewrite {
                from: self.source.identity,
                to: self.target.identity,
            }),
        };
        ImportOptions {
            resume_transport: true,
            rewrite,
        }
    }

    /// The single forwarding mutation that ends the outage
    fn forwarding_batch(&self, suppress_nat_port: Option<u16>) -> ForwardingBatch {
        let mut batch = ForwardingBatch::new()
            .push(ForwardingOp::UpsertEndpoint {
                endpoint: self.target.clone(),
            })
            .push(ForwardingOp::UpsertForward {
                destination: self.target.addr(),
                egress: self.target.egress,
                hw_rewrite: Some(self.target.mac()),
            });

        match self.mode {
            MigrationMode::SameIdentity => {
                if let Some(service_port) = suppress_nat_port {
                    batch = batch.push(ForwardingOp::DeleteNat { service_port });
                }
            }
            MigrationMode::MemberRebind => {
                if let Some((vip, index)) = self.member {
                    batch = batch.push(ForwardingOp::BindMember {
                        vip,
                        index,
                        endpoint: self.target.addr(),
                    });
                }
            }
        }
        batch
    }

    /// Drop the records of a replaced endpoint
    fn retire_batch(&self) -> ForwardingBatch {
        ForwardingBatch::new()
            .push(ForwardingOp::RemoveForward {
                destination: self.source.addr(),
            })
            .push(ForwardingOp::RemoveEndpoint {
                addr: self.source.addr(),
            })
    }
}

/// What a job has done so far, for abort cleanup
#[derive(Debug, Default)]
struct Progress {
    quiesced: bool,
    checkpoints: Vec<Checkpoint>,
    restored: bool,
    forwarded: bool,
    source_removed: bool,
}

/// Monotonic offsets from job start
struct JobClock(Instant);

impl JobClock {
    fn start() -> Self {
        Self(Instant::now())
    }

    fn now_us(&self) -> u64 {
        self.0.elapsed().as_micros() as u64
    }
}

fn in_phase(phase: Phase) -> impl FnOnce(CoreError) -> OrchestratorError {
    move |e| OrchestratorError::from(e).in_phase(phase)
}

/// Runs migration jobs against the forwarding store and the host collaborators
pub struct MigrationOrchestrator {
    store: Arc<ForwardingStore>,
    agent: Arc<dyn CheckpointAgent>,
    channel: Arc<dyn TransferChannel>,
    reattacher: Arc<dyn NetworkReattacher>,
    inventory: HostInventory,
    config: MigrationConfig,
    drain: DrainManager,
    peers: Vec<NeighborEntry>,
    service_port: u16,
    suppress_nat: bool,
    jobs: JobRegistry,
    telemetry: TelemetrySink,
}

impl MigrationOrchestrator {
    pub fn new(
        store: Arc<ForwardingStore>,
        agent: Arc<dyn CheckpointAgent>,
        channel: Arc<dyn TransferChannel>,
        reattacher: Arc<dyn NetworkReattacher>,
        config: &ControllerConfig,
    ) -> Self {
        let migration = config.migration.clone();
        let drain = DrainManager::with_limits(
            migration.drain_poll_interval(),
            migration.drain_ceiling(),
        );
        Self {
            store,
            agent,
            channel,
            reattacher,
            inventory: config.inventory(),
            config: migration,
            drain,
            peers: config.always_on_peers.clone(),
            service_port: config.service_port,
            suppress_nat: config.suppress_nat_on_same_identity,
            jobs: JobRegistry::new(),
            telemetry: TelemetrySink::disabled(),
        }
    }

    /// Set the sink finished jobs are published to
    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn store(&self) -> &Arc<ForwardingStore> {
        &self.store
    }

    pub fn job(&self, id: Uuid) -> Option<MigrationJob> {
        self.jobs.get(id)
    }

    pub fn jobs(&self) -> Vec<MigrationJob> {
        self.jobs.list()
    }

    pub fn running_jobs(&self) -> usize {
        self.jobs.running()
    }

    /// Wait up to `limit` for running jobs to finish
    ///
    /// Returns how many are still running.
    pub async fn settle(&self, limit: Duration) -> usize {
        let deadline = Instant::now() + limit;
        loop {
            let running = self.running_jobs();
            if running == 0 || Instant::now() >= deadline {
                return running;
            }
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
    }

    /// Validate a request, lease the source and start the job
    ///
    /// Fails with `Conflict` if the source already has a migration in flight, without
    /// touching that migration.
    pub fn submit(self: &Arc<Self>, request: MigrationRequest) -> Result<JobHandle> {
        let source = self
            .store
            .endpoint(request.source)
            .ok_or_else(|| OrchestratorError::not_found(format!("endpoint {}", request.source)))?;
        let target_host = self.inventory.get(&request.target_host)?;

        match &request.new_identity {
            None if request.target_host == source.host => {
                return Err(OrchestratorError::invalid(format!(
                    "endpoint {} already runs on {}",
                    source.addr(),
                    source.host
                )));
            }
            Some(new) if new.addr == source.addr() => {
                return Err(OrchestratorError::invalid(
                    "replacement identity must differ from the source identity",
                ));
            }
            Some(_) if self.store.member_of(source.addr()).is_none() => {
                return Err(OrchestratorError::invalid(format!(
                    "endpoint {} is not a group member and cannot be replaced",
                    source.addr()
                )));
            }
            _ => {}
        }

        let job = MigrationJob::new(
            source.clone(),
            request.target_host.clone(),
            request.new_identity,
            self.config.teardown_policy,
        );
        let lease = match &request.new_identity {
            None => self.store.lease(source.addr(), job.id)?,
            Some(new) => self
                .store
                .lease_with_replacement(source.addr(), new.addr, job.id)?,
        };

        let target = match request.new_identity {
            None => source.relocated(request.target_host.clone(), target_host.egress),
            Some(identity) => Endpoint {
                identity,
                host: request.target_host.clone(),
                egress: target_host.egress,
                container: format!(
                    "{}-{}",
                    source.container,
                    identity.addr.to_string().replace('.', "-")
                ),
            },
        };

        let plan = JobPlan {
            id: job.id,
            source,
            target,
            mode: job.mode,
            policy: job.teardown_policy,
            member: self.store.member_of(request.source),
        };

        info!(
            job_id = %job.id,
            source = %plan.source.identity,
            from = %plan.source.host,
            to = %plan.target.host,
            mode = ?plan.mode,
            teardown = ?plan.policy,
            "Migration submitted"
        );

        let id = job.id;
        self.jobs.insert(job);
        let task = tokio::spawn(Arc::clone(self).run(plan, lease));

        Ok(JobHandle { id, task })
    }

    /// Request cancellation of a running job
    ///
    /// Honoured until the source teardown or the restore begins, whichever comes first.
    pub fn cancel(&self, id: Uuid) -> Result<JobReport> {
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| OrchestratorError::not_found(format!("job {}", id)))?;
        if job.status == JobStatus::Cancelled {
            return Ok(job.report());
        }

        self.jobs
            .update(id, |job| {
                if job.cancellable() {
                    job.cancel_requested = true;
                    Ok(())
                } else {
                    Err(OrchestratorError::conflict(format!(
                        "job {} can no longer be cancelled (phase {})",
                        id, job.phase
                    )))
                }
            })
            .unwrap_or_else(|| {
                Err(OrchestratorError::conflict(format!("job {} already finished", id)))
            })?;

        info!(job_id = %id, "Cancellation requested");

        self.jobs
            .get(id)
            .map(|j| j.report())
            .ok_or_else(|| OrchestratorError::not_found(format!("job {}", id)))
    }

    async fn run(self: Arc<Self>, plan: JobPlan, lease: MigrationLease) -> Option<MigrationJob> {
        let clock = JobClock::start();
        let mut progress = Progress::default();

        let outcome = self.migrate(&plan, &lease, &clock, &mut progress).await;

        if let Err(err) = &outcome {
            self.abort(&plan, &progress, err).await;
        }
        self.discard_checkpoints(&plan, &progress).await;

        // Release before publishing so a caller that sees the terminal state can resubmit
        drop(lease);

        let now = clock.now_us();
        let source_removed = progress.source_removed;
        self.jobs.update(plan.id, |job| {
            job.close_open(now);
            job.finished_at = Some(Utc::now());
            match &outcome {
                Ok(()) => {
                    job.status = JobStatus::Succeeded;
                    job.phase = Phase::Done;
                }
                Err(err) => {
                    job.diagnostic = Some(Diagnostic::from_error(err, job.phase, source_removed));
                    if matches!(err.root(), OrchestratorError::Cancelled) {
                        job.status = JobStatus::Cancelled;
                        job.phase = Phase::Cancelled;
                    } else {
                        job.status = JobStatus::Failed;
                        job.phase = Phase::Failed;
                    }
                }
            }
        });

        let job = self.jobs.get(plan.id)?;

        match job.status {
            JobStatus::Succeeded => {
                let timings = job.timings();
                info!(
                    job_id = %job.id,
                    time_to_ready_ms = ?timings.time_to_ready_ms,
                    total_ms = ?timings.total_ms,
                    snapshot_bytes = ?job.snapshot_bytes,
                    "Migration completed successfully"
                );
            }
            _ => {
                if let Some(diagnostic) = &job.diagnostic {
                    if diagnostic.source_removed {
                        error!(
                            job_id = %job.id,
                            phase = %diagnostic.phase,
                            kind = ?diagnostic.kind,
                            message = %diagnostic.message,
                            "Migration failed after the source was removed; endpoint is down"
                        );
                    } else {
                        warn!(
                            job_id = %job.id,
                            phase = %diagnostic.phase,
                            kind = ?diagnostic.kind,
                            message = %diagnostic.message,
                            "Migration aborted, source left serving"
                        );
                    }
                }
            }
        }

        self.telemetry.publish(&job).await;
        Some(job)
    }

    async fn migrate(
        &self,
        plan: &JobPlan,
        lease: &MigrationLease,
        clock: &JobClock,
        progress: &mut Progress,
    ) -> Result<()> {
        let id = plan.id;
        let source = &plan.source;

        // Phase 1: Quiesce
        self.enter(id, &[Phase::Quiescing], clock)?;
        self.agent
            .quiesce(source)
            .await
            .map_err(in_phase(Phase::Quiescing))?;
        progress.quiesced = true;
        self.leave(id, Phase::Quiescing, clock);

        // Phase 2: Drain (never fails)
        self.enter(id, &[Phase::Draining], clock)?;
        let drain = self.drain.drain(self.agent.as_ref(), source).await;
        let now = clock.now_us();
        self.jobs.update(id, |job| {
            job.drain = Some(drain);
            job.end(Phase::Draining, now);
        });

        // Phase 3: Checkpoint, with target preparation overlapped
        self.enter(id, &[Phase::TargetPreparing, Phase::Checkpointing], clock)?;
        let agent_timeout = self.config.agent_timeout();
        let checkpoint_id = plan.checkpoint_id();

        let export = async {
            let exported =
                tokio::time::timeout(agent_timeout, self.agent.export(source, &checkpoint_id))
                    .await;
            self.leave(id, Phase::Checkpointing, clock);
            match exported {
                Ok(result) => result.map_err(in_phase(Phase::Checkpointing)),
                Err(_) => Err(OrchestratorError::AgentTimeout {
                    operation: "checkpoint export",
                    after: agent_timeout,
                }
                .in_phase(Phase::Checkpointing)),
            }
        };
        let prepare = async {
            let prepared = tokio::time::timeout(
                agent_timeout,
                self.agent
                    .prepare_target(&plan.target.host, self.config.image.as_deref()),
            )
            .await;
            self.leave(id, Phase::TargetPreparing, clock);
            match prepared {
                Ok(result) => result.map_err(in_phase(Phase::TargetPreparing)),
                Err(_) => Err(OrchestratorError::AgentTimeout {
                    operation: "target preparation",
                    after: agent_timeout,
                }
                .in_phase(Phase::TargetPreparing)),
            }
        };
        let (exported, prepared) = tokio::join!(export, prepare);

        let checkpoint = exported?;
        progress.checkpoints.push(checkpoint.clone());
        prepared?;
        self.jobs
            .update(id, |job| job.snapshot_bytes = Some(checkpoint.size_bytes));

        // Phase 4: Transfer
        self.enter(id, &[Phase::Transferring], clock)?;
        let transfer_timeout = self.config.transfer_timeout();
        let delivered = match tokio::time::timeout(
            transfer_timeout,
            self.channel.send(&checkpoint, &plan.target.host),
        )
        .await
        {
            Ok(result) => result.map_err(in_phase(Phase::Transferring))?,
            Err(_) => {
                return Err(OrchestratorError::Transport(format!(
                    "snapshot transfer timed out after {:?}",
                    transfer_timeout
                ))
                .in_phase(Phase::Transferring));
            }
        };
        if delivered.host != checkpoint.host || delivered.path != checkpoint.path {
            progress.checkpoints.push(delivered.clone());
        }
        self.leave(id, Phase::Transferring, clock);

        // Phase 5: Verify
        self.enter(id, &[Phase::Verifying], clock)?;
        let actual = self
            .channel
            .verify(&delivered)
            .await
            .map_err(in_phase(Phase::Verifying))?;
        if actual != checkpoint.size_bytes {
            return Err(OrchestratorError::TransferIntegrity {
                expected: checkpoint.size_bytes,
                actual,
            }
            .in_phase(Phase::Verifying));
        }
        self.leave(id, Phase::Verifying, clock);

        if plan.policy == TeardownPolicy::BeforeRestore {
            self.teardown_source(plan, clock, progress).await?;
        }

        // Phase 6: Restore
        self.enter(id, &[Phase::Restoring], clock)?;
        match tokio::time::timeout(
            agent_timeout,
            self.agent
                .import(&delivered, &plan.target, &plan.import_options()),
        )
        .await
        {
            Ok(result) => result.map_err(in_phase(Phase::Restoring))?,
            Err(_) => {
                return Err(OrchestratorError::AgentTimeout {
                    operation: "checkpoint restore",
                    after: agent_timeout,
                }
                .in_phase(Phase::Restoring));
            }
        }
        progress.restored = true;
        self.leave(id, Phase::Restoring, clock);

        // Phase 7: Reattach the identity on the target attachment
        self.enter(id, &[Phase::ReattachingNetwork], clock)?;
        self.reattacher
            .reattach(&plan.target, &self.peers)
            .await
            .map_err(in_phase(Phase::ReattachingNetwork))?;
        self.reattacher
            .announce(&plan.target)
            .await
            .map_err(in_phase(Phase::ReattachingNetwork))?;
        self.leave(id, Phase::ReattachingNetwork, clock);

        if plan.policy == TeardownPolicy::BeforeForwarding {
            self.teardown_source(plan, clock, progress).await?;
        }

        // Phase 8: Forwarding update (single atomic batch)
        self.enter(id, &[Phase::ForwardingUpdate], clock)?;
        let suppress = self.suppress_nat.then_some(self.service_port);
        let changed = lease
            .apply(&plan.forwarding_batch(suppress))
            .map_err(|e| e.in_phase(Phase::ForwardingUpdate))?;
        progress.forwarded = true;
        self.leave(id, Phase::ForwardingUpdate, clock);
        debug!(job_id = %id, changed, "Forwarding updated");

        if plan.policy == TeardownPolicy::AfterForwarding {
            self.teardown_source(plan, clock, progress).await?;
        }

        if plan.mode == MigrationMode::MemberRebind {
            lease
                .apply(&plan.retire_batch())
                .map_err(|e| e.in_phase(Phase::SourceTeardown))?;
            debug!(job_id = %id, endpoint = %plan.source.addr(), "Replaced endpoint retired");
        }

        Ok(())
    }

    async fn teardown_source(
        &self,
        plan: &JobPlan,
        clock: &JobClock,
        progress: &mut Progress,
    ) -> Result<()> {
        self.enter(plan.id, &[Phase::SourceTeardown], clock)?;
        progress.source_removed = true;

        self.agent
            .teardown(&plan.source)
            .await
            .map_err(in_phase(Phase::SourceTeardown))?;
        self.reattacher
            .detach(&plan.source)
            .await
            .map_err(in_phase(Phase::SourceTeardown))?;

        self.leave(plan.id, Phase::SourceTeardown, clock);
        Ok(())
    }

    /// Best-effort cleanup after a failed or cancelled job
    async fn abort(&self, plan: &JobPlan, progress: &Progress, err: &OrchestratorError) {
        debug!(job_id = %plan.id, error = %err, "Aborting migration");

        if progress.forwarded {
            // Traffic already points at the target; nothing to roll back to
            return;
        }

        if progress.restored {
            if let Err(e) = self.agent.teardown(&plan.target).await {
                warn!(job_id = %plan.id, error = %e, "Failed to remove restored copy");
            }
            if let Err(e) = self.reattacher.detach(&plan.target).await {
                warn!(job_id = %plan.id, error = %e, "Failed to detach target identity");
            }
        }

        if progress.quiesced && !progress.source_removed {
            match self.agent.resume(&plan.source).await {
                Ok(()) => info!(job_id = %plan.id, "Source resumed"),
                Err(e) => warn!(job_id = %plan.id, error = %e, "Failed to resume source"),
            }
        }
    }

    async fn discard_checkpoints(&self, plan: &JobPlan, progress: &Progress) {
        let results = futures::future::join_all(
            progress
                .checkpoints
                .iter()
                .map(|checkpoint| self.agent.discard(checkpoint)),
        )
        .await;

        for (checkpoint, result) in progress.checkpoints.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    job_id = %plan.id,
                    host = %checkpoint.host,
                    path = %checkpoint.path.display(),
                    error = %e,
                    "Failed to discard checkpoint"
                );
            }
        }
    }

    /// Open phase records; fails with `Cancelled` if cancellation was requested
    fn enter(&self, id: Uuid, phases: &[Phase], clock: &JobClock) -> Result<()> {
        let now = clock.now_us();
        self.jobs
            .update(id, |job| {
                if job.cancel_requested {
                    return Err(OrchestratorError::Cancelled.in_phase(job.phase));
                }
                for phase in phases {
                    job.begin(*phase, now);
                }
                Ok(())
            })
            .unwrap_or(Err(OrchestratorError::Cancelled))?;

        if let Some(phase) = phases.last() {
            info!(job_id = %id, phase = %phase, "Entering phase");
        }
        Ok(())
    }

    fn leave(&self, id: Uuid, phase: Phase, clock: &JobClock) {
        let now = clock.now_us();
        self.jobs.update(id, |job| job.end(phase, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drain::DrainStatus;
    use crate::error::ErrorKind;
    use crate::forwarding::Resolution;
    use crate::selector::home_slot;
    use crate::testing::{
        FakeAgent, FakeChannel, FakeReattacher, Harness, VIP, config, identity,
    };
    use ferry_core::{EgressPort, FiveTuple};

    fn request(last: u8, target: &str) -> MigrationRequest {
        MigrationRequest {
            source: Ipv4Addr::new(10, 0, 0, last),
            target_host: HostId::new(target),
            new_identity: None,
        }
    }

    fn client_tuple(port: u16) -> FiveTuple {
        FiveTuple::tcp(Ipv4Addr::new(192, 168, 1, 20), port, VIP, 8080)
    }

    fn resolutions(h: &Harness) -> Vec<(FiveTuple, Resolution)> {
        (40_000..40_400)
            .map(client_tuple)
            .map(|t| (t, h.store.resolve(&t).unwrap()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_same_identity() {
        let h = Harness::new();
        let before = resolutions(&h);

        // 10.0.0.13 serves member index 2
        assert_eq!(h.store.member_of(Ipv4Addr::new(10, 0, 0, 13)), Some((VIP, 2)));

        let handle = h.orchestrator.submit(request(13, "host-b")).unwrap();
        let job = handle.wait().await.unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.phase, Phase::Done);
        assert_eq!(job.teardown_policy, TeardownPolicy::BeforeRestore);
        assert_eq!(job.snapshot_bytes, Some(1 << 20));
        assert_eq!(job.drain.as_ref().unwrap().status, DrainStatus::Drained);

        for (tuple, old) in before {
            let now = h.store.resolve(&tuple).unwrap();
            if home_slot(&tuple, 4) == 2 {
                assert_eq!(now.endpoint, Ipv4Addr::new(10, 0, 0, 13));
                assert_eq!(now.egress, EgressPort(2));
                assert_eq!(now.member_index, Some(2));
            } else {
                assert_eq!(now, old);
            }
        }

        let endpoint = h.store.endpoint(Ipv4Addr::new(10, 0, 0, 13)).unwrap();
        assert_eq!(endpoint.host, HostId::new("host-b"));
        assert_eq!(endpoint.identity, identity(13));
        assert_eq!(h.store.reply_source(8080), None);
        assert_eq!(h.store.lease_holder(Ipv4Addr::new(10, 0, 0, 13)), None);

        let t = job.timings();
        let sum = t.checkpoint_ms.unwrap()
            + t.transfer_ms.unwrap()
            + t.restore_ms.unwrap()
            + t.forwarding_ms.unwrap();
        assert!(sum <= t.time_to_ready_ms.unwrap() + 1.0);

        assert!(h.agent.called("teardown 10.0.0.13@host-a"));
        assert!(h.agent.called("import 10.0.0.13@host-b"));
        assert_eq!(h.agent.count("discard"), 2);
        assert!(!h.agent.called("resume"));
        assert!(
            h.reattacher
                .calls()
                .contains(&"reattach 10.0.0.13 02:00:00:00:00:0d@host-b peers=1".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarding_starts_after_restore_ends() {
        let h = Harness::new();
        let job = h
            .orchestrator
            .submit(request(11, "host-b"))
            .unwrap()
            .wait()
            .await
            .unwrap();

        let restore = job.record(Phase::Restoring).unwrap();
        let forwarding = job.record(Phase::ForwardingUpdate).unwrap();
        assert!(forwarding.started_us > restore.ended_us.unwrap());

        // Teardown ran before restore under the resolved policy
        let teardown = job.record(Phase::SourceTeardown).unwrap();
        assert!(teardown.ended_us.unwrap() <= restore.started_us);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_overlaps_target_preparation() {
        let h = Harness::new();
        let job = h
            .orchestrator
            .submit(request(12, "host-b"))
            .unwrap()
            .wait()
            .await
            .unwrap();

        let checkpoint = job.record(Phase::Checkpointing).unwrap();
        let prepare = job.record(Phase::TargetPreparing).unwrap();
        assert_eq!(checkpoint.started_us, prepare.started_us);
        assert!(prepare.ended_us.unwrap() < checkpoint.ended_us.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_transfer_leaves_source_serving() {
        let h = Harness::build(
            config(),
            FakeAgent::new(),
            FakeChannel::new().with_truncation(),
            FakeReattacher::new(),
        );
        let before = h.store.snapshot();

        let job = h
            .orchestrator
            .submit(request(13, "host-b"))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        let diagnostic = job.diagnostic.unwrap();
        assert_eq!(diagnostic.phase, Phase::Verifying);
        assert_eq!(diagnostic.kind, ErrorKind::TransferIntegrity);
        assert!(!diagnostic.source_removed);

        assert_eq!(h.store.snapshot(), before);
        assert!(h.agent.called("resume 10.0.0.13@host-a"));
        assert!(!h.agent.called("teardown"));
        assert!(!h.agent.called("import"));
        assert_eq!(h.agent.count("discard"), 2);
        assert_eq!(h.store.lease_holder(Ipv4Addr::new(10, 0, 0, 13)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_submission_conflicts() {
        let h = Harness::new();
        let first = h.orchestrator.submit(request(14, "host-b")).unwrap();

        let err = h.orchestrator.submit(request(14, "host-c")).unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
        assert_eq!(h.orchestrator.jobs().len(), 1);

        let job = first.wait().await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(
            h.store.endpoint(Ipv4Addr::new(10, 0, 0, 14)).unwrap().host,
            HostId::new("host-b")
        );

        // The endpoint can be moved again once the first job is done
        let again = h.orchestrator.submit(request(14, "host-c")).unwrap();
        assert_eq!(again.wait().await.unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_address_cannot_be_claimed_twice() {
        let h = Harness::new();
        let replacement = identity(23);
        let rebind = |source: u8, host: &str| MigrationRequest {
            source: Ipv4Addr::new(10, 0, 0, source),
            target_host: HostId::new(host),
            new_identity: Some(replacement),
        };

        let first = h.orchestrator.submit(rebind(11, "host-b")).unwrap();
        let err = h.orchestrator.submit(rebind(12, "host-c")).unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
        assert_eq!(h.orchestrator.jobs().len(), 1);
        assert_eq!(h.store.lease_holder(Ipv4Addr::new(10, 0, 0, 12)), None);

        let job = first.wait().await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(h.store.lease_holder(replacement.addr), None);

        // Exactly one slot points at the replacement, served from host-b
        let group = h.store.group(VIP).unwrap();
        assert_eq!(
            group
                .members()
                .filter(|m| m.endpoint == replacement.addr)
                .count(),
            1
        );
        assert_eq!(
            h.store.endpoint(Ipv4Addr::new(10, 0, 0, 12)).unwrap().host,
            HostId::new("host-a")
        );
        let rule = h.store.forward(replacement.addr).unwrap();
        assert_eq!(rule.egress, EgressPort(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_endpoints_migrate_concurrently() {
        let h = Harness::new();
        let a = h.orchestrator.submit(request(11, "host-b")).unwrap();
        let b = h.orchestrator.submit(request(12, "host-c")).unwrap();
        assert_eq!(h.orchestrator.running_jobs(), 2);

        let (a, b) = tokio::join!(a.wait(), b.wait());
        assert_eq!(a.unwrap().status, JobStatus::Succeeded);
        assert_eq!(b.unwrap().status, JobStatus::Succeeded);
        assert_eq!(h.store.forward(Ipv4Addr::new(10, 0, 0, 11)).unwrap().egress, EgressPort(2));
        assert_eq!(h.store.forward(Ipv4Addr::new(10, 0, 0, 12)).unwrap().egress, EgressPort(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_rebind() {
        let h = Harness::new();
        let before = resolutions(&h);
        let replacement = identity(23);

        let job = h
            .orchestrator
            .submit(MigrationRequest {
                source: Ipv4Addr::new(10, 0, 0, 13),
                target_host: HostId::new("host-b"),
                new_identity: Some(replacement),
            })
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.mode, MigrationMode::MemberRebind);
        assert_eq!(job.teardown_policy, TeardownPolicy::AfterForwarding);

        let group = h.store.group(VIP).unwrap();
        assert_eq!(group.member(2).unwrap().endpoint, replacement.addr);
        for (tuple, old) in before {
            let now = h.store.resolve(&tuple).unwrap();
            if home_slot(&tuple, 4) == 2 {
                assert_eq!(now.endpoint, replacement.addr);
                assert_eq!(now.hw_rewrite, Some(replacement.mac));
                assert_eq!(now.egress, EgressPort(2));
            } else {
                assert_eq!(now, old);
            }
        }

        // Old endpoint retired, NAT untouched in rebind mode
        assert!(h.store.endpoint(Ipv4Addr::new(10, 0, 0, 13)).is_none());
        assert!(h.store.forward(Ipv4Addr::new(10, 0, 0, 13)).is_none());
        assert_eq!(h.store.reply_source(8080), Some(VIP));
        assert!(h.agent.called("import 10.0.0.23@host-b rewrite 10.0.0.13->10.0.0.23"));

        let forwarding = job.record(Phase::ForwardingUpdate).unwrap();
        let teardown = job.record(Phase::SourceTeardown).unwrap();
        assert!(teardown.started_us >= forwarding.ended_us.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_rejection_is_explained() {
        let mut config = config();
        config.migration = config
            .migration
            .with_teardown_policy(TeardownPolicy::AfterForwarding);
        let h = Harness::build(
            config,
            FakeAgent::new().with_replay_rejection(),
            FakeChannel::new(),
            FakeReattacher::new(),
        );
        let before = h.store.snapshot();

        let job = h
            .orchestrator
            .submit(request(11, "host-b"))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        let diagnostic = job.diagnostic.unwrap();
        assert_eq!(diagnostic.phase, Phase::Restoring);
        assert_eq!(diagnostic.kind, ErrorKind::RestoreReplayRejected);
        assert!(diagnostic.agent_log.unwrap().contains("sk-tcp"));
        assert!(diagnostic.remediation.unwrap().contains("quiesce"));
        assert!(!diagnostic.source_removed);

        assert_eq!(h.store.snapshot(), before);
        assert!(h.agent.called("resume 10.0.0.11@host-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_teardown_is_loud() {
        let h = Harness::build(
            config(),
            FakeAgent::new().with_replay_rejection(),
            FakeChannel::new(),
            FakeReattacher::new(),
        );

        let job = h
            .orchestrator
            .submit(request(11, "host-b"))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.diagnostic.unwrap().source_removed);
        assert!(h.agent.called("teardown 10.0.0.11@host-a"));
        assert!(!h.agent.called("resume"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_failure_removes_restored_copy() {
        let mut config = config();
        config.migration = config
            .migration
            .with_teardown_policy(TeardownPolicy::AfterForwarding);
        let h = Harness::build(
            config,
            FakeAgent::new(),
            FakeChannel::new(),
            FakeReattacher::new().with_failure(),
        );
        let before = h.store.snapshot();

        let job = h
            .orchestrator
            .submit(request(12, "host-b"))
            .unwrap()
            .wait()
            .await
            .unwrap();

        let diagnostic = job.diagnostic.unwrap();
        assert_eq!(diagnostic.phase, Phase::ReattachingNetwork);
        assert_eq!(diagnostic.kind, ErrorKind::NetworkReattach);
        assert!(h.agent.called("teardown 10.0.0.12@host-b"));
        assert!(!h.agent.called("teardown 10.0.0.12@host-a"));
        assert!(h.agent.called("resume 10.0.0.12@host-a"));
        assert_eq!(h.store.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_timeout() {
        let mut config = config();
        config.migration = config
            .migration
            .with_agent_timeout(Duration::from_millis(500));
        let h = Harness::build(
            config,
            FakeAgent::new().with_hanging_export(),
            FakeChannel::new(),
            FakeReattacher::new(),
        );

        let job = h
            .orchestrator
            .submit(request(11, "host-b"))
            .unwrap()
            .wait()
            .await
            .unwrap();

        let diagnostic = job.diagnostic.unwrap();
        assert_eq!(diagnostic.phase, Phase::Checkpointing);
        assert_eq!(diagnostic.kind, ErrorKind::AgentTimeout);
        assert!(h.agent.called("resume 10.0.0.11@host-a"));
        assert!(h.channel.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_drain() {
        let h = Harness::with_agent(FakeAgent::new().with_unbounded_queue());
        let before = h.store.snapshot();

        let handle = h.orchestrator.submit(request(11, "host-b")).unwrap();
        let id = handle.id;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.orchestrator.job(id).unwrap().phase, Phase::Draining);
        h.orchestrator.cancel(id).unwrap();

        let job = handle.wait().await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.phase, Phase::Cancelled);
        assert_eq!(job.diagnostic.unwrap().kind, ErrorKind::Cancelled);
        assert!(h.agent.called("resume 10.0.0.11@host-a"));
        assert!(!h.agent.called("export"));
        assert_eq!(h.store.snapshot(), before);

        // Cancelling again is a no-op
        assert_eq!(h.orchestrator.cancel(id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_completion_conflicts() {
        let h = Harness::new();
        let job = h
            .orchestrator
            .submit(request(11, "host-b"))
            .unwrap()
            .wait()
            .await
            .unwrap();

        let err = h.orchestrator.cancel(job.id).unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
        let err = h.orchestrator.cancel(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_ceiling_does_not_fail_job() {
        let mut config = config();
        config.migration = config
            .migration
            .with_drain_ceiling(Duration::from_millis(750));
        let h = Harness::build(
            config,
            FakeAgent::new().with_unbounded_queue(),
            FakeChannel::new(),
            FakeReattacher::new(),
        );
        let job = h
            .orchestrator
            .submit(request(11, "host-b"))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        let drain = job.drain.unwrap();
        assert_eq!(drain.status, DrainStatus::CeilingReached);
        assert!(drain.drain_ms >= 750.0 && drain.drain_ms <= 850.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_waits_for_running_jobs() {
        let h = Harness::new();
        let _job = h.orchestrator.submit(request(11, "host-b")).unwrap();
        assert_eq!(h.orchestrator.running_jobs(), 1);

        assert_eq!(h.orchestrator.settle(Duration::from_secs(60)).await, 0);
        assert_eq!(h.store.lease_holder(Ipv4Addr::new(10, 0, 0, 11)), None);
        tokio_test::assert_ok!(h.store.teardown_all());
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let h = Harness::new();

        let err = h.orchestrator.submit(request(99, "host-b")).unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));

        let err = h.orchestrator.submit(request(11, "host-z")).unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));

        let err = h.orchestrator.submit(request(11, "host-a")).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));

        let err = h
            .orchestrator
            .submit(MigrationRequest {
                source: Ipv4Addr::new(10, 0, 0, 11),
                target_host: HostId::new("host-b"),
                new_identity: Some(identity(12)),
            })
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));

        // A non-member has no slot to hand over to its replacement
        let err = h
            .orchestrator
            .submit(MigrationRequest {
                source: Ipv4Addr::new(10, 0, 0, 50),
                target_host: HostId::new("host-b"),
                new_identity: Some(identity(51)),
            })
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
        assert!(h.store.forward(Ipv4Addr::new(10, 0, 0, 50)).is_some());

        assert!(h.orchestrator.jobs().is_empty());
    }
}
