//! In-memory collaborators and fixtures for tests

use crate::config::ControllerConfig;
use crate::forwarding::ForwardingStore;
use crate::orchestrator::MigrationOrchestrator;
use async_trait::async_trait;
use chrono::Utc;
use ferry_core::{
    Checkpoint, CheckpointAgent, CoreError, EgressPort, Endpoint, HostId, ImportOptions, MacAddr,
    NeighborEntry, NetworkIdentity, NetworkReattacher, RestoreFailure, TransferChannel,
};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Result<T> = std::result::Result<T, CoreError>;

const DEFAULT_DELAY: Duration = Duration::from_millis(5);

pub const VIP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 100);

/// Endpoint 10.0.0.`last` with MAC 02:00:00:00:00:`last`
pub fn endpoint(last: u8, host: &str, egress: u16) -> Endpoint {
    Endpoint {
        identity: identity(last),
        host: HostId::new(host),
        egress: EgressPort(egress),
        container: "server".to_string(),
    }
}

pub fn identity(last: u8) -> NetworkIdentity {
    NetworkIdentity {
        addr: Ipv4Addr::new(10, 0, 0, last),
        mac: MacAddr([0x02, 0, 0, 0, 0, last]),
    }
}

/// Four LB members 10.0.0.11-14 on host-a, a client on host-c, host-b empty
pub fn config() -> ControllerConfig {
    ControllerConfig::from_json(
        r#"{
            "vip": "10.0.0.100",
            "service_port": 8080,
            "hosts": [
                { "name": "host-a", "egress": 1 },
                { "name": "host-b", "egress": 2 },
                { "name": "host-c", "egress": 3 }
            ],
            "nodes": [
                { "ipv4": "10.0.0.11", "mac": "02:00:00:00:00:0b", "host": "host-a" },
                { "ipv4": "10.0.0.12", "mac": "02:00:00:00:00:0c", "host": "host-a" },
                { "ipv4": "10.0.0.13", "mac": "02:00:00:00:00:0d", "host": "host-a" },
                { "ipv4": "10.0.0.14", "mac": "02:00:00:00:00:0e", "host": "host-a" },
                { "ipv4": "10.0.0.50", "mac": "02:00:00:00:00:32", "host": "host-c", "is_lb_node": false }
            ],
            "always_on_peers": [
                { "addr": "10.0.0.50", "mac": "02:00:00:00:00:32" }
            ],
            "telemetry": { "flag_file": null }
        }"#,
    )
    .expect("test config parses")
}

#[derive(Debug)]
enum QueueBehavior {
    Empty,
    Sequence(VecDeque<u64>),
    Unbounded,
    Failing,
}

/// Checkpoint agent that records calls and sleeps instead of working
#[derive(Debug)]
pub struct FakeAgent {
    queue: Mutex<QueueBehavior>,
    delay: Duration,
    snapshot_size: u64,
    reject_replay: bool,
    export_hangs: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(QueueBehavior::Empty),
            delay: DEFAULT_DELAY,
            snapshot_size: 1 << 20,
            reject_replay: false,
            export_hangs: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_queue_sequence(self, sizes: Vec<u64>) -> Self {
        *self.queue.lock().unwrap() = QueueBehavior::Sequence(sizes.into());
        self
    }

    pub fn with_unbounded_queue(self) -> Self {
        *self.queue.lock().unwrap() = QueueBehavior::Unbounded;
        self
    }

    pub fn with_failing_probe(self) -> Self {
        *self.queue.lock().unwrap() = QueueBehavior::Failing;
        self
    }

    pub fn with_replay_rejection(mut self) -> Self {
        self.reject_replay = true;
        self
    }

    pub fn with_hanging_export(mut self) -> Self {
        self.export_hangs = true;
        self
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether a call starting with `prefix` was made
    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointAgent for FakeAgent {
    async fn quiesce(&self, endpoint: &Endpoint) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.log(format!("quiesce {}@{}", endpoint.addr(), endpoint.host));
        Ok(())
    }

    async fn resume(&self, endpoint: &Endpoint) -> Result<()> {
        self.log(format!("resume {}@{}", endpoint.addr(), endpoint.host));
        Ok(())
    }

    async fn send_queue_bytes(&self, _endpoint: &Endpoint) -> Result<u64> {
        let mut queue = self.queue.lock().unwrap();
        match &mut *queue {
            QueueBehavior::Empty => Ok(0),
            QueueBehavior::Sequence(sizes) => Ok(sizes.pop_front().unwrap_or(0)),
            QueueBehavior::Unbounded => Ok(64 * 1024),
            QueueBehavior::Failing => Err(CoreError::Parse("ss: no output".to_string())),
        }
    }

    async fn export(&self, endpoint: &Endpoint, checkpoint_id: &str) -> Result<Checkpoint> {
        if self.export_hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        tokio::time::sleep(self.delay * 4).await;
        self.log(format!("export {}@{}", endpoint.addr(), endpoint.host));
        Ok(Checkpoint {
            id: checkpoint_id.to_string(),
            endpoint: endpoint.addr(),
            host: endpoint.host.clone(),
            path: PathBuf::from(format!("/ckpt/{}.tar", checkpoint_id)),
            size_bytes: self.snapshot_size,
            created_at: Utc::now(),
        })
    }

    async fn prepare_target(&self, host: &HostId, _image: Option<&str>) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.log(format!("prepare {}", host));
        Ok(())
    }

    async fn import(
        &self,
        checkpoint: &Checkpoint,
        target: &Endpoint,
        options: &ImportOptions,
    ) -> Result<()> {
        tokio::time::sleep(self.delay * 2).await;
        if self.reject_replay {
            self.log(format!("import-rejected {}@{}", target.addr(), target.host));
            return Err(CoreError::Restore {
                kind: RestoreFailure::TransportReplayRejected,
                message: format!("restore of {} failed", checkpoint.id),
                log: "Error (criu/sk-tcp.c:410): Can't restore 1 queue data".to_string(),
            });
        }
        let rewrite = options
            .rewrite
            .map(|r| format!(" rewrite {}->{}", r.from.addr, r.to.addr))
            .unwrap_or_default();
        self.log(format!("import {}@{}{}", target.addr(), target.host, rewrite));
        Ok(())
    }

    async fn teardown(&self, endpoint: &Endpoint) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.log(format!("teardown {}@{}", endpoint.addr(), endpoint.host));
        Ok(())
    }

    async fn discard(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.log(format!("discard {}", checkpoint.host));
        Ok(())
    }
}

/// Transfer channel that can deliver a truncated archive
#[derive(Debug)]
pub struct FakeChannel {
    delay: Duration,
    truncate: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self {
            delay: DEFAULT_DELAY,
            truncate: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_truncation(mut self) -> Self {
        self.truncate = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for FakeChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferChannel for FakeChannel {
    async fn send(&self, checkpoint: &Checkpoint, target: &HostId) -> Result<Checkpoint> {
        tokio::time::sleep(self.delay * 3).await;
        self.calls
            .lock()
            .unwrap()
            .push(format!("send {}->{}", checkpoint.host, target));
        Ok(checkpoint.delivered_to(target.clone(), checkpoint.path.clone()))
    }

    async fn verify(&self, delivered: &Checkpoint) -> Result<u64> {
        if self.truncate {
            Ok(delivered.size_bytes / 2)
        } else {
            Ok(delivered.size_bytes)
        }
    }
}

/// Network reattacher that records calls
#[derive(Debug)]
pub struct FakeReattacher {
    delay: Duration,
    fail: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeReattacher {
    pub fn new() -> Self {
        Self {
            delay: DEFAULT_DELAY,
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failure(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for FakeReattacher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkReattacher for FakeReattacher {
    async fn reattach(&self, endpoint: &Endpoint, peers: &[NeighborEntry]) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(CoreError::Reattach(format!(
                "macvlan creation failed on {}",
                endpoint.host
            )));
        }
        self.calls.lock().unwrap().push(format!(
            "reattach {} {}@{} peers={}",
            endpoint.addr(),
            endpoint.mac(),
            endpoint.host,
            peers.len()
        ));
        Ok(())
    }

    async fn announce(&self, endpoint: &Endpoint) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("announce {}@{}", endpoint.addr(), endpoint.host));
        Ok(())
    }

    async fn detach(&self, endpoint: &Endpoint) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("detach {}@{}", endpoint.addr(), endpoint.host));
        Ok(())
    }
}

/// Orchestrator wired to fakes and a store provisioned from [`config`]
pub struct Harness {
    pub store: Arc<ForwardingStore>,
    pub agent: Arc<FakeAgent>,
    pub channel: Arc<FakeChannel>,
    pub reattacher: Arc<FakeReattacher>,
    pub orchestrator: Arc<MigrationOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(config(), FakeAgent::new(), FakeChannel::new(), FakeReattacher::new())
    }

    pub fn build(
        config: ControllerConfig,
        agent: FakeAgent,
        channel: FakeChannel,
        reattacher: FakeReattacher,
    ) -> Self {
        let store = Arc::new(ForwardingStore::provision(&config).expect("provision"));
        let agent = Arc::new(agent);
        let channel = Arc::new(channel);
        let reattacher = Arc::new(reattacher);
        let orchestrator = Arc::new(MigrationOrchestrator::new(
            Arc::clone(&store),
            agent.clone(),
            channel.clone(),
            reattacher.clone(),
            &config,
        ));
        Self {
            store,
            agent,
            channel,
            reattacher,
            orchestrator,
        }
    }

    pub fn with_agent(agent: FakeAgent) -> Self {
        Self::build(config(), agent, FakeChannel::new(), FakeReattacher::new())
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
