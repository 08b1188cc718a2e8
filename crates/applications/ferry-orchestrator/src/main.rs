//! Ferry - live TCP endpoint migration controller
//!
//! ## Usage
//!
//! ```bash
//! # Run the controller (provisions the forwarding tables from the config)
//! ferry serve --config ferry.json
//!
//! # Move 10.0.0.13 to host-b keeping its identity, and wait for the outcome
//! ferry migrate --source 10.0.0.13 --target host-b --wait
//!
//! # Replace it with a new identity on host-c (member rebind)
//! ferry migrate --source 10.0.0.13 --target host-c --new-ip 10.0.0.23 --new-mac 02:00:00:00:00:17
//!
//! # Inspect jobs
//! ferry status
//! ferry status 6f1c0c1e-...
//!
//! # Point an endpoint at a new switch port without migrating it
//! ferry reattach --identity 10.0.0.13 --egress 3
//!
//! # Remove every forwarding entry
//! ferry cleanup
//! ```
//!
//! ## Teardown
//!
//! The controller owns the forwarding tables it provisions. When it exits on SIGINT or
//! SIGTERM it removes every entry it created, in reverse referential order.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use ferry_core::{EgressPort, HostId, MacAddr, NetworkIdentity};
use ferry_orchestrator::{
    ControllerConfig, ForwardingStore, IpReattacher, JobReport, JobStatus,
    MigrationOrchestrator, PodmanAgent, ScpChannel, SshExecutor, TelemetrySink,
    api::{
        CleanupResponse, ErrorBody, HealthResponse, MigrateRequest, MigrateResponse,
        ReattachRequest, ReattachResponse,
    },
    router,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Poll interval for `migrate --wait`
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Ferry: live migration of TCP endpoints behind a stable VIP
#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Live TCP endpoint migration controller", long_about = None)]
struct Cli {
    /// Controller base URL (client commands)
    #[arg(
        long,
        global = true,
        env = "FERRY_CONTROLLER",
        default_value = "http://127.0.0.1:5000"
    )]
    controller: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller: forwarding store, orchestrator and control API
    Serve {
        /// Controller configuration file
        #[arg(long, env = "FERRY_CONFIG")]
        config: PathBuf,

        /// Override the configured listen address
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Submit a migration
    Migrate {
        /// Address of the endpoint to move
        #[arg(long)]
        source: Ipv4Addr,

        /// Host to move it to
        #[arg(long)]
        target: String,

        /// Replacement address (member rebind)
        #[arg(long, requires = "new_mac")]
        new_ip: Option<Ipv4Addr>,

        /// Replacement MAC (member rebind)
        #[arg(long, requires = "new_ip")]
        new_mac: Option<MacAddr>,

        /// Wait for the job to finish and print its report
        #[arg(long)]
        wait: bool,
    },

    /// Show one job, or all jobs
    Status {
        /// Job ID
        job: Option<Uuid>,
    },

    /// Cancel a running job
    Cancel {
        /// Job ID
        job: Uuid,
    },

    /// Point an endpoint at a new egress port without migrating it
    Reattach {
        /// Endpoint address
        #[arg(long)]
        identity: Ipv4Addr,

        /// New switch egress port
        #[arg(long)]
        egress: u16,

        /// Hardware address to rewrite to
        #[arg(long)]
        mac: Option<MacAddr>,

        /// Host the endpoint now runs on
        #[arg(long)]
        host: Option<String>,
    },

    /// Remove every forwarding entry from a running controller
    Cleanup,

    /// Check that a controller is up
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => serve(&config, listen).await,
        command => {
            init_tracing(None);
            let client = ControllerClient::new(cli.controller);
            run_client(&client, command).await
        }
    }
}

/// Console logging, plus a daily rolling `controller.log` when `log_dir` is set
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "controller.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry=info,ferry_orchestrator=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

async fn serve(config_path: &Path, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let mut config = ControllerConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating log directory {}", config.log_dir.display()))?;
    let _guard = init_tracing(Some(&config.log_dir));

    info!("🚀 Ferry controller starting");
    info!("📦 VIP: {}:{}", config.vip, config.service_port);
    info!("🖥️  Hosts: {}", config.hosts.len());

    let store = Arc::new(ForwardingStore::provision(&config)?);
    let snapshot = store.snapshot();
    info!(
        endpoints = snapshot.endpoints.len(),
        groups = snapshot.groups.len(),
        nat_rules = snapshot.nat.len(),
        "Forwarding tables provisioned"
    );

    let migration = &config.migration;
    let executor = Arc::new(
        SshExecutor::new(config.inventory())
            .with_timeout(migration.command_timeout().max(migration.transfer_timeout())),
    );
    let agent = PodmanAgent::new(Arc::clone(&executor)).with_signals(
        migration.quiesce_signal.clone(),
        migration.resume_signal.clone(),
    );
    let orchestrator = Arc::new(
        MigrationOrchestrator::new(
            Arc::clone(&store),
            Arc::new(agent),
            Arc::new(ScpChannel::new(Arc::clone(&executor))),
            Arc::new(IpReattacher::new(executor)),
            &config,
        )
        .with_telemetry(TelemetrySink::new(&config.telemetry)),
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!("🌐 Control API listening on http://{}", config.listen_addr);

    axum::serve(listener, router(Arc::clone(&orchestrator)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let running = orchestrator.settle(SHUTDOWN_GRACE).await;
    if running > 0 {
        warn!(running, "Exiting with migrations in flight");
    }

    match store.shutdown() {
        Ok(removed) => info!(removed, "👋 Controller stopped, forwarding entries removed"),
        Err(e) => error!(error = %e, "Forwarding entries left behind at shutdown"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("🛑 Shutdown signal received");
}

/// Thin HTTP client for a running controller
struct ControllerClient {
    base: String,
    http: reqwest::Client,
}

impl ControllerClient {
    fn new(base: String) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> anyhow::Result<R> {
        let response = self.http.get(format!("{}{}", self.base, path)).send().await?;
        Self::decode(response).await
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> anyhow::Result<R> {
        let mut request = self.http.post(format!("{}{}", self.base, path));
        if let Some(body) = body {
            request = request.json(body);
        }
        Self::decode(request.send().await?).await
    }

    async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<R> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => bail!("{} ({:?}): {}", status, body.kind, body.error),
                Err(_) => bail!("{}: {}", status, text),
            }
        }
        Ok(response.json().await?)
    }
}

async fn run_client(client: &ControllerClient, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Migrate {
            source,
            target,
            new_ip,
            new_mac,
            wait,
        } => {
            let new_identity = match (new_ip, new_mac) {
                (Some(addr), Some(mac)) => Some(NetworkIdentity { addr, mac }),
                _ => None,
            };
            let request = MigrateRequest {
                source_identity: source,
                target_host: HostId::new(target),
                new_identity,
            };
            let created: MigrateResponse = client.post("/migrate", Some(&request)).await?;
            info!("📋 Migration submitted: {}", created.job_id);

            if wait {
                let report = wait_for(client, created.job_id).await?;
                print_report(&report)?;
                if report.status != JobStatus::Succeeded {
                    bail!("migration {} ended {:?}", report.job_id, report.status);
                }
            }
        }

        Commands::Status { job: Some(id) } => {
            let report: JobReport = client.get(&format!("/jobs/{}", id)).await?;
            print_report(&report)?;
        }

        Commands::Status { job: None } => {
            let jobs: Vec<JobReport> = client.get("/jobs").await?;
            if jobs.is_empty() {
                info!("No migrations yet");
            }
            for job in jobs {
                let icon = match job.status {
                    JobStatus::Running => "🟡",
                    JobStatus::Succeeded => "🟢",
                    JobStatus::Failed => "🔴",
                    JobStatus::Cancelled => "⚫",
                };
                info!(
                    "{} {}  {:<16} {} -> {}  {}",
                    icon,
                    job.job_id,
                    job.source_identity.addr,
                    job.source_host,
                    job.target_host,
                    job.phase
                );
            }
        }

        Commands::Cancel { job } => {
            let report: JobReport = client
                .post::<(), _>(&format!("/jobs/{}/cancel", job), None)
                .await?;
            info!("🛑 Cancellation requested for {} (phase {})", job, report.phase);
        }

        Commands::Reattach {
            identity,
            egress,
            mac,
            host,
        } => {
            let request = ReattachRequest {
                identity,
                new_egress: EgressPort(egress),
                hw_identity: mac,
                host: host.map(HostId::new),
            };
            let response: ReattachResponse = client.post("/reattach", Some(&request)).await?;
            if response.changed {
                info!("✅ {} now forwarded to port {}", identity, egress);
            } else {
                info!("✅ {} already forwarded to port {}", identity, egress);
            }
        }

        Commands::Cleanup => {
            let response: CleanupResponse = client.post::<(), _>("/cleanup", None).await?;
            info!("🧹 Removed {} forwarding entries", response.removed);
        }

        Commands::Health => {
            let health: HealthResponse = client.get("/health").await?;
            info!(
                "✅ Controller {}: {} endpoints, {} running migrations",
                health.status, health.endpoints, health.running_jobs
            );
        }

        Commands::Serve { .. } => bail!("serve is not a client command"),
    }
    Ok(())
}

async fn wait_for(client: &ControllerClient, id: Uuid) -> anyhow::Result<JobReport> {
    loop {
        let report: JobReport = client.get(&format!("/jobs/{}", id)).await?;
        if report.status != JobStatus::Running {
            return Ok(report);
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

fn print_report(report: &JobReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
