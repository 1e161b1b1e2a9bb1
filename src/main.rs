//! # warden
//!
//! Agent task server binary: loads settings, wires the engine to the socket
//! front end, and serves until Ctrl-C.

#![deny(unsafe_code)]

mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use warden_core::Broker;
use warden_engine::{
    AgentScheduler, DirectRuntime, HttpSandbox, PermissionGate, ToolCallLedger, ToolInvoker,
};
use warden_server::{DeliveryBuffer, JwtVerifier, Services, StaticTokenVerifier, TokenVerifier};
use warden_store::Database;

use crate::settings::{AuthMode, WardenSettings};

/// Warden agent task server.
#[derive(Parser, Debug)]
#[command(name = "warden", about = "Agent task server")]
struct Cli {
    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to ~/.warden/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum concurrently running tasks.
    #[arg(long)]
    workers: Option<usize>,

    /// Capacity of the pending task queue.
    #[arg(long)]
    queue: Option<usize>,

    /// Approve every tool call without asking.
    #[arg(long)]
    skip_permissions: bool,

    /// Directory for databases and logs.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, settings: &mut WardenSettings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(workers) = self.workers {
            settings.scheduler.max_workers = workers;
        }
        if let Some(queue) = self.queue {
            settings.scheduler.queue_capacity = queue;
        }
        if self.skip_permissions {
            settings.permissions.skip_all = true;
        }
        if let Some(dir) = &self.data_dir {
            settings.data_dir = dir.to_string_lossy().into_owned();
        }
    }
}

fn build_verifier(settings: &mut WardenSettings) -> Result<Option<Arc<dyn TokenVerifier>>> {
    if settings.auth.disabled {
        return Ok(None);
    }
    let secret = settings
        .auth
        .secret
        .take()
        .context("auth.secret (or WARDEN_AUTH_SECRET) is required unless auth.disabled is set")?;
    let verifier: Arc<dyn TokenVerifier> = match settings.auth.mode {
        AuthMode::Static => Arc::new(StaticTokenVerifier::new(secret)),
        AuthMode::Jwt => Arc::new(JwtVerifier::new(&secret)),
    };
    Ok(Some(verifier))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings_path = cli.config.clone().unwrap_or_else(settings::settings_path);
    let mut settings = settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("failed to load settings from {}", settings_path.display()))?;
    cli.apply(&mut settings);

    let telemetry = warden_telemetry::init_telemetry(settings.telemetry_config());
    let metrics = telemetry.metrics();
    info!(
        port = settings.server.port,
        data_dir = %settings.data_dir().display(),
        "starting warden"
    );

    let store_path = settings.store_path();
    let db = Database::open(&store_path)
        .with_context(|| format!("failed to open store at {}", store_path.display()))?;
    let ledger = Arc::new(ToolCallLedger::new(db));
    let gate = Arc::new(PermissionGate::new(settings.gate_config()).with_metrics(Arc::clone(&metrics)));
    let sandbox = Arc::new(
        HttpSandbox::new(settings.sandbox.base_url.clone(), settings.sandbox_timeout())
            .context("failed to build sandbox client")?,
    );

    let deltas = Broker::default();
    let invoker = Arc::new(ToolInvoker::new(
        Arc::clone(&gate),
        Arc::clone(&ledger),
        sandbox,
    ));
    let runtime = Arc::new(DirectRuntime::new(invoker, deltas.clone()));
    let scheduler = Arc::new(AgentScheduler::start(
        settings.scheduler_config(),
        runtime,
        Some(Arc::clone(&metrics)),
    ));

    let buffer = Arc::new(DeliveryBuffer::open(&settings.buffer_config()).with_metrics(Arc::clone(&metrics)));
    let verifier = build_verifier(&mut settings)?;

    let services = Services {
        scheduler: Arc::clone(&scheduler),
        gate,
        ledger,
        deltas,
        buffer,
        metrics,
    };
    let handle = warden_server::start(settings.server_config(), services, verifier)
        .await
        .context("failed to start server")?;
    info!(port = handle.port, "warden ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    handle.shutdown().await;
    let report = scheduler.shutdown(settings.shutdown_timeout()).await;
    if report.forced > 0 {
        warn!(forced = report.forced, "tasks still running at shutdown were cancelled");
    }
    info!(
        completed = report.completed,
        failed = report.failed,
        canceled = report.canceled,
        forced = report.forced,
        "warden stopped"
    );
    drop(telemetry);
    Ok(())
}
