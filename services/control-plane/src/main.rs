//! vitrine control plane
//!
//! Provisions tenants, runs their containers, keeps the reverse proxy in step
//! and cleans up after deleted tenants. `serve` runs the background workers;
//! every other subcommand is a one-shot admin action that prints its outcome
//! as JSON and exits non-zero on failure.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vitrine_control_plane::{
    admin::{self, AdminCommand, KindSelector},
    config::Config,
    db::{Database, PgTenantSource},
    orchestrator::DockerOrchestrator,
    provision::HostProvisioner,
    reconciler::Reconciler,
    worker::{GcWorker, SyncWorker},
};
use vitrine_namespace::{TenantId, TenantKind};

#[derive(Parser)]
#[command(name = "control-plane", version, about = "vitrine control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync and garbage collection workers until interrupted.
    Serve,
    /// Converge every tenant once.
    Sync,
    /// Remove orphaned volumes, proxy configs and services once.
    Gc,
    /// Provision and run one tenant.
    Start(TenantArgs),
    /// Stop one tenant.
    Stop(TenantArgs),
    /// Stop, then start one tenant.
    Restart(TenantArgs),
    /// Remove one tenant's service, resources and routes.
    Delete {
        #[arg(long)]
        id: TenantId,
    },
    /// Set one tenant's replica count.
    Scale {
        #[command(flatten)]
        tenant: TenantArgs,
        #[arg(long)]
        replicas: u32,
    },
    /// Start every tenant of a kind (`store`, `theme`, `app` or `all`).
    GroupStart {
        #[arg(long, default_value = "all")]
        kind: KindSelector,
    },
    /// Stop every tenant of a kind (`store`, `theme`, `app` or `all`).
    GroupStop {
        #[arg(long, default_value = "all")]
        kind: KindSelector,
    },
}

#[derive(clap::Args)]
struct TenantArgs {
    #[arg(long)]
    kind: TenantKind,
    #[arg(long)]
    id: TenantId,
}

impl Command {
    fn into_admin(self) -> Option<AdminCommand> {
        Some(match self {
            Command::Serve => return None,
            Command::Sync => AdminCommand::Sync,
            Command::Gc => AdminCommand::Gc,
            Command::Start(t) => AdminCommand::Start { kind: t.kind, id: t.id },
            Command::Stop(t) => AdminCommand::Stop { kind: t.kind, id: t.id },
            Command::Restart(t) => AdminCommand::Restart { kind: t.kind, id: t.id },
            Command::Delete { id } => AdminCommand::Delete { id },
            Command::Scale { tenant, replicas } => AdminCommand::Scale {
                kind: tenant.kind,
                id: tenant.id,
                replicas,
            },
            Command::GroupStart { kind } => AdminCommand::GroupStart(kind),
            Command::GroupStop { kind } => AdminCommand::GroupStop(kind),
        })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to VITRINE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let reconciler = Arc::new(build(&config).await?);

    match cli.command.into_admin() {
        None => {
            serve(&config, reconciler).await;
            Ok(ExitCode::SUCCESS)
        }
        Some(command) => {
            let name = command.name();
            info!(command = name, "Running admin command");
            let outcome = admin::execute(&reconciler, command).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if outcome.is_ok() {
                Ok(ExitCode::SUCCESS)
            } else {
                error!(command = name, errors = outcome.error_count(), "Admin command failed");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

async fn build(config: &Config) -> Result<Reconciler> {
    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    // Role and database creation needs a privileged connection.
    let admin_pool = match &config.db_admin_url {
        Some(url) => {
            let admin = Database::connect(&config.database.with_url(url))
                .await
                .context("failed to connect with VITRINE_DB_ADMIN_URL")?;
            admin.health_check().await?;
            admin.pool().clone()
        }
        None => db.pool().clone(),
    };

    let source = Arc::new(PgTenantSource::new(db.pool().clone(), config.global_apps.clone()));
    let orchestrator = Arc::new(DockerOrchestrator::new(&config.docker_socket));
    let provisioner = Arc::new(HostProvisioner::new(admin_pool, config.call_timeout));

    Ok(Reconciler::assemble(config, source, orchestrator, provisioner))
}

async fn serve(config: &Config, reconciler: Arc<Reconciler>) {
    info!(
        platform_domain = %config.proxy.platform_domain,
        max_concurrency = config.workers.max_concurrency,
        "Starting vitrine control plane"
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sync_worker = SyncWorker::new(Arc::clone(&reconciler), &config.workers);
    let sync_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            sync_worker.run(shutdown_rx).await;
        }
    });

    let gc_worker = GcWorker::new(Arc::clone(&reconciler), &config.workers);
    let gc_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            gc_worker.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(30);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, sync_handle).await {
        warn!(error = %e, "Sync worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, gc_handle).await {
        warn!(error = %e, "Gc worker did not shut down in time");
    }

    let outcome = reconciler.flush().await;
    if !outcome.is_ok() {
        warn!(summary = %outcome, "Pending proxy reload failed during shutdown");
    }
    info!("Control plane shutdown complete");
}
