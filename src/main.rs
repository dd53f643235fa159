use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::admin::{AdminServer, AdminState};
use floodgate::clock::{Clock, SystemClock};
use floodgate::config::{FloodgateConfig, LogFormat};
use floodgate::grpc::GrpcServer;
use floodgate::mesh::Cluster;
use floodgate::ratelimit::{spawn_sampler, AdmissionController, DegradationController, SystemLoadProbe};

#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about = "Rate limiting and admission control service")]
struct Args {
    /// YAML configuration file; FLOODGATE_* environment variables override it
    /// (nested keys use `__`, e.g. FLOODGATE_STORE__URL)
    #[arg(short, long, env = "FLOODGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = FloodgateConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    init_tracing(&config, args.log_format);
    match &args.config {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Configuration loaded from defaults and environment"),
    }

    if args.check_config {
        info!("Configuration is valid");
        return Ok(());
    }

    info!("Starting Floodgate admission control service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let metrics = floodgate::metrics::install_recorder()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let cluster = if config.mesh.enabled {
        Some(Arc::new(Cluster::start(config.mesh.cluster_config()).await?))
    } else {
        None
    };

    let store = floodgate::store::connect(&config.store, clock.clone(), cluster.clone()).await?;
    info!(backend = store.name(), "Counter store ready");

    let degradation = Arc::new(DegradationController::from_config(&config.degradation));
    let admission = Arc::new(AdmissionController::new(
        &config,
        store,
        degradation.clone(),
        clock.clone(),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if config.degradation.enabled {
        tasks.push(spawn_sampler(
            degradation,
            Arc::new(SystemLoadProbe::default()),
            Duration::from_millis(config.degradation.sample_interval_ms),
            shutdown_rx.clone(),
        ));
    }
    if config.bans.enabled {
        tasks.push(spawn_ban_gauge(
            admission.clone(),
            Duration::from_secs(config.bans.gauge_interval_secs),
            shutdown_rx.clone(),
        ));
    }
    if let Some(cluster) = &cluster {
        tasks.push(spawn_mesh_gc(
            cluster.clone(),
            clock.clone(),
            Duration::from_secs(config.mesh.gc_interval_secs.max(1)),
            shutdown_rx.clone(),
        ));
    }

    let grpc_server = GrpcServer::new(config.server.grpc_addr, admission.clone(), &config.transport)?;
    let admin_server = AdminServer::new(
        config.server.admin_addr,
        AdminState {
            admission,
            metrics: Some(metrics),
        },
        &config.transport,
    )?;

    info!(
        grpc_addr = %config.server.grpc_addr,
        admin_addr = %config.server.admin_addr,
        "Serving"
    );

    let grpc_shutdown = wait_for(shutdown_rx.clone());
    let admin_shutdown = wait_for(shutdown_rx.clone());
    let servers = async {
        tokio::try_join!(
            grpc_server.serve_with_shutdown(grpc_shutdown),
            admin_server.serve_with_shutdown(admin_shutdown),
        )
    };
    tokio::pin!(servers);

    tokio::select! {
        result = &mut servers => {
            if let Err(e) = &result {
                error!(error = %e, "Server exited unexpectedly");
            }
            let _ = shutdown_tx.send(true);
            result?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            servers.await?;
        }
    }

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    if let Some(cluster) = cluster {
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => warn!("Cluster still referenced; skipping graceful leave"),
        }
    }

    info!("Floodgate stopped");
    Ok(())
}

fn init_tracing(config: &FloodgateConfig, format: Option<LogFormat>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format.unwrap_or(config.logging.format) {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Resolves once the shutdown flag flips to true or the sender is dropped.
async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

fn spawn_ban_gauge(
    admission: Arc<AdmissionController>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let stop = wait_for(shutdown);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    admission.refresh_ban_gauge().await;
                }
                _ = &mut stop => break,
            }
        }
    })
}

fn spawn_mesh_gc(
    cluster: Arc<Cluster>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let stop = wait_for(shutdown);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cluster.gc_expired(clock.now().timestamp_millis()).await;
                }
                _ = &mut stop => break,
            }
        }
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
