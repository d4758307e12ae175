use rotagate::config::Config;
use rotagate::manager::FleetManager;
use rotagate::provider::HttpProvider;
use rotagate::registry::FleetRegistry;
use rotagate::scheduler::Scheduler;
use rotagate::store::JsonFileStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rotagate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("rotagate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Open the fleet state store; a failure here is fatal
    let store = Arc::new(
        JsonFileStore::open(&config.fleet.data_file)
            .map_err(|e| anyhow::anyhow!("Failed to open fleet state store: {}", e))?,
    );

    let registry = Arc::new(FleetRegistry::new());
    let provider = Arc::new(
        HttpProvider::new(&config.provider)
            .map_err(|e| anyhow::anyhow!("Failed to build provider client: {}", e))?,
    );

    let manager = Arc::new(FleetManager::new(store, registry, provider, &config));

    // Rebuild the fleet from persisted records
    match manager.recover().await {
        Ok(report) => {
            info!(
                total = report.total,
                started = report.started,
                pending = report.pending,
                failed = report.failed,
                "Startup recovery finished"
            );
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Startup recovery failed: {}", e));
        }
    }

    // Create shutdown channel and start the scheduler loops
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(
        Arc::clone(&manager),
        Duration::from_secs(config.scheduler.health_check_interval_secs),
        Duration::from_secs(config.scheduler.rotation_check_interval_secs),
        shutdown_rx,
    );
    let (health_handle, rotation_handle) = scheduler.spawn();

    info!("Fleet manager started");

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and wait for the scheduler loops (with timeout)
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = health_handle.await;
        let _ = rotation_handle.await;
    })
    .await;

    // Stop every forwarder still serving traffic
    manager.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting fleet manager"
    );
    info!(
        bind = %config.server.bind,
        domain = %config.server.domain,
        backend_host = %config.server.backend_host,
        "Server configuration"
    );
    info!(
        data_file = %config.fleet.data_file,
        gateway_file = %config.fleet.gateway_file,
        port_window_start = config.fleet.port_window_start,
        relay_mode = ?config.fleet.relay_mode,
        "Fleet configuration"
    );
    info!(
        health_check_interval_secs = config.scheduler.health_check_interval_secs,
        rotation_check_interval_secs = config.scheduler.rotation_check_interval_secs,
        probe_through_forwarder = config.scheduler.probe_through_forwarder,
        "Scheduler configuration"
    );
    info!(
        base_url = %config.provider.base_url,
        timeout_secs = config.provider.timeout_secs,
        "Provider configuration"
    );
}
