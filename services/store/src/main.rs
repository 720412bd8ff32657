use anyhow::{Context, Result};
use std::sync::Arc;
use strata_store::api::{start_api_server, AppState};
use strata_store::{
    AccessPredictor, ArbitrageMonitor, Config, EnvSecretProvider, InMemoryMetadataStore, MasterSecretProvider,
    MetadataStore, PgMetadataStore, ProviderRegistry, Schedule, Scheduler, TieredStore,
};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Strata store"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let metadata = init_metadata(&config).await?;

    let registry = Arc::new(
        ProviderRegistry::from_config(&config.backends)
            .await
            .context("Failed to initialize provider backends")?,
    );
    info!(backends = ?registry.names(), "Provider backends ready");

    let secrets = EnvSecretProvider::new(&config.store.master_secret_env);
    // Fail fast rather than on the first store
    secrets
        .master_secret()
        .context("Master secret is not available")?;

    let store = Arc::new(TieredStore::new(
        config.store.clone(),
        config.layers.clone(),
        metadata,
        registry,
        Arc::new(secrets),
    ));

    let scheduler = Scheduler::start(
        store.clone(),
        AccessPredictor::new(store.clone(), config.predictor.clone()),
        ArbitrageMonitor::new(store.clone(), config.arbitrage.clone(), &config.rotations),
        Schedule::from_config(&config),
    );

    // Spawn API server task
    let api_state = AppState { store: store.clone() };
    let api_config = config.api.clone();
    let api_shutdown = scheduler.cancel_token();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Strata store started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down Strata store");

    scheduler.shutdown().await;
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API server task ended abnormally");
    }

    info!("Strata store stopped");

    Ok(())
}

/// Postgres when a database URL is configured, process memory otherwise
async fn init_metadata(config: &Config) -> Result<Arc<dyn MetadataStore>> {
    if config.database.url.is_none() {
        warn!("No database URL configured, metadata will not survive restarts");
        return Ok(Arc::new(InMemoryMetadataStore::new()));
    }

    let store = PgMetadataStore::new(&config.database)
        .await
        .context("Failed to initialize metadata store")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    Ok(Arc::new(store))
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
