use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use filestore::codec::ShellCodec;
use filestore::config::Config;
use filestore::derivative::DerivativeGenerator;
use filestore::lifecycle::Lifecycle;
use filestore::metadata_store::{MetadataStore, PgMetadataStore};
use filestore::object_store::{BlobBackend, ObjectStoreClient, S3Backend};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting filestore lifecycle service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize metadata store
    let metadata = Arc::new(
        PgMetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        metadata
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    // Initialize region backends in priority order
    let mut regions: Vec<(String, Arc<dyn BlobBackend>)> = Vec::new();
    for region_config in &config.object_store.regions {
        let backend = S3Backend::new(region_config)
            .await
            .with_context(|| format!("Failed to initialize region {}", region_config.name))?;
        regions.push((region_config.name.clone(), Arc::new(backend)));
    }
    let objects = Arc::new(ObjectStoreClient::new(regions)?);

    let codec = Arc::new(ShellCodec::new());

    let derivatives = DerivativeGenerator::new(
        metadata.clone() as Arc<dyn MetadataStore>,
        objects.clone(),
        codec,
        config.scratch.root.clone().into(),
    );

    let lifecycle = Arc::new(Lifecycle::new(
        metadata.clone() as Arc<dyn MetadataStore>,
        objects,
        derivatives,
        config.unclaimed_ttl(),
    ));

    // Spawn the periodic GC sweep
    let sweep_interval = config.sweep_interval();
    let sweeper = lifecycle.clone();
    let sweep_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep_expired().await {
                error!(error = %e, retryable = e.is_retryable(), "GC sweep failed");
            }
        }
    });

    info!("Lifecycle service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down lifecycle service");

    sweep_handle.abort();

    info!("Lifecycle service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

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
