use image_classify_pipeline::{
    config::AppConfig,
    db::{self, queue::PgQueueStore},
    pipeline::{events, Pipeline, PipelineConfig},
    services::{classifier::HttpClassifier, storage::BlobClient},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting image classification pipeline");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Expose Prometheus metrics
    let metrics_addr: SocketAddr = config
        .metrics_addr
        .parse()
        .expect("Invalid metrics bind address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus metrics exporter");
    events::describe_metrics();

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize stores and classifier backends
    let queue = PgQueueStore::new(
        db_pool,
        config.max_attempts,
        Duration::from_secs(config.visibility_timeout_secs),
    )
    .expect("Failed to initialize queue store");

    let blobs = BlobClient::new(
        &config.blob_bucket,
        &config.blob_endpoint,
        &config.blob_access_key,
        &config.blob_secret_key,
    )
    .expect("Failed to initialize blob store client");

    let endpoints = config.classifier_endpoints();
    assert!(
        !endpoints.is_empty(),
        "CLASSIFIER_URLS must name at least one endpoint"
    );

    let classify_timeout = Duration::from_secs(config.classify_timeout_secs);
    let backends: Vec<HttpClassifier> = endpoints
        .iter()
        .map(|endpoint| {
            let client = HttpClassifier::new(endpoint.clone(), classify_timeout)
                .expect("Failed to build classifier client");
            tracing::info!(endpoint = %client.endpoint(), "configured classifier backend");
            client
        })
        .collect();

    let pipeline = Pipeline::new(
        queue,
        blobs,
        backends,
        PipelineConfig {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        },
    );

    let cancel = CancellationToken::new();
    let handle = pipeline
        .start(cancel.clone())
        .expect("pipeline started twice");

    tracing::info!(workers = handle.worker_count(), "pipeline running");

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining workers");
    cancel.cancel();
    handle.join().await;
    tracing::info!("Pipeline stopped");
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
