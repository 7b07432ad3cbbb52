use md_convert_async::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{
        auth::{RequestAuthenticator, SeenSignatures},
        queue::{JobQueue, RedisJobBackend},
        storage::{S3Storage, StorageGateway},
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
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

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing md-convert-async server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    // Initialize object storage and make sure the bucket exists
    tracing::info!(endpoint = %config.s3_endpoint, bucket = %config.s3_bucket, "Initializing object storage");
    let s3 = S3Storage::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
        config.s3_path_style,
    )
    .expect("Failed to initialize S3 client");
    let storage = StorageGateway::new(Arc::new(s3), config.presigned_ttl());
    storage
        .provision()
        .await
        .expect("Failed to provision storage bucket");

    // Initialize Redis job queue
    tracing::info!("Connecting to Redis job queue");
    let backend = RedisJobBackend::new(&config.redis_url, &config.queue_prefix, config.result_ttl())
        .expect("Failed to initialize job queue");
    let queue = JobQueue::new(Arc::new(backend));

    let auth = if config.api_auth_enabled {
        let mut authenticator = RequestAuthenticator::new(&config.api_secret)
            .with_window(config.auth_window_secs)
            .with_exempt_paths(routes::PUBLIC_PATHS.iter().copied());
        if config.replay_guard {
            authenticator = authenticator
                .with_replay_guard(Arc::new(SeenSignatures::new(config.auth_window_secs)));
        }
        Some(authenticator)
    } else {
        tracing::warn!("Request signing is disabled");
        None
    };

    let state = AppState::new(storage, queue, auth);
    let app = routes::app(state, Some(prometheus_handle));

    tracing::info!("Starting md-convert-async on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
