use md_convert_async::{
    config::AppConfig,
    services::{
        converter::CommandConverter,
        lifecycle::JobRunner,
        queue::{JobBackend, RedisJobBackend},
        storage::{S3Storage, StorageGateway},
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
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

    tracing::info!("Starting conversion worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize services
    tracing::info!("Initializing services");
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

    let backend: Arc<dyn JobBackend> = Arc::new(
        RedisJobBackend::new(&config.redis_url, &config.queue_prefix, config.result_ttl())
            .expect("Failed to initialize job queue"),
    );

    let mut converter = CommandConverter::new(&config.converter_command);
    if let Some(flag) = &config.converter_image_flag {
        converter = converter.with_image_flag(flag.clone());
    }

    let runner = Arc::new(
        JobRunner::new(backend.clone(), storage, Arc::new(converter))
            .with_retry_policy(config.retry_policy())
            .with_time_limits(config.time_limits()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(reap_expired_leases(
        backend.clone(),
        config.reaper_interval(),
        shutdown_rx.clone(),
    )));

    let concurrency = config.worker_concurrency.max(1);
    for slot in 0..concurrency {
        tasks.push(tokio::spawn(process_jobs(
            slot,
            runner.clone(),
            config.poll_interval(),
            shutdown_rx.clone(),
        )));
    }

    tracing::info!(concurrency, "Worker ready, starting job processing loop");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, finishing in-flight jobs");
    shutdown_tx.send(true).ok();

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
    tracing::info!("Worker stopped");
}

/// One processing slot. Claims jobs until shutdown is requested; a job in
/// progress is always finished first.
async fn process_jobs(
    slot: usize,
    runner: Arc<JobRunner>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        match runner.process_next().await {
            Ok(Some(processed)) => {
                // Job handled, continue immediately
                tracing::debug!(
                    slot,
                    job_id = %processed.job_id,
                    status = ?processed.status,
                    "Job processed, checking for next job"
                );
                continue;
            }
            Ok(None) => {
                tracing::trace!(slot, "No jobs available, sleeping");
            }
            Err(e) => {
                tracing::error!(slot, error = %e, "Error processing job, will retry");
            }
        }

        tokio::select! {
            _ = sleep(poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Put jobs whose lease ran out (crashed or stuck worker) back on the queue
/// and publish the queue depth.
async fn reap_expired_leases(
    backend: Arc<dyn JobBackend>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }

        match backend.recover_expired().await {
            Ok(0) => {}
            Ok(recovered) => tracing::warn!(recovered, "Redelivering jobs with expired leases"),
            Err(e) => tracing::error!(error = %e, "Lease recovery failed"),
        }
        if let Ok(depth) = backend.depth().await {
            metrics::gauge!("conversion_queue_depth").set(depth as f64);
        }
    }
}
