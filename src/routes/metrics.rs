use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus scrape endpoint, text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the service emits.
pub fn describe_metrics() {
    metrics::describe_counter!("conversion_jobs_total", "Total conversion jobs submitted");
    metrics::describe_counter!(
        "conversion_jobs_completed",
        "Total conversion jobs completed"
    );
    metrics::describe_counter!(
        "conversion_jobs_failed",
        "Total conversion jobs that failed permanently"
    );
    metrics::describe_counter!(
        "conversion_jobs_retried",
        "Total conversion attempts scheduled for retry"
    );
    metrics::describe_histogram!(
        "conversion_processing_seconds",
        "Time to process one conversion attempt"
    );
    metrics::describe_gauge!(
        "conversion_queue_depth",
        "Current number of jobs waiting in the queue"
    );
    metrics::describe_counter!(
        "auth_rejections_total",
        "Requests rejected by signature verification"
    );
}
