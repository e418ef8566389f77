use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus scrape endpoint, text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the service emits.
pub fn describe() {
    metrics::describe_counter!("sticker_jobs_submitted_total", "Segmentation jobs accepted");
    metrics::describe_counter!("sticker_jobs_completed_total", "Segmentation jobs completed");
    metrics::describe_counter!("sticker_jobs_failed_total", "Segmentation jobs that failed");
    metrics::describe_gauge!("sticker_queue_depth", "Entries waiting in the priority queue");
    metrics::describe_counter!("sticker_aggregation_runs_total", "Aggregation runs by final status");
    metrics::describe_histogram!("sticker_aggregation_seconds", "Wall time of one aggregation run");
}
