use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Names and help text for every metric the API and worker emit.
pub fn describe_metrics() {
    metrics::describe_histogram!(
        "plate_scan_job_seconds",
        "Wall-clock time of one pipeline run"
    );
    metrics::describe_counter!(
        "plate_scan_jobs_enqueued_total",
        "Jobs admitted to the task queue"
    );
    metrics::describe_counter!(
        "plate_scan_jobs_completed_total",
        "Jobs that reached the completed state"
    );
    metrics::describe_counter!(
        "plate_scan_jobs_failed_total",
        "Jobs that failed after exhausting their attempts"
    );
    metrics::describe_counter!(
        "plate_scan_jobs_retried_total",
        "Failed attempts scheduled for another try"
    );
    metrics::describe_counter!(
        "plate_scan_tasks_stalled_total",
        "Tasks reclaimed from workers that stopped heartbeating"
    );
    metrics::describe_counter!(
        "plate_scan_frame_failures_total",
        "Frames skipped because the detection worker failed"
    );
    metrics::describe_gauge!(
        "plate_scan_queue_waiting",
        "Tasks waiting for a worker, including delayed ones"
    );
    metrics::describe_gauge!("plate_scan_queue_active", "Tasks currently leased by a worker");
}

/// GET /metrics: Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
