use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{EnqueueRequest, EnqueueResponse, JobStatusResponse};
use crate::models::job::JobStatus;
use crate::services::queue::{EnqueueOptions, HistoryKind, QueueStats, TaskRecord};

/// GET /api/v1/jobs/{job_id}: Current status and progress of a job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    let job = state
        .store
        .find_by_id(job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(JobStatusResponse::from(&job)))
}

/// POST /api/v1/jobs/{job_id}/enqueue: Admit a queued job record for processing.
pub async fn enqueue_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    body: Option<Json<EnqueueRequest>>,
) -> Result<Json<EnqueueResponse>, StatusCode> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    request
        .validate()
        .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    let job = state
        .store
        .find_by_id(job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    if job.status.is_terminal() {
        return Err(StatusCode::CONFLICT);
    }

    let defaults = state.queue.default_options();
    let options = EnqueueOptions {
        priority: request.priority.unwrap_or(defaults.priority),
        delay: request
            .delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.delay),
    };

    let handle = state.queue.enqueue_with(job_id, options).await.map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Failed to enqueue job");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    if handle.created {
        metrics::counter!("plate_scan_jobs_enqueued_total").increment(1);
    }

    Ok(Json(EnqueueResponse {
        job_id,
        task_id: handle.task_id,
        status: job.status,
        message: if handle.created {
            "Job added to processing queue".to_string()
        } else {
            "Job is already queued".to_string()
        },
    }))
}

/// POST /api/v1/jobs/{job_id}/retry: Reset a failed job and queue it again.
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<EnqueueResponse>, StatusCode> {
    let reset = state.store.reset_for_retry(job_id).await.map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Failed to reset job");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    if !reset {
        let exists = state
            .store
            .find_by_id(job_id)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .is_some();
        // Only failed jobs can be retried.
        return Err(if exists {
            StatusCode::CONFLICT
        } else {
            StatusCode::NOT_FOUND
        });
    }

    let handle = state.queue.enqueue(job_id).await.map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Failed to re-enqueue job");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    tracing::info!(job_id = %job_id, task_id = %handle.task_id, "Job queued for retry");

    Ok(Json(EnqueueResponse {
        job_id,
        task_id: handle.task_id,
        status: JobStatus::Queued,
        message: "Job queued for retry".to_string(),
    }))
}

/// GET /api/v1/queue/stats: Waiting, active, completed and failed task counts.
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>, StatusCode> {
    let stats = state.queue.stats().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to read queue stats");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    metrics::gauge!("plate_scan_queue_waiting").set(stats.waiting as f64);
    metrics::gauge!("plate_scan_queue_active").set(stats.active as f64);

    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryFilter {
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub kind: HistoryFilter,
}

/// GET /api/v1/queue/history?kind=completed|failed: Retained task records, newest first.
pub async fn queue_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<TaskRecord>>, StatusCode> {
    let kind = match query.kind {
        HistoryFilter::Completed => HistoryKind::Completed,
        HistoryFilter::Failed => HistoryKind::Failed,
    };

    let records = state.queue.history(kind).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to read queue history");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(records))
}
