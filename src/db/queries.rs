use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::detection::Detection;
use crate::models::job::{
    Completion, Job, JobStatus, NewJob, ProcessingMetadata, ProcessingSettings, VideoMetadata,
    WriteOutcome,
};

const JOB_COLUMNS: &str = r#"
    id, owner_id, original_name, file_path, status, progress, processing_settings,
    video_metadata, processing_metadata, detected_plates, error_message, created_at, updated_at
"#;

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str).map_err(|e| sqlx::Error::ColumnDecode {
        index: "status".to_string(),
        source: Box::new(e),
    })?;
    let progress: i16 = row.try_get("progress")?;
    let settings: Json<ProcessingSettings> = row.try_get("processing_settings")?;
    let video_metadata: Option<Json<VideoMetadata>> = row.try_get("video_metadata")?;
    let processing_metadata: Json<ProcessingMetadata> = row.try_get("processing_metadata")?;
    let detected_plates: Json<Vec<Detection>> = row.try_get("detected_plates")?;

    Ok(Job {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        original_name: row.try_get("original_name")?,
        file_path: row.try_get("file_path")?,
        status,
        progress: progress.clamp(0, 100) as u8,
        processing_settings: settings.0,
        video_metadata: video_metadata.map(|m| m.0),
        processing_metadata: processing_metadata.0,
        detected_plates: detected_plates.0,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Resolve why a conditional update touched no rows.
async fn outcome_for(pool: &PgPool, job_id: Uuid, rows_affected: u64) -> Result<WriteOutcome, sqlx::Error> {
    if rows_affected > 0 {
        return Ok(WriteOutcome::Applied);
    }

    let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    Ok(match exists {
        Some(_) => WriteOutcome::AlreadyTerminal,
        None => WriteOutcome::Missing,
    })
}

/// Insert a new job in `queued` state
pub async fn create_job(pool: &PgPool, new_job: &NewJob) -> Result<Job, sqlx::Error> {
    let sql = format!(
        r#"
        INSERT INTO jobs (id, owner_id, original_name, file_path, status, processing_settings)
        VALUES ($1, $2, $3, $4, 'queued', $5)
        RETURNING {JOB_COLUMNS}
        "#
    );

    let row = sqlx::query(&sql)
        .bind(Uuid::new_v4())
        .bind(new_job.owner_id)
        .bind(&new_job.original_name)
        .bind(&new_job.file_path)
        .bind(Json(&new_job.processing_settings))
        .fetch_one(pool)
        .await?;

    job_from_row(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");

    let row = sqlx::query(&sql)
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Transition a queued (or re-dispatched) job to `processing`
pub async fn mark_processing(
    pool: &PgPool,
    job_id: Uuid,
    started_at: DateTime<Utc>,
) -> Result<WriteOutcome, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'processing',
            progress = 0,
            error_message = NULL,
            processing_metadata = processing_metadata || $2,
            updated_at = NOW()
        WHERE id = $1 AND status IN ('queued', 'processing')
        "#,
    )
    .bind(job_id)
    .bind(Json(json!({ "startTime": started_at })))
    .execute(pool)
    .await?;

    outcome_for(pool, job_id, result.rows_affected()).await
}

/// Persist probed video metadata and the derived frame count
pub async fn save_video_metadata(
    pool: &PgPool,
    job_id: Uuid,
    metadata: &VideoMetadata,
) -> Result<WriteOutcome, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET video_metadata = $2,
            processing_metadata = processing_metadata || $3,
            updated_at = NOW()
        WHERE id = $1 AND status = 'processing'
        "#,
    )
    .bind(job_id)
    .bind(Json(metadata))
    .bind(Json(json!({ "totalFrames": metadata.total_frames })))
    .execute(pool)
    .await?;

    outcome_for(pool, job_id, result.rows_affected()).await
}

/// Raise progress; never lowers it and ignores non-processing jobs
pub async fn update_progress(pool: &PgPool, job_id: Uuid, progress: u8) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET progress = GREATEST(progress, $2), updated_at = NOW()
        WHERE id = $1 AND status = 'processing'
        "#,
    )
    .bind(job_id)
    .bind(i16::from(progress.min(100)))
    .execute(pool)
    .await?;

    Ok(())
}

/// Write final detections and mark the job completed, unless already terminal
pub async fn complete_job(
    pool: &PgPool,
    job_id: Uuid,
    completion: &Completion,
) -> Result<WriteOutcome, sqlx::Error> {
    let mut summary = Map::new();
    summary.insert("endTime".into(), json!(completion.end_time));
    summary.insert("processedFrames".into(), json!(completion.processed_frames));
    summary.insert("uniquePlatesCount".into(), json!(completion.unique_plates_count));
    if let Some(seconds) = completion.processing_time {
        summary.insert("processingTime".into(), json!(seconds));
    }
    if let Some(average) = completion.average_confidence {
        summary.insert("averageConfidence".into(), json!(average));
    }

    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'completed',
            progress = 100,
            detected_plates = $2,
            processing_metadata = processing_metadata || $3,
            error_message = NULL,
            updated_at = NOW()
        WHERE id = $1 AND status IN ('queued', 'processing')
        "#,
    )
    .bind(job_id)
    .bind(Json(&completion.detections))
    .bind(Json(Value::Object(summary)))
    .execute(pool)
    .await?;

    outcome_for(pool, job_id, result.rows_affected()).await
}

/// Mark the job failed with a cause, unless already terminal
pub async fn fail_job(
    pool: &PgPool,
    job_id: Uuid,
    error: &str,
    ended_at: DateTime<Utc>,
) -> Result<WriteOutcome, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed',
            error_message = $2,
            processing_metadata = processing_metadata || $3,
            updated_at = NOW()
        WHERE id = $1 AND status IN ('queued', 'processing')
        "#,
    )
    .bind(job_id)
    .bind(error)
    .bind(Json(json!({ "endTime": ended_at })))
    .execute(pool)
    .await?;

    outcome_for(pool, job_id, result.rows_affected()).await
}

/// Reset a failed job so it can be dispatched again
pub async fn reset_for_retry(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'queued',
            progress = 0,
            error_message = NULL,
            detected_plates = '[]'::jsonb,
            video_metadata = NULL,
            processing_metadata = '{}'::jsonb,
            updated_at = NOW()
        WHERE id = $1 AND status = 'failed'
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete a job record
pub async fn delete_job(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}
