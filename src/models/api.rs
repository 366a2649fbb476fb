use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus, ProcessingMetadata, VideoMetadata};

/// Request to admit an existing job record into the task queue.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    /// Lower values are dispatched first.
    #[garde(range(min = 1, max = 100))]
    pub priority: Option<i32>,

    /// Admission delay in milliseconds.
    #[garde(range(max = 3_600_000))]
    pub delay_ms: Option<u64>,
}

/// Response after enqueueing or retrying a job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub video_metadata: Option<VideoMetadata>,
    pub processing_metadata: ProcessingMetadata,
    pub detected_plates: usize,
    pub error_message: Option<String>,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            video_metadata: job.video_metadata.clone(),
            processing_metadata: job.processing_metadata.clone(),
            detected_plates: job.detected_plates.len(),
            error_message: job.error_message.clone(),
        }
    }
}
