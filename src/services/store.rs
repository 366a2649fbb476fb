use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{
    Completion, Job, JobStatus, NewJob, ProcessingMetadata, VideoMetadata, WriteOutcome,
};

/// Read/write contract the pipeline needs from the job record store.
///
/// Every status-changing write is guarded on the current status, so a
/// second terminal write for the same job is a no-op.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find_by_id(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError>;

    async fn mark_processing(
        &self,
        job_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError>;

    async fn save_video_metadata(
        &self,
        job_id: Uuid,
        metadata: &VideoMetadata,
    ) -> Result<WriteOutcome, StoreError>;

    async fn update_progress(&self, job_id: Uuid, progress: u8) -> Result<(), StoreError>;

    async fn complete(
        &self,
        job_id: Uuid,
        completion: &Completion,
    ) -> Result<WriteOutcome, StoreError>;

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError>;

    /// `failed → queued` with results cleared. Returns false unless the job was failed.
    async fn reset_for_retry(&self, job_id: Uuid) -> Result<bool, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn find_by_id(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        Ok(queries::create_job(&self.pool, &new_job).await?)
    }

    async fn mark_processing(
        &self,
        job_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        Ok(queries::mark_processing(&self.pool, job_id, started_at).await?)
    }

    async fn save_video_metadata(
        &self,
        job_id: Uuid,
        metadata: &VideoMetadata,
    ) -> Result<WriteOutcome, StoreError> {
        Ok(queries::save_video_metadata(&self.pool, job_id, metadata).await?)
    }

    async fn update_progress(&self, job_id: Uuid, progress: u8) -> Result<(), StoreError> {
        Ok(queries::update_progress(&self.pool, job_id, progress).await?)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        completion: &Completion,
    ) -> Result<WriteOutcome, StoreError> {
        Ok(queries::complete_job(&self.pool, job_id, completion).await?)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        Ok(queries::fail_job(&self.pool, job_id, error, ended_at).await?)
    }

    async fn reset_for_retry(&self, job_id: Uuid) -> Result<bool, StoreError> {
        Ok(queries::reset_for_retry(&self.pool, job_id).await?)
    }
}

/// In-process job store with the same guards as the SQL queries.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: Job) {
        self.jobs.write().await.insert(job.id, job);
    }

    /// Simulates external deletion of a record.
    pub async fn remove(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.write().await.remove(&job_id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Apply `update` when the job's status is one of `allowed`.
    async fn guarded<F>(&self, job_id: Uuid, allowed: &[JobStatus], update: F) -> WriteOutcome
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            None => WriteOutcome::Missing,
            Some(job) if !allowed.contains(&job.status) => WriteOutcome::AlreadyTerminal,
            Some(job) => {
                update(job);
                job.updated_at = Utc::now();
                WriteOutcome::Applied
            }
        }
    }
}

fn merge_metadata(current: &ProcessingMetadata, patch: Value) -> Result<ProcessingMetadata, StoreError> {
    let mut base = serde_json::to_value(current)?;
    if let (Value::Object(base), Value::Object(patch)) = (&mut base, patch) {
        base.extend(patch);
    }
    Ok(serde_json::from_value(base)?)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn find_by_id(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            owner_id: new_job.owner_id,
            original_name: new_job.original_name,
            file_path: new_job.file_path,
            status: JobStatus::Queued,
            progress: 0,
            processing_settings: new_job.processing_settings,
            video_metadata: None,
            processing_metadata: ProcessingMetadata::default(),
            detected_plates: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.insert(job.clone()).await;
        Ok(job)
    }

    async fn mark_processing(
        &self,
        job_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        Ok(self
            .guarded(job_id, &[JobStatus::Queued, JobStatus::Processing], |job| {
                job.status = JobStatus::Processing;
                job.progress = 0;
                job.error_message = None;
                job.processing_metadata.start_time = Some(started_at);
            })
            .await)
    }

    async fn save_video_metadata(
        &self,
        job_id: Uuid,
        metadata: &VideoMetadata,
    ) -> Result<WriteOutcome, StoreError> {
        Ok(self
            .guarded(job_id, &[JobStatus::Processing], |job| {
                job.video_metadata = Some(metadata.clone());
                job.processing_metadata.total_frames = metadata.total_frames;
            })
            .await)
    }

    async fn update_progress(&self, job_id: Uuid, progress: u8) -> Result<(), StoreError> {
        self.guarded(job_id, &[JobStatus::Processing], |job| {
            job.progress = job.progress.max(progress.min(100));
        })
        .await;
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        completion: &Completion,
    ) -> Result<WriteOutcome, StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(WriteOutcome::Missing);
        };
        if job.status.is_terminal() {
            return Ok(WriteOutcome::AlreadyTerminal);
        }

        let mut patch = serde_json::json!({
            "endTime": completion.end_time,
            "processedFrames": completion.processed_frames,
            "uniquePlatesCount": completion.unique_plates_count,
        });
        if let Some(seconds) = completion.processing_time {
            patch["processingTime"] = seconds.into();
        }
        if let Some(average) = completion.average_confidence {
            patch["averageConfidence"] = average.into();
        }

        job.processing_metadata = merge_metadata(&job.processing_metadata, patch)?;
        job.status = JobStatus::Completed;
        job.progress = 100;
        job.detected_plates = completion.detections.clone();
        job.error_message = None;
        job.updated_at = Utc::now();
        Ok(WriteOutcome::Applied)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        Ok(self
            .guarded(job_id, &[JobStatus::Queued, JobStatus::Processing], |job| {
                job.status = JobStatus::Failed;
                job.error_message = Some(error.to_string());
                job.processing_metadata.end_time = Some(ended_at);
            })
            .await)
    }

    async fn reset_for_retry(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let outcome = self
            .guarded(job_id, &[JobStatus::Failed], |job| {
                job.status = JobStatus::Queued;
                job.progress = 0;
                job.error_message = None;
                job.detected_plates.clear();
                job.video_metadata = None;
                job.processing_metadata = ProcessingMetadata::default();
            })
            .await;
        Ok(outcome == WriteOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::ProcessingSettings;

    fn new_job() -> NewJob {
        NewJob {
            owner_id: Uuid::new_v4(),
            original_name: "traffic.mp4".to_string(),
            file_path: "/uploads/traffic.mp4".to_string(),
            processing_settings: ProcessingSettings::default(),
        }
    }

    fn completion() -> Completion {
        Completion::from_detections(Vec::new(), None, Utc::now(), 10)
    }

    #[tokio::test]
    async fn test_terminal_write_is_idempotent() {
        let store = MemoryJobStore::new();
        let job = store.create(new_job()).await.unwrap();
        store.mark_processing(job.id, Utc::now()).await.unwrap();

        assert_eq!(store.complete(job.id, &completion()).await.unwrap(), WriteOutcome::Applied);
        assert_eq!(
            store.complete(job.id, &completion()).await.unwrap(),
            WriteOutcome::AlreadyTerminal
        );
        assert_eq!(
            store.fail(job.id, "late failure", Utc::now()).await.unwrap(),
            WriteOutcome::AlreadyTerminal
        );

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.error_message, None);
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let store = MemoryJobStore::new();
        let job = store.create(new_job()).await.unwrap();

        store.update_progress(job.id, 30).await.unwrap();
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 0, "queued jobs ignore progress");

        store.mark_processing(job.id, Utc::now()).await.unwrap();
        store.update_progress(job.id, 40).await.unwrap();
        store.update_progress(job.id, 25).await.unwrap();
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 40);
    }

    #[tokio::test]
    async fn test_reset_only_applies_to_failed_jobs() {
        let store = MemoryJobStore::new();
        let job = store.create(new_job()).await.unwrap();
        assert!(!store.reset_for_retry(job.id).await.unwrap());

        store.mark_processing(job.id, Utc::now()).await.unwrap();
        store
            .save_video_metadata(job.id, &VideoMetadata::new(10.0, 30.0, 640, 480))
            .await
            .unwrap();
        store.fail(job.id, "ffmpeg exploded", Utc::now()).await.unwrap();
        assert!(store.reset_for_retry(job.id).await.unwrap());

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.error_message, None);
        assert_eq!(stored.video_metadata, None);
        assert_eq!(stored.processing_metadata, ProcessingMetadata::default());
    }

    #[tokio::test]
    async fn test_missing_record() {
        let store = MemoryJobStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.mark_processing(id, Utc::now()).await.unwrap(), WriteOutcome::Missing);
        assert_eq!(store.complete(id, &completion()).await.unwrap(), WriteOutcome::Missing);
    }
}
