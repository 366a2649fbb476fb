//! Per-job workflow: probe, sample frames, detect plates, aggregate, persist.

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::job::{Completion, Job, WriteOutcome};
use crate::services::dedup::filter_duplicates;
use crate::services::detector::{DetectionParams, DetectionWorker};
use crate::services::media::{FrameSource, MediaError};
use crate::services::plates::validate_plates;
use crate::services::store::{JobStore, StoreError};
use crate::services::worker_pool::JobRunner;

/// Highest progress reported before the completed record is written.
const MAX_IN_FLIGHT_PROGRESS: f64 = 99.0;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Parent directory for per-job frame workspaces
    pub work_root: PathBuf,
    /// Upper bound on the sampling rate; the source fps is the other bound
    pub max_extraction_fps: f64,
    /// Frame-number bucket width used by the duplicate filter
    pub dedup_bucket_frames: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("plate-scan"),
            max_extraction_fps: 1.0,
            dedup_bucket_frames: 30,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Metadata extraction failed: {0}")]
    Metadata(String),

    #[error("Frame extraction failed: {0}")]
    Extraction(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl PipelineError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Extraction(_) | PipelineError::Persistence(_))
    }
}

impl From<MediaError> for PipelineError {
    fn from(err: MediaError) -> Self {
        if err.is_metadata_error() {
            PipelineError::Metadata(err.to_string())
        } else {
            PipelineError::Extraction(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { owner_id: Uuid, detections: usize },
    /// The record was already terminal; nothing was written.
    Skipped,
}

/// Progress callback handed to a pipeline run.
///
/// Percentages are clamped to 0-100, floored to integers, and only forwarded
/// when they exceed the last forwarded value.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(u8) + Send + Sync>,
    last: Arc<AtomicU8>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(u8) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
            last: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, percent: f64) {
        if percent.is_nan() {
            return;
        }
        let percent = percent.clamp(0.0, 100.0).floor() as u8;
        let previous = self.last.fetch_max(percent, Ordering::SeqCst);
        if percent > previous {
            (self.sink)(percent);
        }
    }

    pub fn last(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Frame extraction owns the first half of the progress range.
fn extraction_progress(stage_percent: f64) -> f64 {
    (stage_percent * 0.5).min(50.0)
}

/// Detection owns the second half, held below 100 until the job completes.
fn detection_progress(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 50.0;
    }
    (50.0 + processed as f64 / total as f64 * 50.0).min(MAX_IN_FLIGHT_PROGRESS)
}

/// Runs the probe → extract → detect → aggregate workflow for one job.
pub struct FramePipeline {
    store: Arc<dyn JobStore>,
    frames: Arc<dyn FrameSource>,
    detector: Arc<dyn DetectionWorker>,
    settings: PipelineSettings,
}

impl FramePipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        frames: Arc<dyn FrameSource>,
        detector: Arc<dyn DetectionWorker>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            frames,
            detector,
            settings,
        }
    }

    async fn process(
        &self,
        job: &Job,
        started_at: chrono::DateTime<Utc>,
        progress: &ProgressReporter,
    ) -> Result<RunOutcome, PipelineError> {
        let video = Path::new(&job.file_path);

        let metadata = self.frames.probe(video).await?;
        debug!(
            job_id = %job.id,
            duration = metadata.duration,
            fps = metadata.fps,
            total_frames = metadata.total_frames,
            "Probed video"
        );
        match self.store.save_video_metadata(job.id, &metadata).await? {
            WriteOutcome::Applied => {}
            WriteOutcome::AlreadyTerminal => return Ok(RunOutcome::Skipped),
            WriteOutcome::Missing => return Err(PipelineError::JobNotFound(job.id)),
        }

        tokio::fs::create_dir_all(&self.settings.work_root)
            .await
            .map_err(|e| PipelineError::Extraction(e.to_string()))?;
        // Removed on drop, whichever way this function returns.
        let workspace = tempfile::Builder::new()
            .prefix(&format!("job-{}-", job.id))
            .tempdir_in(&self.settings.work_root)
            .map_err(|e| PipelineError::Extraction(e.to_string()))?;

        let rate = self.settings.max_extraction_fps.min(metadata.fps);
        let on_extract = |percent: f64| progress.report(extraction_progress(percent));
        let frames = self
            .frames
            .extract_frames(video, workspace.path(), rate, metadata.duration, &on_extract)
            .await?;
        info!(job_id = %job.id, frames = frames.len(), rate, "Extracted frames");

        // Pick up deletions that happened while extraction ran.
        match self.store.find_by_id(job.id).await? {
            None => return Err(PipelineError::JobNotFound(job.id)),
            Some(current) if current.status.is_terminal() => return Ok(RunOutcome::Skipped),
            Some(_) => {}
        }

        let params = DetectionParams {
            confidence_threshold: job.processing_settings.confidence_threshold,
            mode: job.processing_settings.processing_mode,
        };

        let mut detections = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            let frame_index = (i + 1) as u32;
            match self.detector.detect(frame, frame_index, &params).await {
                Ok(found) => detections.extend(found),
                Err(e) => {
                    warn!(job_id = %job.id, frame = frame_index, error = %e, "Frame detection failed, skipping");
                    counter!("plate_scan_frame_failures_total").increment(1);
                }
            }
            progress.report(detection_progress(i + 1, frames.len()));
        }

        let raw_count = detections.len();
        if job.processing_settings.enable_duplicate_filtering {
            detections = filter_duplicates(detections, self.settings.dedup_bucket_frames);
        }
        if job.processing_settings.enable_state_validation {
            detections = validate_plates(detections);
        }

        let completion = Completion::from_detections(
            detections,
            Some(started_at),
            Utc::now(),
            metadata.total_frames,
        );
        match self.store.complete(job.id, &completion).await? {
            WriteOutcome::Applied => {}
            WriteOutcome::AlreadyTerminal => return Ok(RunOutcome::Skipped),
            WriteOutcome::Missing => return Err(PipelineError::JobNotFound(job.id)),
        }
        progress.report(100.0);

        info!(
            job_id = %job.id,
            raw = raw_count,
            kept = completion.detections.len(),
            unique = completion.unique_plates_count,
            "Job completed"
        );

        Ok(RunOutcome::Completed {
            owner_id: job.owner_id,
            detections: completion.detections.len(),
        })
    }

    async fn record_failure(&self, job_id: Uuid, error: &PipelineError) {
        match self.store.fail(job_id, &error.to_string(), Utc::now()).await {
            Ok(WriteOutcome::Applied) => {}
            Ok(outcome) => debug!(job_id = %job_id, ?outcome, "Failure not recorded"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to record job failure"),
        }
    }
}

#[async_trait]
impl JobRunner for FramePipeline {
    async fn run(
        &self,
        job_id: Uuid,
        progress: ProgressReporter,
    ) -> Result<RunOutcome, PipelineError> {
        let job = self
            .store
            .find_by_id(job_id)
            .await?
            .ok_or(PipelineError::JobNotFound(job_id))?;

        if job.status.is_terminal() {
            info!(job_id = %job_id, status = %job.status, "Job already finished, skipping");
            return Ok(RunOutcome::Skipped);
        }

        let started_at = Utc::now();
        match self.store.mark_processing(job_id, started_at).await? {
            WriteOutcome::Applied => {}
            WriteOutcome::AlreadyTerminal => return Ok(RunOutcome::Skipped),
            WriteOutcome::Missing => return Err(PipelineError::JobNotFound(job_id)),
        }

        let result = self.process(&job, started_at, &progress).await;
        if let Err(e) = &result {
            self.record_failure(job_id, e).await;
        }
        result
    }
}
