use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::detection::Detection;

/// Lifecycle status of a video processing job.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Speed/accuracy trade-off forwarded to the detection worker.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProcessingMode {
    Fast,
    #[default]
    Standard,
    Accurate,
}

/// Per-job settings chosen at upload time. Frozen once processing starts.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSettings {
    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence_threshold: f64,

    #[garde(skip)]
    pub processing_mode: ProcessingMode,

    #[garde(skip)]
    pub enable_duplicate_filtering: bool,

    #[garde(skip)]
    pub enable_state_validation: bool,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            processing_mode: ProcessingMode::Standard,
            enable_duplicate_filtering: true,
            enable_state_validation: true,
        }
    }
}

/// Source video properties, written once before frame extraction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    /// Duration in seconds
    pub duration: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// `floor(duration * fps)`
    pub total_frames: u64,
}

impl VideoMetadata {
    pub fn new(duration: f64, fps: f64, width: u32, height: u32) -> Self {
        let total_frames = (duration * fps).floor().max(0.0) as u64;
        Self {
            duration,
            fps,
            width,
            height,
            total_frames,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_frames: u64,
    #[serde(default)]
    pub total_frames: u64,
    /// Wall-clock seconds between start and end
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_plates_count: Option<u64>,
}

/// A video processing job as persisted in the job record store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub original_name: String,
    pub file_path: String,
    pub status: JobStatus,
    pub progress: u8,
    pub processing_settings: ProcessingSettings,
    pub video_metadata: Option<VideoMetadata>,
    pub processing_metadata: ProcessingMetadata,
    pub detected_plates: Vec<Detection>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by the upload flow when a job record is created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: Uuid,
    pub original_name: String,
    pub file_path: String,
    pub processing_settings: ProcessingSettings,
}

/// Final results written when a pipeline run completes.
#[derive(Debug, Clone)]
pub struct Completion {
    pub detections: Vec<Detection>,
    pub end_time: DateTime<Utc>,
    pub processed_frames: u64,
    pub processing_time: Option<f64>,
    pub average_confidence: Option<f64>,
    pub unique_plates_count: u64,
}

impl Completion {
    /// Derive summary statistics from the kept detections.
    pub fn from_detections(
        detections: Vec<Detection>,
        start_time: Option<DateTime<Utc>>,
        end_time: DateTime<Utc>,
        processed_frames: u64,
    ) -> Self {
        let average_confidence = if detections.is_empty() {
            None
        } else {
            Some(detections.iter().map(|d| d.confidence).sum::<f64>() / detections.len() as f64)
        };

        let unique_plates_count = detections
            .iter()
            .map(|d| d.plate_number.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len() as u64;

        let processing_time = start_time
            .map(|start| (end_time - start).num_milliseconds().max(0) as f64 / 1000.0);

        Self {
            detections,
            end_time,
            processed_frames,
            processing_time,
            average_confidence,
            unique_plates_count,
        }
    }
}

/// Outcome of a status-guarded write against the job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The record exists but its status did not allow the write
    /// (already `completed` or `failed`); nothing changed.
    AlreadyTerminal,
    Missing,
}
