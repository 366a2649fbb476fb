use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{AsRefStr, Display};
use uuid::Uuid;

use crate::models::job::JobStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobEventKind {
    Progress,
    Completed,
    Failed,
}

/// Live status update pushed to observers of a job owner.
///
/// Delivery is best-effort; observers must tolerate gaps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub event: JobEventKind,
    pub job_id: Uuid,
    pub owner_id: Uuid,
    pub payload: serde_json::Value,
}

impl JobEvent {
    pub fn progress(job_id: Uuid, owner_id: Uuid, progress: u8) -> Self {
        Self {
            event: JobEventKind::Progress,
            job_id,
            owner_id,
            payload: json!({ "progress": progress, "status": JobStatus::Processing }),
        }
    }

    pub fn completed(job_id: Uuid, owner_id: Uuid, detected_plates: usize) -> Self {
        Self {
            event: JobEventKind::Completed,
            job_id,
            owner_id,
            payload: json!({ "status": JobStatus::Completed, "detectedPlates": detected_plates }),
        }
    }

    pub fn failed(job_id: Uuid, owner_id: Uuid, error: &str) -> Self {
        Self {
            event: JobEventKind::Failed,
            job_id,
            owner_id,
            payload: json!({ "status": JobStatus::Failed, "error": error }),
        }
    }
}
