//! Test helper utilities for E2E testing

use plate_scan::{
    config::AppConfig,
    db,
    models::job::{NewJob, ProcessingSettings},
    services::store::{JobStore, PgJobStore},
};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Response from POST /api/v1/jobs/{job_id}/enqueue and /retry
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub status: String,
    pub message: String,
}

/// Response from GET /api/v1/jobs/{job_id}
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub progress: u8,
    pub video_metadata: Option<serde_json::Value>,
    pub processing_metadata: serde_json::Value,
    pub detected_plates: usize,
    pub error_message: Option<String>,
}

/// Response from GET /api/v1/queue/stats
#[derive(Debug, Deserialize)]
pub struct QueueStatsResponse {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Insert a queued job record the way the upload flow would.
pub async fn create_job_record(
    video_path: &str,
) -> Result<Uuid, Box<dyn std::error::Error + Send + Sync>> {
    let config = AppConfig::from_env().map_err(|e| e.to_string())?;
    let pool = db::init_pool(&config.database_url, 2).await?;
    let store = PgJobStore::new(pool);

    let job = store
        .create(NewJob {
            owner_id: Uuid::new_v4(),
            original_name: video_path
                .rsplit('/')
                .next()
                .unwrap_or(video_path)
                .to_string(),
            file_path: video_path.to_string(),
            processing_settings: ProcessingSettings::default(),
        })
        .await?;

    Ok(job.id)
}

async fn post_for_enqueue(
    client: &reqwest::Client,
    url: String,
) -> Result<EnqueueResponse, Box<dyn std::error::Error + Send + Sync>> {
    let response = client.post(url).send().await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Request failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<EnqueueResponse>().await?)
}

pub async fn enqueue_job(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
) -> Result<EnqueueResponse, Box<dyn std::error::Error + Send + Sync>> {
    post_for_enqueue(client, format!("{}/api/v1/jobs/{}/enqueue", base_url, job_id)).await
}

pub async fn retry_job(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
) -> Result<EnqueueResponse, Box<dyn std::error::Error + Send + Sync>> {
    post_for_enqueue(client, format!("{}/api/v1/jobs/{}/retry", base_url, job_id)).await
}

pub async fn get_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
) -> Result<JobStatusResponse, Box<dyn std::error::Error + Send + Sync>> {
    let response = client
        .get(format!("{}/api/v1/jobs/{}", base_url, job_id))
        .send()
        .await?;

    if !response.status().is_success() {
        let error_text = response.text().await?;
        return Err(format!("Status check failed: {}", error_text).into());
    }

    Ok(response.json::<JobStatusResponse>().await?)
}

/// Poll job status until completed or failed (with timeout).
///
/// Also checks that progress never goes backwards while polling.
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
    timeout_secs: u64,
) -> Result<JobStatusResponse, Box<dyn std::error::Error + Send + Sync>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms
    let mut last_progress = 0;

    for attempt in 0..max_attempts {
        let status_response = get_job_status(client, base_url, job_id).await?;

        match status_response.status.as_str() {
            "completed" | "failed" => return Ok(status_response),
            "processing" => {
                if status_response.progress < last_progress {
                    return Err(format!(
                        "Progress went backwards: {} -> {}",
                        last_progress, status_response.progress
                    )
                    .into());
                }
                last_progress = status_response.progress;
            }
            "queued" => last_progress = 0,
            other => return Err(format!("Unknown job status: {}", other).into()),
        }

        if attempt % 10 == 0 && attempt > 0 {
            println!("  ... still waiting (attempt {}/{})", attempt, max_attempts);
        }
        sleep(Duration::from_millis(500)).await;
    }

    Err(format!("Job did not finish within {} seconds", timeout_secs).into())
}

pub async fn queue_stats(
    client: &reqwest::Client,
    base_url: &str,
) -> Result<QueueStatsResponse, Box<dyn std::error::Error + Send + Sync>> {
    let response = client
        .get(format!("{}/api/v1/queue/stats", base_url))
        .send()
        .await?
        .error_for_status()?;

    Ok(response.json::<QueueStatsResponse>().await?)
}
