//! End-to-end tests against a running deployment
//!
//! These tests require:
//! 1. PostgreSQL database running (with migrations applied)
//! 2. Redis running
//! 3. API server running on configured port
//! 4. Worker process running with ffmpeg and a detection backend available
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:3000) and
//! E2E_VIDEO_PATH to a video file readable by the worker.

mod helpers;

use helpers::*;
use uuid::Uuid;

/// Get base URL from env or default to localhost
fn get_base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

fn get_video_path() -> String {
    std::env::var("E2E_VIDEO_PATH").expect("E2E_VIDEO_PATH must point at a test video")
}

#[tokio::test]
#[ignore] // Requires running API server, worker, and all infrastructure
async fn test_e2e_health_check() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );

    let body: serde_json::Value = response.json().await.expect("Invalid health body");
    assert_eq!(body["checks"]["database"]["status"], "ok");
    assert_eq!(body["checks"]["redis"]["status"], "ok");
    assert!(body["queue"]["active"].is_number());

    println!("✓ Health check passed");
}

#[tokio::test]
#[ignore] // Requires running API server, worker, and all infrastructure
async fn test_e2e_single_video_scan() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let video_path = get_video_path();

    println!("Scanning video: {}", video_path);

    // 1. Create the job record and admit it
    let job_id = create_job_record(&video_path)
        .await
        .expect("Failed to create job record");

    let enqueued = enqueue_job(&client, &base_url, job_id)
        .await
        .expect("Failed to enqueue job");
    assert_eq!(enqueued.job_id, job_id);
    assert_eq!(enqueued.status, "queued");
    println!("  ✓ Enqueued, task_id: {}", enqueued.task_id);

    // 2. A second enqueue while pending reuses the same task
    if let Ok(again) = enqueue_job(&client, &base_url, job_id).await {
        assert_eq!(again.task_id, enqueued.task_id);
    }

    // 3. Poll for completion
    let job_status = poll_job_status(&client, &base_url, job_id, 300)
        .await
        .expect("Failed to wait for job completion");

    println!("  ✓ Job finished with status: {}", job_status.status);

    assert_eq!(job_status.status, "completed", "{:?}", job_status.error_message);
    assert_eq!(job_status.progress, 100);
    assert!(job_status.video_metadata.is_some());
    assert!(job_status.error_message.is_none());
    assert_eq!(
        job_status.processing_metadata["uniquePlatesCount"]
            .as_u64()
            .map(|n| n as usize <= job_status.detected_plates),
        Some(true)
    );
    println!("  ✓ Detected {} plates", job_status.detected_plates);

    // 4. Completed jobs cannot be enqueued again
    let response = client
        .post(format!("{}/api/v1/jobs/{}/enqueue", base_url, job_id))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
}

#[tokio::test]
#[ignore]
async fn test_e2e_unreadable_video_fails_then_retries() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let missing = format!("/nonexistent/{}.mp4", Uuid::new_v4());
    let job_id = create_job_record(&missing)
        .await
        .expect("Failed to create job record");

    enqueue_job(&client, &base_url, job_id)
        .await
        .expect("Failed to enqueue job");

    let job_status = poll_job_status(&client, &base_url, job_id, 60)
        .await
        .expect("Failed to wait for job failure");

    assert_eq!(job_status.status, "failed");
    assert!(job_status.progress < 100);
    assert!(job_status.error_message.is_some());
    println!("  ✓ Job failed: {:?}", job_status.error_message);

    // Retry resets the record and re-admits it
    let retried = retry_job(&client, &base_url, job_id)
        .await
        .expect("Failed to retry job");
    assert_eq!(retried.status, "queued");

    let job_status = poll_job_status(&client, &base_url, job_id, 60)
        .await
        .expect("Failed to wait for retried job");
    assert_eq!(job_status.status, "failed");
}

#[tokio::test]
#[ignore]
async fn test_e2e_unknown_job_is_not_found() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let job_id = Uuid::new_v4();

    for path in ["", "/enqueue", "/retry"] {
        let url = format!("{}/api/v1/jobs/{}{}", base_url, job_id, path);
        let request = if path.is_empty() {
            client.get(url)
        } else {
            client.post(url)
        };
        let response = request.send().await.expect("Request failed");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND, "{path}");
    }
}

#[tokio::test]
#[ignore]
async fn test_e2e_concurrent_scans() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let video_path = get_video_path();

    println!("Testing concurrent scans with 3 jobs");

    let mut tasks = Vec::new();

    for _ in 0..3 {
        let base_url = base_url.clone();
        let video_path = video_path.clone();

        let task = tokio::spawn(async move {
            let client = reqwest::Client::new();

            let job_id = create_job_record(&video_path)
                .await
                .map_err(|e| e.to_string())?;
            enqueue_job(&client, &base_url, job_id)
                .await
                .map_err(|e| e.to_string())?;

            let job_status = poll_job_status(&client, &base_url, job_id, 600)
                .await
                .map_err(|e| e.to_string())?;

            Ok::<_, String>((job_id, job_status.status))
        });

        tasks.push(task);
    }

    let results = futures::future::join_all(tasks).await;

    let mut completed = 0;
    for result in results {
        match result {
            Ok(Ok((job_id, status))) => {
                println!("  ✓ {} finished with status: {}", job_id, status);
                if status == "completed" {
                    completed += 1;
                }
            }
            Ok(Err(e)) => println!("  ✗ Scan error: {}", e),
            Err(e) => println!("  ✗ Task error: {}", e),
        }
    }

    assert_eq!(completed, 3, "All concurrent scans should complete");

    let stats = queue_stats(&client, &base_url)
        .await
        .expect("Failed to read queue stats");
    assert!(stats.completed >= 3);
    println!(
        "  ✓ Queue: waiting={} active={} completed={} failed={}",
        stats.waiting, stats.active, stats.completed, stats.failed
    );
}
