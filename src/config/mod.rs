use garde::Validate;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::pipeline::PipelineSettings;
use crate::services::queue::TaskQueueConfig;

/// Which detection worker backend to use.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackend {
    #[default]
    Subprocess,
    Http,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    /// Upper bound on pooled Postgres connections per process
    #[serde(default = "default_database_max_connections")]
    #[garde(range(min = 1, max = 200))]
    pub database_max_connections: u32,

    /// Redis connection string for the task queue and event fan-out
    #[garde(length(min = 1))]
    pub redis_url: String,

    /// Number of jobs processed concurrently by one worker process
    #[serde(default = "default_worker_concurrency")]
    #[garde(range(min = 1, max = 64))]
    pub worker_concurrency: usize,

    /// Attempts per task, including the first
    #[serde(default = "default_max_attempts")]
    #[garde(range(min = 1, max = 20))]
    pub max_attempts: u32,

    /// Exponential backoff base; doubles per attempt
    #[serde(default = "default_backoff_base_ms")]
    #[garde(skip)]
    pub backoff_base_ms: u64,

    /// Admission delay so the upload flow can commit the record first
    #[serde(default = "default_enqueue_delay_ms")]
    #[garde(skip)]
    pub enqueue_delay_ms: u64,

    /// A task without a heartbeat for this long is reclaimed
    #[serde(default = "default_stall_timeout_secs")]
    #[garde(range(min = 1))]
    pub stall_timeout_secs: u64,

    #[serde(default = "default_stall_check_interval_secs")]
    #[garde(range(min = 1))]
    pub stall_check_interval_secs: u64,

    /// Reclaims a task survives before it is failed as stalled
    #[serde(default = "default_max_stalled_count")]
    #[garde(skip)]
    pub max_stalled_count: u32,

    /// Idle sleep between empty dequeue attempts
    #[serde(default = "default_poll_interval_ms")]
    #[garde(range(min = 10))]
    pub poll_interval_ms: u64,

    #[serde(default = "default_keep_completed")]
    #[garde(skip)]
    pub keep_completed: usize,

    #[serde(default = "default_keep_failed")]
    #[garde(skip)]
    pub keep_failed: usize,

    /// Root under which per-job frame workspaces are created
    #[serde(default = "default_frame_workdir")]
    #[garde(skip)]
    pub frame_workdir: PathBuf,

    /// Upper bound on the frame sampling rate
    #[serde(default = "default_max_extraction_fps")]
    #[garde(range(min = 0.01, max = 60.0))]
    pub max_extraction_fps: f64,

    /// Width, in frame numbers, of a duplicate-suppression bucket
    #[serde(default = "default_dedup_bucket_frames")]
    #[garde(range(min = 1))]
    pub dedup_bucket_frames: u32,

    #[serde(default = "default_ffmpeg_path")]
    #[garde(length(min = 1))]
    pub ffmpeg_path: String,

    #[serde(default = "default_ffprobe_path")]
    #[garde(length(min = 1))]
    pub ffprobe_path: String,

    #[serde(default = "default_extraction_timeout_secs")]
    #[garde(range(min = 1))]
    pub extraction_timeout_secs: u64,

    #[serde(default)]
    #[garde(skip)]
    pub detector_backend: DetectorBackend,

    /// Interpreter used by the subprocess detector
    #[serde(default = "default_detector_program")]
    #[garde(length(min = 1))]
    pub detector_program: String,

    #[serde(default = "default_detector_script")]
    #[garde(skip)]
    pub detector_script: PathBuf,

    /// Endpoint used by the HTTP detector
    #[serde(default)]
    #[garde(skip)]
    pub detector_url: Option<String>,

    #[serde(default = "default_detector_timeout_secs")]
    #[garde(range(min = 1))]
    pub detector_timeout_secs: u64,

    /// Pending events buffered before the notifier starts dropping
    #[serde(default = "default_notifier_buffer")]
    #[garde(range(min = 1))]
    pub notifier_buffer: usize,

    /// Prometheus listener for the worker process; disabled when unset
    #[serde(default)]
    #[garde(skip)]
    pub worker_metrics_addr: Option<std::net::SocketAddr>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_worker_concurrency() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2000
}

fn default_enqueue_delay_ms() -> u64 {
    1000
}

fn default_stall_timeout_secs() -> u64 {
    30
}

fn default_stall_check_interval_secs() -> u64 {
    15
}

fn default_max_stalled_count() -> u32 {
    1
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_keep_completed() -> usize {
    10
}

fn default_keep_failed() -> usize {
    5
}

fn default_frame_workdir() -> PathBuf {
    std::env::temp_dir().join("plate-scan")
}

fn default_max_extraction_fps() -> f64 {
    1.0
}

fn default_dedup_bucket_frames() -> u32 {
    30
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_extraction_timeout_secs() -> u64 {
    1800
}

fn default_detector_program() -> String {
    "python3".to_string()
}

fn default_detector_script() -> PathBuf {
    PathBuf::from("python/anpr_processor.py")
}

fn default_detector_timeout_secs() -> u64 {
    120
}

fn default_notifier_buffer() -> usize {
    256
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),

    #[error("DETECTOR_URL is required when DETECTOR_BACKEND=http")]
    MissingDetectorUrl,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.validate()?;
        if config.detector_backend == DetectorBackend::Http && config.detector_url.is_none() {
            return Err(ConfigError::MissingDetectorUrl);
        }
        Ok(config)
    }

    /// Pool size for a worker: one connection per concurrent job plus the
    /// progress forwarders and the stall sweeper.
    pub fn worker_pool_size(&self) -> u32 {
        let wanted = (self.worker_concurrency as u32).saturating_mul(2).saturating_add(1);
        wanted.max(self.database_max_connections)
    }

    pub fn queue_config(&self) -> TaskQueueConfig {
        TaskQueueConfig {
            concurrency: self.worker_concurrency,
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            default_delay: Duration::from_millis(self.enqueue_delay_ms),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            stall_check_interval: Duration::from_secs(self.stall_check_interval_secs),
            max_stalled_count: self.max_stalled_count,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            work_root: self.frame_workdir.clone(),
            max_extraction_fps: self.max_extraction_fps,
            dedup_bucket_frames: self.dedup_bucket_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut vars = vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/plate_scan".to_string()),
            ("REDIS_URL".to_string(), "redis://127.0.0.1/".to_string()),
        ];
        vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        vars
    }

    #[test]
    fn test_defaults_match_queue_policy() {
        let config: AppConfig = envy::from_iter(vars(&[])).unwrap();
        assert!(config.validate().is_ok());

        let queue = config.queue_config();
        assert_eq!(queue.concurrency, 3);
        assert_eq!(queue.max_attempts, 3);
        assert_eq!(queue.backoff_base, Duration::from_secs(2));
        assert_eq!(queue.default_delay, Duration::from_secs(1));
        assert_eq!((queue.keep_completed, queue.keep_failed), (10, 5));
        assert_eq!(queue.max_stalled_count, 1);

        let pipeline = config.pipeline_settings();
        assert_eq!(pipeline.max_extraction_fps, 1.0);
        assert_eq!(pipeline.dedup_bucket_frames, 30);
        assert_eq!(config.detector_backend, DetectorBackend::Subprocess);
        assert_eq!(config.worker_metrics_addr, None);
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.worker_pool_size(), 10);
    }

    #[test]
    fn test_overrides_and_validation() {
        let config: AppConfig = envy::from_iter(vars(&[
            ("WORKER_CONCURRENCY", "8"),
            ("DEDUP_BUCKET_FRAMES", "15"),
            ("DETECTOR_BACKEND", "http"),
            ("DETECTOR_URL", "http://detector:8000/detect"),
        ]))
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_config().concurrency, 8);
        assert_eq!(config.worker_pool_size(), 17);
        assert_eq!(config.pipeline_settings().dedup_bucket_frames, 15);
        assert_eq!(config.detector_backend, DetectorBackend::Http);

        let zero_workers: AppConfig =
            envy::from_iter(vars(&[("WORKER_CONCURRENCY", "0")])).unwrap();
        assert!(zero_workers.validate().is_err());
    }
}
