use metrics_exporter_prometheus::PrometheusBuilder;
use plate_scan::{
    app_state::PipelineContext,
    config::{AppConfig, DetectorBackend},
    db, routes,
    services::{
        detector::{DetectionWorker, HttpDetector, SubprocessDetector},
        media::FfmpegFrameSource,
        notifier::RedisNotifier,
        pipeline::FramePipeline,
        queue::{RedisQueueBackend, TaskQueue},
        store::PgJobStore,
        worker_pool::WorkerPool,
    },
    shutdown::shutdown_signal,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting plate-scan worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = config.worker_metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to start Prometheus listener");
        routes::metrics::describe_metrics();
        tracing::info!(%addr, "Serving worker metrics");
    }

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.worker_pool_size())
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let redis = redis::Client::open(config.redis_url.as_str()).expect("Invalid Redis URL");
    let queue = Arc::new(TaskQueue::new(
        Arc::new(RedisQueueBackend::from_client(redis.clone())),
        config.queue_config(),
    ));
    queue
        .health_check()
        .await
        .expect("Failed to reach Redis task queue");

    let store = Arc::new(PgJobStore::new(db_pool));
    let notifier = Arc::new(RedisNotifier::spawn(redis, config.notifier_buffer));
    let ctx = PipelineContext::new(store.clone(), queue, notifier);

    let frames = Arc::new(FfmpegFrameSource::new(
        config.ffmpeg_path.clone(),
        config.ffprobe_path.clone(),
        Duration::from_secs(config.extraction_timeout_secs),
    ));
    let pipeline = Arc::new(FramePipeline::new(
        store,
        frames,
        build_detector(&config),
        config.pipeline_settings(),
    ));

    let pool = WorkerPool::start(ctx, pipeline);
    tracing::info!(
        concurrency = config.worker_concurrency,
        detector = ?config.detector_backend,
        "Worker ready, processing jobs"
    );

    shutdown_signal().await;
    tracing::info!("Waiting for in-flight jobs");
    pool.shutdown().await;
}

fn build_detector(config: &AppConfig) -> Arc<dyn DetectionWorker> {
    let timeout = Duration::from_secs(config.detector_timeout_secs);
    match config.detector_backend {
        DetectorBackend::Subprocess => Arc::new(SubprocessDetector::new(
            config.detector_program.clone(),
            config.detector_script.clone(),
            timeout,
        )),
        DetectorBackend::Http => {
            let url = config
                .detector_url
                .clone()
                .expect("DETECTOR_URL checked during configuration");
            Arc::new(HttpDetector::new(url, timeout).expect("Failed to build detector client"))
        }
    }
}
