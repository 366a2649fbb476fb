use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use plate_scan::{
    app_state::AppState,
    config::AppConfig,
    db, routes,
    services::queue::{RedisQueueBackend, TaskQueue},
    shutdown::shutdown_signal,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    tracing::info!(bind_addr = %config.bind_addr, "Starting plate-scan API");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    routes::metrics::describe_metrics();

    let db_pool = db::init_pool(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // The API only admits and inspects tasks; workers claim them.
    let redis = redis::Client::open(config.redis_url.as_str()).expect("Invalid Redis URL");
    let queue = TaskQueue::new(
        Arc::new(RedisQueueBackend::from_client(redis.clone())),
        config.queue_config(),
    );
    if let Err(e) = queue.health_check().await {
        tracing::warn!(error = %e, "Redis unreachable at startup, queue endpoints will return 503");
    }

    let app = routes::router(AppState::new(db_pool, queue, redis), Arc::new(prometheus));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}
