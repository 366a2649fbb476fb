use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Open the job-record pool. Workers size it from their concurrency so
/// progress writes never wait on a connection.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await
}

/// Apply `migrations/` (the `jobs` table).
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;
    tracing::debug!("Database migrations applied");
    Ok(())
}

pub mod queries;
