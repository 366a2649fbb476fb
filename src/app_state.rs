use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{
    notifier::ProgressNotifier,
    queue::TaskQueue,
    store::{JobStore, PgJobStore},
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<TaskQueue>,
    pub redis: redis::Client,
}

impl AppState {
    pub fn new(db: PgPool, queue: TaskQueue, redis: redis::Client) -> Self {
        Self {
            store: Arc::new(PgJobStore::new(db.clone())),
            db,
            queue: Arc::new(queue),
            redis,
        }
    }
}

/// Handles a worker needs to run jobs, built once at startup.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<TaskQueue>,
    pub notifier: Arc<dyn ProgressNotifier>,
}

impl PipelineContext {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<TaskQueue>,
        notifier: Arc<dyn ProgressNotifier>,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
        }
    }
}
