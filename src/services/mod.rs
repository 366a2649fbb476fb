pub mod dedup;
pub mod detector;
pub mod media;
pub mod notifier;
pub mod pipeline;
pub mod plates;
pub mod queue;
pub mod store;
pub mod worker_pool;
