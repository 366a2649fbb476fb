//! Best-effort fan-out of job events to observers, keyed by job owner.

use futures::{Stream, StreamExt};
use redis::AsyncCommands;
use std::pin::Pin;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::events::JobEvent;

const CHANNEL_PREFIX: &str = "plate_scan:events";

/// Push channel for live job status. `notify` never blocks; events may be dropped.
pub trait ProgressNotifier: Send + Sync {
    fn notify(&self, event: JobEvent);
}

#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type EventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

/// Pub/sub channel name for an owner's events.
pub fn owner_channel(owner_id: Uuid) -> String {
    format!("{CHANNEL_PREFIX}:{owner_id}")
}

/// Publishes events to Redis pub/sub from a background task.
pub struct RedisNotifier {
    tx: mpsc::Sender<JobEvent>,
}

impl RedisNotifier {
    /// Start the publisher task. Must be called inside a Tokio runtime.
    pub fn spawn(client: redis::Client, buffer: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<JobEvent>(buffer.max(1));

        tokio::spawn(async move {
            let mut conn = None;
            while let Some(event) = rx.recv().await {
                if conn.is_none() {
                    match client.get_multiplexed_async_connection().await {
                        Ok(c) => conn = Some(c),
                        Err(e) => {
                            warn!(error = %e, job_id = %event.job_id, "Dropping job event, Redis unavailable");
                            continue;
                        }
                    }
                }

                let Some(c) = conn.as_mut() else { continue };
                let payload = match serde_json::to_string(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize job event");
                        continue;
                    }
                };

                let channel = owner_channel(event.owner_id);
                if let Err(e) = c.publish::<_, _, ()>(&channel, payload).await {
                    warn!(error = %e, channel = %channel, "Failed to publish job event");
                    conn = None;
                } else {
                    debug!(channel = %channel, event = %event.event, "Published job event");
                }
            }
        });

        Self { tx }
    }
}

impl ProgressNotifier for RedisNotifier {
    fn notify(&self, event: JobEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "Job event buffer full, dropping event");
        }
    }
}

/// Subscribe to one owner's events published by [`RedisNotifier`].
pub async fn subscribe_owner(
    client: &redis::Client,
    owner_id: Uuid,
) -> Result<EventStream, NotifierError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(owner_channel(owner_id)).await?;

    let stream = pubsub.into_on_message().filter_map(|msg| async move {
        let payload: String = msg.get_payload().ok()?;
        serde_json::from_str(&payload).ok()
    });

    Ok(Box::pin(stream))
}

/// In-process notifier backed by a broadcast channel.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Stream of events for one owner. Lagged receivers skip the missed events.
    pub fn subscribe_owner(&self, owner_id: Uuid) -> EventStream {
        let rx = self.tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |event| futures::future::ready(event.owner_id == owner_id));

        Box::pin(stream)
    }
}

impl ProgressNotifier for BroadcastNotifier {
    fn notify(&self, event: JobEvent) {
        // No subscribers is not an error for a best-effort channel.
        let _ = self.tx.send(event);
    }
}
