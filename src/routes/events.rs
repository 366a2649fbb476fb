use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::services::notifier;

/// GET /api/v1/owners/{owner_id}/events: Live job events for one owner (SSE).
pub async fn owner_events(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let events = notifier::subscribe_owner(&state.redis, owner_id)
        .await
        .map_err(|e| {
            tracing::error!(owner_id = %owner_id, error = %e, "Failed to subscribe to job events");
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    tracing::debug!(owner_id = %owner_id, "Event stream client connected");

    let stream = events.filter_map(|event| async move {
        match serde_json::to_string(&event) {
            Ok(json) => Some(Ok(Event::default().event(event.event.as_ref()).data(json))),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize job event");
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
