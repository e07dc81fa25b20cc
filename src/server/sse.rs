use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::AppState;
use crate::daemon::events::JobEvent;

#[derive(Debug, Deserialize, Default)]
pub struct EventParams {
    pub job_id: Option<String>,
}

/// Logs at debug level when the client goes away and the stream drops.
struct SseDropGuard(&'static str);

impl Drop for SseDropGuard {
    fn drop(&mut self) {
        tracing::debug!("SSE {} client disconnected", self.0);
    }
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keepalive")
}

fn event_name(event: &JobEvent) -> &'static str {
    match event {
        JobEvent::StatusChanged { .. } => "status_changed",
        JobEvent::RetryScheduled { .. } => "retry_scheduled",
        JobEvent::Output { .. } => "output",
        JobEvent::JobAdded { .. } => "job_added",
        JobEvent::JobRemoved { .. } => "job_removed",
    }
}

/// GET /api/progress/stream: one `progress` event per broadcaster tick.
/// A slow client skips straight to the newest feed.
pub async fn progress_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("Progress stream client connected");
    let subscription = state.controller.broadcaster().subscribe();
    let drop_guard = SseDropGuard("progress");

    let stream = WatchStream::from_changes(subscription.into_receiver()).filter_map(move |feed| {
        let _ = &drop_guard;
        match serde_json::to_string(feed.as_ref()) {
            Ok(data) => Some(Ok(Event::default()
                .event("progress")
                .id(feed.sequence.to_string())
                .data(data))),
            Err(e) => {
                tracing::warn!("Failed to serialize progress feed: {}", e);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(keep_alive())
}

/// GET /api/events?job_id=<uuid>: lifecycle events, optionally for one job.
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!("Event stream client connected");
    let rx = state.event_tx.subscribe();
    let filter_job_id = params.job_id.and_then(|s| Uuid::parse_str(&s).ok());
    let drop_guard = SseDropGuard("event");

    let stream = BroadcastStream::new(rx).filter_map(move |result| {
        let _ = &drop_guard;
        match result {
            Ok(event) => {
                if filter_job_id.is_some_and(|id| event.job_id() != id) {
                    return None;
                }
                serde_json::to_string(&event)
                    .ok()
                    .map(|data| Ok(Event::default().event(event_name(&event)).data(data)))
            }
            Err(_) => Some(Ok(
                Event::default().comment("lagged: some events were missed")
            )),
        }
    });

    Sse::new(stream).keep_alive(keep_alive())
}
