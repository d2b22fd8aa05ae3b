//! Server-Sent Events (SSE) utilities
//!
//! Turns a session [`EventStream`] into an axum SSE response. Each pipeline
//! event becomes one unnamed SSE message whose data is the event JSON, so a
//! browser `EventSource.onmessage` handler receives every event.

use crate::events::EventStream;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Keep-alive comment interval for idle streams (long training steps can be
/// silent for a while)
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Create an SSE response that relays a session event stream
///
/// The response body ends right after the terminal progress event, or when
/// all publishers are dropped.
pub fn session_sse_stream(
    session_label: String,
    mut events: EventStream,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(session = %session_label, "SSE client subscribed to session events");

    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            let event_type = event.event_type();
            match serde_json::to_string(&event) {
                Ok(event_json) => {
                    debug!("SSE: Sending {} event", event_type);
                    yield Ok(Event::default().data(event_json));
                }
                Err(e) => {
                    warn!("SSE: Failed to serialize {} event: {}", event_type, e);
                }
            }
        }
        info!(session = %session_label, "SSE: Session event stream closed");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("heartbeat"),
    )
}
