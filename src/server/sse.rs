//! Server-Sent Events rendering of a session's broadcast channel.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream;
use tracing::error;

use crate::streaming::{StreamEvent, Subscription};

const KEEP_ALIVE_TEXT: &str = "keep-alive";

/// One SSE frame: the event name is `output` or `complete`, the data is the JSON payload.
pub fn to_sse_event(event: &StreamEvent) -> Event {
    let data = match event {
        StreamEvent::Output(output) => serde_json::to_string(output),
        StreamEvent::Completed(result) => serde_json::to_string(result),
    };
    match data {
        Ok(data) => Event::default().event(event.name()).data(data),
        Err(e) => {
            error!(error = %e, "Failed to serialize stream event");
            Event::default()
                .event("error")
                .data(format!(r#"{{"error": "Failed to serialize event: {}"}}"#, e))
        }
    }
}

/// Stream a session's events until (and including) its `complete` event.
pub fn session_stream(subscription: Subscription, keep_alive: Duration) -> Response {
    let events = stream::unfold(Some(subscription), |state| async move {
        let mut subscription = state?;
        let event = subscription.recv().await?;
        // The subscription is dropped right after the terminal event.
        let next = match event {
            StreamEvent::Completed(_) => None,
            StreamEvent::Output(_) => Some(subscription),
        };
        Some((Ok::<_, Infallible>(to_sse_event(&event)), next))
    });

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(keep_alive).text(KEEP_ALIVE_TEXT))
        .into_response()
}
