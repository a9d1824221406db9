//! Server-Sent Events endpoint relaying one tunnel's live events to the UI.
//!
//! Grounded on `routes/events.rs`'s SSE stream shape, adapted from its shared
//! `broadcast::Sender` to the Fan-out Hub's per-subscriber bounded `mpsc`
//! (design notes §4.7): a slow client is dropped, not lagged-and-counted.
//! Unsubscription on disconnect is implicit — dropping the stream drops the
//! receiver, closing the channel; the Hub reaps it lazily on its next publish.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream;

use crate::fanout::Filter;
use crate::state::AppState;

/// `GET /api/sse/tunnel/{instanceId}` — relays one instance's events as JSON
/// SSE frames until the client disconnects or the instance is unknown.
pub async fn tunnel_events(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> impl IntoResponse {
    let Some(endpoint_id) = state.cache.find_endpoint_for_instance(&instance_id).await else {
        return Err((StatusCode::NOT_FOUND, "unknown instance"));
    };

    let subscription = state
        .fanout
        .subscribe(Filter::OneTunnel { endpoint_id, instance_id })
        .await;

    let event_stream = stream::unfold(subscription.rx, |mut rx| async move {
        rx.recv().await.map(|msg| {
            let event_type = format!("{:?}", msg.event_type).to_lowercase();
            let data = serde_json::to_string(&msg).unwrap_or_default();
            (Ok::<Event, Infallible>(Event::default().event(event_type).data(data)), rx)
        })
    });

    Ok(Sse::new(event_stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(15))))
}
