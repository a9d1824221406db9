//! HTTP route handlers.
//!
//! REST CRUD for endpoints/tunnels is out of scope here (design notes §4,
//! "REST under `/api/…` for CRUD and query (out of scope here)"). This
//! module wires only the telemetry core's own exposed surfaces: health,
//! one SSE relay, and two WebSocket gauge feeds.

pub mod health;
pub mod sse;
pub mod ws;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/api/sse/tunnel/{instance_id}", get(sse::tunnel_events))
        .route("/api/ws/tunnel-monitor", get(ws::tunnel_monitor))
        .route("/api/ws/system-monitor", get(ws::system_monitor))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
