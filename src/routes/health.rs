//! Unauthenticated health-check endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /healthz` — liveness/readiness probe.
///
/// Reports uptime, endpoint/subscriber counts, queue depths, DB
/// reachability, and per-endpoint connection status so an external prober
/// can distinguish "up" from "up but falling behind".
pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let endpoint_ids = state.cache.all_endpoint_ids().await;
    let subscriber_count = state.fanout.subscriber_count().await;
    let metrics = state.persist.metrics();

    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();

    let mut endpoints = Vec::with_capacity(endpoint_ids.len());
    for id in &endpoint_ids {
        if let Some(snapshot) = state.cache.endpoint_snapshot(*id).await {
            endpoints.push(json!({
                "endpoint_id": id,
                "name": snapshot.name,
                "status": snapshot.status.as_db_str(),
            }));
        }
    }

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": endpoint_ids.len(),
        "endpoint_status": endpoints,
        "db_reachable": db_ok,
        "fanout_subscribers": subscriber_count,
        "fanout_dropped_subscribers": state.fanout.dropped_subscribers(),
        "persist_queue_depth": metrics.queue_depth.load(std::sync::atomic::Ordering::Relaxed),
        "persist_dropped_traffic_delta": metrics.dropped_traffic_delta.load(std::sync::atomic::Ordering::Relaxed),
        "sse_invalid_frames": state.pipeline.invalid_frame_count(),
    }))
}
