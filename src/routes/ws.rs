//! WebSocket transport pushing live gauge snapshots to dashboard clients.
//!
//! Grounded on `ws/mod.rs`'s split-socket-plus-forwarding-task shape: the
//! outgoing half is funneled through an mpsc channel fed by a Fan-out Hub
//! subscription, the incoming half only answers `ping` (there is no
//! control-plane surface here, the wire protocols are out of scope per the
//! design notes).

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::fanout::{DerivedGauges, Filter};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct TunnelMonitorQuery {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
}

#[derive(Deserialize)]
pub struct SystemMonitorQuery {
    #[serde(rename = "endpointId")]
    pub endpoint_id: i64,
}

/// `GET /api/ws/tunnel-monitor?instanceId=…` — one tunnel's live gauges.
pub async fn tunnel_monitor(
    State(state): State<AppState>,
    Query(query): Query<TunnelMonitorQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(endpoint_id) = state.cache.find_endpoint_for_instance(&query.instance_id).await else {
        return (axum::http::StatusCode::NOT_FOUND, "unknown instance").into_response();
    };
    let filter = Filter::OneTunnel { endpoint_id, instance_id: query.instance_id };
    ws.on_upgrade(move |socket| push_gauges(socket, state, filter))
}

/// `GET /api/ws/system-monitor?endpointId=…` — every tunnel on one endpoint.
pub async fn system_monitor(
    State(state): State<AppState>,
    Query(query): Query<SystemMonitorQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let filter = Filter::SystemMonitor(query.endpoint_id);
    ws.on_upgrade(move |socket| push_gauges(socket, state, filter))
}

/// Shared push loop: forward fan-out messages as JSON frames, with each
/// update enriched with [`DerivedGauges`]. Answers client `ping` with
/// `pong`; any other client message is ignored (read-only surface).
async fn push_gauges(socket: WebSocket, state: AppState, filter: Filter) {
    let (mut sink, mut stream) = socket.split();
    let mut subscription = state.fanout.subscribe(filter).await;

    loop {
        tokio::select! {
            msg = subscription.rx.recv() => {
                let Some(msg) = msg else { break };
                let snapshot = state.cache.tunnel_snapshot(msg.endpoint_id, &msg.instance_id).await;
                let gauges = snapshot.map(|s| {
                    let used = (s.tcps.max(0) + s.udps.max(0)) as u64;
                    DerivedGauges::compute(s.tcp_rx, s.tcp_tx, s.udp_rx, s.udp_tx, used, s.pool.max(0) as u64)
                });
                let frame = json!({
                    "event": msg,
                    "gauges": gauges,
                });
                let text = serde_json::to_string(&frame).unwrap_or_default();
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text.trim() == r#"{"type":"ping"}"# || text.contains("\"ping\"") {
                            let _ = sink.send(Message::Text(r#"{"type":"pong"}"#.to_string().into())).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "ws read error, closing");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.fanout.unsubscribe(subscription.id).await;
}
