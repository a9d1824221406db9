//! Endpoint client — outbound SSE subscription to a remote tunnel daemon
//! (design notes §4.1).
//!
//! Spawned once per endpoint on startup. Maintains a persistent SSE stream
//! with exponential-backoff reconnect; the reconnect loop and error
//! classification follow the tunnel client's `connect_and_run` shape, the
//! transport itself is `reqwest-eventsource` (SSE, not a raw WebSocket).

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest_eventsource::{Event, EventSource};
use tracing::{error, info, warn};

use crate::cache::EndpointStatus;
use crate::config::SseConfig;
use crate::endpoint::types::SseEvent;
use crate::error::{CoreError, CoreResult};
use crate::ingest::Pipeline;

/// Per-call REST timeout (design notes §4.1: "every outbound REST call ...
/// carries its own 15s timeout").
const REST_TIMEOUT: Duration = Duration::from_secs(15);

/// One HTTP client bound to a single endpoint's base URL and credentials.
/// Built fresh per endpoint so self-signed management-plane certs
/// (design notes §4.1) don't leak into any other endpoint's trust config.
#[derive(Clone)]
pub struct EndpointHandle {
    http: reqwest::Client,
    base_url: String,
    api_path: String,
}

impl EndpointHandle {
    pub fn new(base_url: &str, api_path: &str, api_key: &str, accept_invalid_certs: bool) -> CoreResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-API-Key",
            HeaderValue::from_str(api_key).map_err(|_| CoreError::Config("invalid api key header value".into()))?,
        );
        // No ambient proxy inheritance — management-plane traffic to a
        // private fleet should never be routed through an HTTP_PROXY the
        // host happens to have set (design notes §4.1).
        let http = reqwest::Client::builder()
            .no_proxy()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .default_headers(headers)
            .timeout(REST_TIMEOUT)
            .build()
            .map_err(CoreError::Transport)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_path: api_path.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, self.api_path, path)
    }

}

/// Spawn the per-endpoint SSE reader task. Returns a `JoinHandle` the
/// caller supervises (design notes §4.1 panic-recovery: the caller wraps
/// this in its own respawn loop, mirroring the outer `spawn`/inner-loop
/// split of the tunnel client).
pub fn spawn(
    endpoint_id: i64,
    handle: EndpointHandle,
    pipeline: std::sync::Arc<Pipeline>,
    config: SseConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(sse_reader_loop(endpoint_id, handle, pipeline, config))
}

/// Outer reconnect loop: exponential backoff capped at
/// `config.reconnect_backoff_max_secs`, doubling on every transient
/// failure and resetting to 1s on a clean read (design notes §4.1).
async fn sse_reader_loop(
    endpoint_id: i64,
    handle: EndpointHandle,
    pipeline: std::sync::Arc<Pipeline>,
    config: SseConfig,
) {
    let mut delay = Duration::from_secs(1);
    let max_delay = config.reconnect_backoff_max();
    let mut first_connect = true;

    loop {
        pipeline
            .cache
            .set_endpoint_status(endpoint_id, EndpointStatus::Disconnect)
            .await;

        let outcome = run_one_connection(endpoint_id, &handle, &pipeline, &config, first_connect).await;
        first_connect = false;

        match outcome {
            Ok(()) => {
                info!(endpoint_id, "sse stream closed cleanly, reconnecting");
                delay = Duration::from_secs(1);
            }
            Err(ConnectError::Permanent(msg)) => {
                error!(endpoint_id, error = %msg, "endpoint client stopping: permanent error");
                pipeline
                    .cache
                    .set_endpoint_status(endpoint_id, EndpointStatus::Fail)
                    .await;
                return;
            }
            Err(ConnectError::Transient(msg)) => {
                warn!(endpoint_id, error = %msg, delay_secs = delay.as_secs(), "sse connection lost, retrying");
            }
        }

        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

enum ConnectError {
    Permanent(String),
    Transient(String),
}

/// One SSE connection attempt, read until the stream ends or errors.
///
/// On every connection *after* the first, this begins a resync window:
/// instances not re-announced by an `initial` event within
/// `config.resync_window_secs` are marked offline (never deleted — design
/// notes §4.3).
async fn run_one_connection(
    endpoint_id: i64,
    handle: &EndpointHandle,
    pipeline: &Pipeline,
    config: &SseConfig,
    first_connect: bool,
) -> Result<(), ConnectError> {
    let url = handle.url("/events");
    let req_builder = handle.http.get(&url);
    let mut source = EventSource::new(req_builder).map_err(|e| ConnectError::Permanent(e.to_string()))?;

    let resync_handle = if first_connect {
        None
    } else {
        Some(pipeline.begin_resync(endpoint_id, config.resync_window()).await)
    };

    loop {
        let next = tokio::time::timeout(config.read_idle(), source.next()).await;
        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(()),
            Err(_) => {
                return Err(ConnectError::Transient(format!(
                    "no data for {}s, idle timeout",
                    config.read_idle_secs
                )))
            }
        };

        match event {
            Ok(Event::Open) => {
                info!(endpoint_id, "sse connected");
            }
            Ok(Event::Message(msg)) => {
                if let Some(resync) = &resync_handle {
                    resync.observe_raw(&msg.data);
                }
                dispatch_frame(endpoint_id, pipeline, &msg.data).await;
            }
            Err(reqwest_eventsource::Error::StreamEnded) => return Ok(()),
            Err(reqwest_eventsource::Error::InvalidStatusCode(status, _)) if status.is_client_error() => {
                return Err(ConnectError::Permanent(format!("rejected with status {status}")));
            }
            Err(e) => return Err(ConnectError::Transient(e.to_string())),
        }
    }
}

/// Decode one SSE frame and hand it to the ingest pipeline. Invalid JSON
/// or a missing `instanceId` is dropped and counted, never propagated as a
/// connection error (design notes §7).
async fn dispatch_frame(endpoint_id: i64, pipeline: &Pipeline, raw: &str) {
    match serde_json::from_str::<SseEvent>(raw) {
        Ok(event) => pipeline.process_event(endpoint_id, event).await,
        Err(e) => {
            pipeline.note_invalid_frame();
            warn!(endpoint_id, error = %e, "dropping invalid sse frame");
        }
    }
}
