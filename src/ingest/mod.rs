//! SSE Ingest Pipeline (design notes §4.3): cache update → listener
//! notification → persistence request, off the reader hot path.
//!
//! The listener fan-out follows the design notes' re-architecture guidance
//! (§9: "per-event dispatch for listeners → small worker pool per listener
//! kind, bound fan-out concurrency"): each notification is spawned as its
//! own task behind a semaphore permit, wrapped in the same panic-catching
//! adapter the Persistence Worker Pool uses.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::aggregate::Aggregator;
use crate::cache::{EndpointStatus, Manager};
use crate::db::repo;
use crate::endpoint::types::{SseEvent, SseEventType};
use crate::error::CoreResult;
use crate::fanout::{FanoutEventType, FanoutMessage, Hub};
use crate::persist::{self, PersistRequest};
use crate::util::CatchUnwindExt;

/// Bound on concurrently-running listener notification tasks (design notes
/// §9's "small worker pool per listener kind", approximated here as one
/// shared pool sized generously since both listeners are cheap in-memory
/// writes plus an occasional DB upsert).
const LISTENER_CONCURRENCY: usize = 64;

pub struct Pipeline {
    pub cache: Arc<Manager>,
    pool: PgPool,
    aggregator: Arc<Aggregator>,
    fanout: Arc<Hub>,
    persist: Arc<persist::Pool>,
    invalid_frames: AtomicU64,
    listener_permits: Arc<Semaphore>,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        cache: Arc<Manager>,
        pool: PgPool,
        aggregator: Arc<Aggregator>,
        fanout: Arc<Hub>,
        persist: Arc<persist::Pool>,
    ) -> Self {
        Self {
            cache,
            pool,
            aggregator,
            fanout,
            persist,
            invalid_frames: AtomicU64::new(0),
            listener_permits: Arc::new(Semaphore::new(LISTENER_CONCURRENCY)),
        }
    }

    pub fn invalid_frame_count(&self) -> u64 {
        self.invalid_frames.load(Ordering::Relaxed)
    }

    /// Counts a frame dropped for invalid JSON or a missing `instanceId`
    /// (design notes §7: never surfaced as a connection error).
    pub fn note_invalid_frame(&self) {
        self.invalid_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Begins a resync window for one endpoint after a reconnect (design
    /// notes §4.3). The returned handle observes raw frames synchronously
    /// as they arrive; once `window` elapses, instances never reported by
    /// an `initial` are marked offline.
    pub async fn begin_resync(&self, endpoint_id: i64, window: Duration) -> ResyncHandle {
        let live_ids = Arc::new(StdMutex::new(HashSet::new()));
        let handle = ResyncHandle {
            live_ids: live_ids.clone(),
        };
        let cache = self.cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let ids: Vec<String> = live_ids.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect();
            cache.mark_absent_offline(endpoint_id, &ids).await;
        });
        handle
    }

    /// `processEvent` (design notes §4.3): cache update, fire-and-forget
    /// listener notification, persistence enqueue.
    pub async fn process_event(&self, endpoint_id: i64, event: SseEvent) {
        let instance_id = event.instance_id.clone();
        let result = match event.event_type {
            SseEventType::Initial | SseEventType::Create => self.handle_create_like(endpoint_id, &event).await,
            SseEventType::Update => self.handle_update(endpoint_id, &event).await,
            SseEventType::Delete => self.handle_delete(endpoint_id, &instance_id).await,
            SseEventType::Shutdown => self.handle_shutdown(endpoint_id).await,
            SseEventType::Log => self.handle_log(endpoint_id, &event).await,
        };
        if let Err(e) = result {
            warn!(endpoint_id, instance_id, error = %e, "dropping sse event after cache update failure");
        }
    }

    async fn handle_create_like(&self, endpoint_id: i64, event: &SseEvent) -> CoreResult<()> {
        let now = Utc::now();
        let mode = event.instance_type.clone().unwrap_or_else(|| "server".to_string());
        let status = event.status.clone().unwrap_or_else(|| "running".to_string());
        let url = event.url.clone().unwrap_or_default();
        let tunnel_pk = repo::insert_tunnel(
            &self.pool,
            endpoint_id,
            &event.instance_id,
            event.alias.as_deref(),
            &mode,
            &status,
            &url,
            now,
        )
        .await?;

        if event.event_type == SseEventType::Initial {
            self.cache
                .apply_initial(
                    endpoint_id,
                    &event.instance_id,
                    tunnel_pk,
                    &mode,
                    &url,
                    &status,
                    event.tcprx.unwrap_or(0).max(0) as u64,
                    event.tcptx.unwrap_or(0).max(0) as u64,
                    event.udprx.unwrap_or(0).max(0) as u64,
                    event.udptx.unwrap_or(0).max(0) as u64,
                )
                .await?;
        } else {
            self.cache
                .apply_create(endpoint_id, &event.instance_id, tunnel_pk, &mode, &url)
                .await?;
            self.enqueue_persist(PersistRequest::TunnelCreateNoop).await;
        }

        self.notify_listeners(endpoint_id, event, FanoutEventType::from(event.event_type));
        Ok(())
    }

    async fn handle_update(&self, endpoint_id: i64, event: &SseEvent) -> CoreResult<()> {
        let delta = self
            .cache
            .apply_update(
                endpoint_id,
                &event.instance_id,
                event.status.as_deref(),
                event.pool,
                event.ping,
                event.tcps,
                event.udps,
                event.tcprx.map(|v| v.max(0) as u64),
                event.tcptx.map(|v| v.max(0) as u64),
                event.udprx.map(|v| v.max(0) as u64),
                event.udptx.map(|v| v.max(0) as u64),
            )
            .await?;
        let _ = delta;

        if let Some(snapshot) = self.cache.tunnel_snapshot(endpoint_id, &event.instance_id).await {
            let current = [snapshot.tcp_rx, snapshot.tcp_tx, snapshot.udp_rx, snapshot.udp_tx];
            let aggregator = self.aggregator.clone();
            let endpoint_id_owned = endpoint_id;
            let instance_id = event.instance_id.clone();
            let ping = event.ping;
            let pool_gauge = event.pool;
            self.spawn_listener(async move {
                aggregator
                    .record_sample(endpoint_id_owned, &instance_id, ping, pool_gauge, current)
                    .await;
            });
        }

        self.notify_listeners(endpoint_id, event, FanoutEventType::Update);
        Ok(())
    }

    async fn handle_delete(&self, endpoint_id: i64, instance_id: &str) -> CoreResult<()> {
        self.cache.apply_delete(endpoint_id, instance_id).await?;
        self.fanout
            .publish(FanoutMessage {
                event_type: FanoutEventType::Delete,
                endpoint_id,
                instance_id: instance_id.to_string(),
                payload: serde_json::json!({}),
                ts: Utc::now(),
            })
            .await;
        self.persist
            .enqueue(PersistRequest::TunnelDelete {
                endpoint_id,
                instance_id: instance_id.to_string(),
            })
            .await;
        Ok(())
    }

    async fn handle_shutdown(&self, endpoint_id: i64) -> CoreResult<()> {
        self.cache.apply_shutdown(endpoint_id).await?;
        self.fanout
            .publish(FanoutMessage {
                event_type: FanoutEventType::Shutdown,
                endpoint_id,
                instance_id: String::new(),
                payload: serde_json::json!({}),
                ts: Utc::now(),
            })
            .await;
        self.persist
            .enqueue(PersistRequest::EndpointStateChange {
                endpoint_id,
                status: EndpointStatus::Offline,
            })
            .await;
        Ok(())
    }

    async fn handle_log(&self, endpoint_id: i64, event: &SseEvent) -> CoreResult<()> {
        self.cache.apply_log(endpoint_id).await?;
        let fields = serde_json::json!({ "message": event.message });
        if let Err(e) = repo::insert_raw_sse(
            &self.pool,
            endpoint_id,
            Some(event.instance_id.as_str()),
            Utc::now(),
            "log",
            &fields,
        )
        .await
        {
            warn!(endpoint_id, error = %e, "failed to archive log event");
        }
        self.fanout
            .publish(FanoutMessage {
                event_type: FanoutEventType::Log,
                endpoint_id,
                instance_id: event.instance_id.clone(),
                payload: fields,
                ts: Utc::now(),
            })
            .await;
        Ok(())
    }

    fn notify_listeners(&self, endpoint_id: i64, event: &SseEvent, kind: FanoutEventType) {
        let fanout = self.fanout.clone();
        let msg = FanoutMessage {
            event_type: kind,
            endpoint_id,
            instance_id: event.instance_id.clone(),
            payload: serde_json::json!({
                "status": event.status,
                "url": event.url,
                "pool": event.pool,
                "ping": event.ping,
            }),
            ts: Utc::now(),
        };
        self.spawn_listener(async move {
            fanout.publish(msg).await;
        });
    }

    async fn enqueue_persist(&self, request: PersistRequest) {
        self.persist.enqueue(request).await;
    }

    /// Spawns one listener notification behind a concurrency permit, panic
    /// isolated (design notes §7: "listener panic: contained by dispatcher,
    /// logged, does not affect other listeners or ingest").
    fn spawn_listener<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let permits = self.listener_permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let outcome = std::panic::AssertUnwindSafe(fut).catch_unwind().await;
            if outcome.is_err() {
                warn!("listener notification panicked, isolated by dispatcher");
            }
        });
    }
}

impl From<SseEventType> for FanoutEventType {
    fn from(value: SseEventType) -> Self {
        match value {
            SseEventType::Initial => FanoutEventType::Initial,
            SseEventType::Create => FanoutEventType::Create,
            SseEventType::Update => FanoutEventType::Update,
            SseEventType::Delete => FanoutEventType::Delete,
            SseEventType::Shutdown => FanoutEventType::Shutdown,
            SseEventType::Log => FanoutEventType::Log,
        }
    }
}

/// Handle returned by [`Pipeline::begin_resync`]; observes raw SSE frames
/// synchronously as they arrive on the reader task.
pub struct ResyncHandle {
    live_ids: Arc<StdMutex<HashSet<String>>>,
}

impl ResyncHandle {
    pub fn observe_raw(&self, raw: &str) {
        let Ok(event) = serde_json::from_str::<SseEvent>(raw) else {
            return;
        };
        if event.event_type == SseEventType::Initial {
            if let Ok(mut ids) = self.live_ids.lock() {
                ids.insert(event.instance_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_event_type_maps_one_to_one() {
        assert_eq!(FanoutEventType::from(SseEventType::Initial), FanoutEventType::Initial);
        assert_eq!(FanoutEventType::from(SseEventType::Shutdown), FanoutEventType::Shutdown);
    }

    #[test]
    fn resync_handle_only_tracks_initial_events() {
        let handle = ResyncHandle {
            live_ids: Arc::new(StdMutex::new(HashSet::new())),
        };
        handle.observe_raw(r#"{"type":"update","instanceId":"t1"}"#);
        handle.observe_raw(r#"{"type":"initial","instanceId":"t2"}"#);
        let ids = handle.live_ids.lock().unwrap();
        assert!(ids.contains("t2"));
        assert!(!ids.contains("t1"));
    }
}
