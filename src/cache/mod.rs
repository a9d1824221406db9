//! Telemetry Cache — authoritative in-memory projection of the live fleet
//! (design notes §4.2).
//!
//! Structure mirrors the teacher's `AppState`/`TunnelStats` split: atomics
//! and plain fields for hot-path reads, `RwLock`/`Mutex` only where a
//! multi-field update must be atomic (snapshot read-and-zero, tunnel map
//! mutation). Every `get_*` returns an owned snapshot — never a live
//! reference — so callers outside the cache can't alias internal state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::warn;

use crate::db::models::{EndpointRow, TunnelRow};
use crate::db::repo;
use crate::error::{CoreError, CoreResult};

/// Snapshot copy of an endpoint's identity + live status, safe to hand to
/// callers outside the cache.
#[derive(Debug, Clone)]
pub struct EndpointSnapshot {
    pub id: i64,
    pub url: String,
    pub api_path: String,
    pub api_key: String,
    pub name: String,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub ver: Option<String>,
    pub tls: bool,
    pub status: EndpointStatus,
    pub last_event_time: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Online,
    Offline,
    Fail,
    Disconnect,
}

impl EndpointStatus {
    #[must_use]
    pub fn as_db_str(self) -> &'static str {
        match self {
            EndpointStatus::Online => "ONLINE",
            EndpointStatus::Offline => "OFFLINE",
            EndpointStatus::Fail => "FAIL",
            EndpointStatus::Disconnect => "DISCONNECT",
        }
    }

    #[must_use]
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "ONLINE" => EndpointStatus::Online,
            "FAIL" => EndpointStatus::Fail,
            "DISCONNECT" => EndpointStatus::Disconnect,
            _ => EndpointStatus::Offline,
        }
    }
}

/// Snapshot copy of one tunnel's volatile state.
#[derive(Debug, Clone)]
pub struct TunnelSnapshot {
    pub tunnel_pk: i64,
    pub endpoint_id: i64,
    pub instance_id: String,
    pub name: Option<String>,
    pub mode: String,
    pub status: String,
    pub url: String,
    pub tcp_rx: u64,
    pub tcp_tx: u64,
    pub udp_rx: u64,
    pub udp_tx: u64,
    pub pool: i32,
    pub ping: i32,
    pub tcps: i32,
    pub udps: i32,
    pub restart: bool,
    pub last_event_time: Instant,
    pub updated_at: DateTime<Utc>,
}

/// Per-endpoint delta accumulator (design notes §3 TrafficSnapshot).
/// Ephemeral — never persisted directly; the Persistence Worker Pool reads
/// and zeros `delta_*` under the endpoint write lock.
#[derive(Debug, Clone, Default)]
pub struct TrafficSnapshot {
    pub last_tcp_rx: u64,
    pub last_tcp_tx: u64,
    pub last_udp_rx: u64,
    pub last_udp_tx: u64,
    pub delta_tcp_rx: u64,
    pub delta_tcp_tx: u64,
    pub delta_udp_rx: u64,
    pub delta_udp_tx: u64,
    pub snapshot_time: Option<Instant>,
}

impl TrafficSnapshot {
    /// Resets the baseline to `current` with deltas zeroed — used by
    /// `initial` events (baseline set) and idempotent re-application of the
    /// same `initial` (design notes §8 round-trip property).
    fn set_baseline(&mut self, tcp_rx: u64, tcp_tx: u64, udp_rx: u64, udp_tx: u64) {
        self.last_tcp_rx = tcp_rx;
        self.last_tcp_tx = tcp_tx;
        self.last_udp_rx = udp_rx;
        self.last_udp_tx = udp_tx;
        self.delta_tcp_rx = 0;
        self.delta_tcp_tx = 0;
        self.delta_udp_rx = 0;
        self.delta_udp_tx = 0;
    }

    /// The counter-delta algorithm from design notes §4.2: accept a reset
    /// (`current < last`) as a fresh delta rather than going negative, then
    /// accumulate. Returns the per-call delta for each counter, which the
    /// Aggregator also wants for its rate calculations.
    fn apply_update(&mut self, tcp_rx: u64, tcp_tx: u64, udp_rx: u64, udp_tx: u64) -> [u64; 4] {
        let d_tcp_rx = delta_or_reset(self.last_tcp_rx, tcp_rx);
        let d_tcp_tx = delta_or_reset(self.last_tcp_tx, tcp_tx);
        let d_udp_rx = delta_or_reset(self.last_udp_rx, udp_rx);
        let d_udp_tx = delta_or_reset(self.last_udp_tx, udp_tx);

        self.delta_tcp_rx += d_tcp_rx;
        self.delta_tcp_tx += d_tcp_tx;
        self.delta_udp_rx += d_udp_rx;
        self.delta_udp_tx += d_udp_tx;

        self.last_tcp_rx = tcp_rx;
        self.last_tcp_tx = tcp_tx;
        self.last_udp_rx = udp_rx;
        self.last_udp_tx = udp_tx;

        [d_tcp_rx, d_tcp_tx, d_udp_rx, d_udp_tx]
    }

    /// Reads and zeros the accumulated deltas atomically (caller must hold
    /// the endpoint write lock across this call — see design notes §5's
    /// "hardest concurrency point").
    fn take_deltas(&mut self) -> [u64; 4] {
        let out = [
            self.delta_tcp_rx,
            self.delta_tcp_tx,
            self.delta_udp_rx,
            self.delta_udp_tx,
        ];
        self.delta_tcp_rx = 0;
        self.delta_tcp_tx = 0;
        self.delta_udp_rx = 0;
        self.delta_udp_tx = 0;
        self.snapshot_time = Some(Instant::now());
        out
    }
}

/// `d = current − last`, clamped to `current` on reset (`d < 0`). Counters
/// are modeled as `u64`; the comparison is explicit rather than relying on
/// wrapping subtraction so the reset case reads the same as design notes
/// §4.2 step 2.
fn delta_or_reset(last: u64, current: u64) -> u64 {
    if current < last {
        current
    } else {
        current - last
    }
}

/// Live per-tunnel state, the in-memory mirror of `TunnelRow`'s volatile
/// fields plus cache-only bookkeeping.
#[derive(Debug, Clone)]
pub struct TunnelState {
    pub tunnel_pk: i64,
    pub instance_id: String,
    pub name: Option<String>,
    pub mode: String,
    pub status: String,
    pub url: String,
    pub pool: i32,
    pub ping: i32,
    pub tcps: i32,
    pub udps: i32,
    pub restart: bool,
    pub last_event_time: Instant,
    pub last_update_time: Instant,
    pub updated_at: DateTime<Utc>,
}

/// Per-endpoint live state (design notes §4.2 `EndpointState`).
pub struct EndpointState {
    pub status: EndpointStatus,
    pub last_event_time: Option<Instant>,
    pub connection_up: bool,
    pub tunnels: HashMap<String, TunnelState>,
    pub traffic_snapshot: HashMap<String, TrafficSnapshot>,
    pub dirty: bool,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            status: EndpointStatus::Offline,
            last_event_time: None,
            connection_up: false,
            tunnels: HashMap::new(),
            traffic_snapshot: HashMap::new(),
            dirty: false,
        }
    }
}

/// `EndpointShared` (design notes §4.2): host identity plus the live state,
/// guarded by its own read-write lock so one endpoint's mutations never
/// block another's readers.
pub struct EndpointShared {
    pub host: EndpointHost,
    pub state: RwLock<EndpointState>,
}

/// Immutable-for-the-process-lifetime identity fields (host/credentials
/// don't change without an endpoint CRUD op, out of scope here).
#[derive(Debug, Clone)]
pub struct EndpointHost {
    pub id: i64,
    pub url: String,
    pub api_path: String,
    pub api_key: String,
    pub name: String,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub ver: Option<String>,
    pub tls: bool,
}

/// `Manager` (design notes §4.2): process-wide map of all endpoints.
pub struct Manager {
    endpoints: RwLock<HashMap<i64, Arc<EndpointShared>>>,
    instance_index: RwLock<HashMap<(i64, String), i64>>,
    lazy_reloads: AtomicU64,
}

impl Manager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            instance_index: RwLock::new(HashMap::new()),
            lazy_reloads: AtomicU64::new(0),
        }
    }

    /// Count of one-shot lazy reloads triggered by a cache miss on event
    /// (design notes §4.2/§7), surfaced on the periodic summary log.
    #[must_use]
    pub fn lazy_reload_count(&self) -> u64 {
        self.lazy_reloads.load(Ordering::Relaxed)
    }

    /// Populates endpoints and their tunnels from the database, initializing
    /// each `trafficSnapshot.last*` to the persisted cumulative counters
    /// with deltas at zero (design notes §4.2 `loadFromDB`).
    pub async fn load_from_db(&self, pool: &sqlx::PgPool) -> CoreResult<()> {
        let endpoint_rows = repo::load_endpoints(pool).await?;
        let tunnel_rows = repo::load_tunnels(pool).await?;

        let mut by_endpoint: HashMap<i64, Vec<TunnelRow>> = HashMap::new();
        for t in tunnel_rows {
            by_endpoint.entry(t.endpoint_id).or_default().push(t);
        }

        let mut endpoints = self.endpoints.write().await;
        let mut index = self.instance_index.write().await;
        for e in endpoint_rows {
            let shared = self.build_endpoint_shared(&e, by_endpoint.remove(&e.id).unwrap_or_default(), &mut index);
            endpoints.insert(e.id, Arc::new(shared));
        }
        Ok(())
    }

    fn build_endpoint_shared(
        &self,
        e: &EndpointRow,
        tunnels: Vec<TunnelRow>,
        index: &mut HashMap<(i64, String), i64>,
    ) -> EndpointShared {
        let mut state = EndpointState::new();
        state.status = EndpointStatus::from_db_str(&e.status);
        for t in tunnels {
            index.insert((e.id, t.instance_id.clone()), t.id);
            let mut snapshot = TrafficSnapshot::default();
            snapshot.set_baseline(
                t.tcp_rx.max(0) as u64,
                t.tcp_tx.max(0) as u64,
                t.udp_rx.max(0) as u64,
                t.udp_tx.max(0) as u64,
            );
            state.traffic_snapshot.insert(t.instance_id.clone(), snapshot);
            state.tunnels.insert(
                t.instance_id.clone(),
                TunnelState {
                    tunnel_pk: t.id,
                    instance_id: t.instance_id,
                    name: t.name,
                    mode: t.mode,
                    status: t.status,
                    url: t.url,
                    pool: t.pool,
                    ping: t.ping,
                    tcps: t.tcps,
                    udps: t.udps,
                    restart: t.restart,
                    last_event_time: Instant::now(),
                    last_update_time: Instant::now(),
                    updated_at: t.updated_at,
                },
            );
        }
        EndpointShared {
            host: EndpointHost {
                id: e.id,
                url: e.url.clone(),
                api_path: e.api_path.clone(),
                api_key: e.api_key.clone(),
                name: e.name.clone(),
                os: e.os.clone(),
                arch: e.arch.clone(),
                ver: e.ver.clone(),
                tls: e.tls,
            },
            state: RwLock::new(state),
        }
    }

    /// Registers a newly-loaded endpoint (e.g. added by the out-of-scope
    /// CRUD surface) without a full reload.
    pub async fn insert_endpoint(&self, e: EndpointRow) {
        let mut index = self.instance_index.write().await;
        let shared = self.build_endpoint_shared(&e, Vec::new(), &mut index);
        self.endpoints.write().await.insert(e.id, Arc::new(shared));
    }

    async fn get_shared(&self, endpoint_id: i64) -> Option<Arc<EndpointShared>> {
        self.endpoints.read().await.get(&endpoint_id).cloned()
    }

    /// Lazily reloads one endpoint from the database when an event arrives
    /// for an endpoint missing from the cache (design notes §4.2 failure
    /// semantics, §7 "Cache miss on event").
    async fn lazy_reload(&self, pool: &sqlx::PgPool, endpoint_id: i64) -> CoreResult<Arc<EndpointShared>> {
        let endpoint_rows = repo::load_endpoints(pool).await?;
        let Some(e) = endpoint_rows.into_iter().find(|e| e.id == endpoint_id) else {
            return Err(CoreError::EndpointNotFound(endpoint_id.to_string()));
        };
        let tunnel_rows = repo::load_tunnels(pool)
            .await?
            .into_iter()
            .filter(|t| t.endpoint_id == endpoint_id)
            .collect();
        let mut index = self.instance_index.write().await;
        let shared = Arc::new(self.build_endpoint_shared(&e, tunnel_rows, &mut index));
        drop(index);
        self.endpoints.write().await.insert(endpoint_id, shared.clone());
        self.lazy_reloads.fetch_add(1, Ordering::Relaxed);
        Ok(shared)
    }

    /// Resolves an endpoint for event processing, attempting the one-shot
    /// lazy reload on cache miss.
    pub async fn get_or_reload(
        &self,
        pool: &sqlx::PgPool,
        endpoint_id: i64,
    ) -> CoreResult<Arc<EndpointShared>> {
        if let Some(shared) = self.get_shared(endpoint_id).await {
            return Ok(shared);
        }
        match self.lazy_reload(pool, endpoint_id).await {
            Ok(shared) => Ok(shared),
            Err(e) => {
                warn!(endpoint_id, error = %e, "cache miss on event, lazy reload failed, dropping");
                Err(e)
            }
        }
    }

    pub async fn endpoint_snapshot(&self, endpoint_id: i64) -> Option<EndpointSnapshot> {
        let shared = self.get_shared(endpoint_id).await?;
        let state = shared.state.read().await;
        Some(EndpointSnapshot {
            id: shared.host.id,
            url: shared.host.url.clone(),
            api_path: shared.host.api_path.clone(),
            api_key: shared.host.api_key.clone(),
            name: shared.host.name.clone(),
            os: shared.host.os.clone(),
            arch: shared.host.arch.clone(),
            ver: shared.host.ver.clone(),
            tls: shared.host.tls,
            status: state.status,
            last_event_time: state.last_event_time,
        })
    }

    pub async fn all_endpoint_ids(&self) -> Vec<i64> {
        self.endpoints.read().await.keys().copied().collect()
    }

    pub async fn tunnel_snapshot(&self, endpoint_id: i64, instance_id: &str) -> Option<TunnelSnapshot> {
        let shared = self.get_shared(endpoint_id).await?;
        let state = shared.state.read().await;
        let t = state.tunnels.get(instance_id)?;
        let snap = state.traffic_snapshot.get(instance_id);
        Some(TunnelSnapshot {
            tunnel_pk: t.tunnel_pk,
            endpoint_id,
            instance_id: t.instance_id.clone(),
            name: t.name.clone(),
            mode: t.mode.clone(),
            status: t.status.clone(),
            url: t.url.clone(),
            tcp_rx: snap.map_or(0, |s| s.last_tcp_rx),
            tcp_tx: snap.map_or(0, |s| s.last_tcp_tx),
            udp_rx: snap.map_or(0, |s| s.last_udp_rx),
            udp_tx: snap.map_or(0, |s| s.last_udp_tx),
            pool: t.pool,
            ping: t.ping,
            tcps: t.tcps,
            udps: t.udps,
            restart: t.restart,
            last_event_time: t.last_event_time,
            updated_at: t.updated_at,
        })
    }

    /// Reads and zeros one endpoint's accumulated deltas for every tunnel,
    /// for the batch-tick persistence path (design notes §4.4). Returns
    /// `(instance_id, deltas, current_cumulatives)` for tunnels with a
    /// non-zero delta.
    pub async fn take_endpoint_deltas(
        &self,
        endpoint_id: i64,
    ) -> Vec<(String, [u64; 4], [u64; 4])> {
        let Some(shared) = self.get_shared(endpoint_id).await else {
            return Vec::new();
        };
        let mut state = shared.state.write().await;
        let mut out = Vec::new();
        for (instance_id, snapshot) in &mut state.traffic_snapshot {
            if snapshot.delta_tcp_rx == 0
                && snapshot.delta_tcp_tx == 0
                && snapshot.delta_udp_rx == 0
                && snapshot.delta_udp_tx == 0
            {
                continue;
            }
            let current = [
                snapshot.last_tcp_rx,
                snapshot.last_tcp_tx,
                snapshot.last_udp_rx,
                snapshot.last_udp_tx,
            ];
            let deltas = snapshot.take_deltas();
            out.push((instance_id.clone(), deltas, current));
        }
        state.dirty = false;
        out
    }

    pub async fn tunnel_pk(&self, endpoint_id: i64, instance_id: &str) -> Option<i64> {
        self.instance_index
            .read()
            .await
            .get(&(endpoint_id, instance_id.to_string()))
            .copied()
    }

    // -- event handlers (design notes §4.2 event handling state machine) --

    /// `initial` — upsert tunnel, set snapshot baselines for all reported
    /// counters, mark connection up. Idempotent: re-applying the same
    /// `initial` resets the baseline to the same values and zeros deltas
    /// (design notes §8).
    pub async fn apply_initial(
        &self,
        endpoint_id: i64,
        instance_id: &str,
        tunnel_pk: i64,
        mode: &str,
        url: &str,
        status: &str,
        tcp_rx: u64,
        tcp_tx: u64,
        udp_rx: u64,
        udp_tx: u64,
    ) -> CoreResult<()> {
        let shared = self
            .get_shared(endpoint_id)
            .await
            .ok_or_else(|| CoreError::EndpointNotFound(endpoint_id.to_string()))?;
        let mut state = shared.state.write().await;
        let now = Instant::now();
        state
            .traffic_snapshot
            .entry(instance_id.to_string())
            .or_default()
            .set_baseline(tcp_rx, tcp_tx, udp_rx, udp_tx);
        state.tunnels.insert(
            instance_id.to_string(),
            TunnelState {
                tunnel_pk,
                instance_id: instance_id.to_string(),
                name: None,
                mode: mode.to_string(),
                status: status.to_string(),
                url: url.to_string(),
                pool: 0,
                ping: 0,
                tcps: 0,
                udps: 0,
                restart: false,
                last_event_time: now,
                last_update_time: now,
                updated_at: Utc::now(),
            },
        );
        state.connection_up = true;
        state.status = EndpointStatus::Online;
        state.last_event_time = Some(now);
        drop(state);
        self.instance_index
            .write()
            .await
            .insert((endpoint_id, instance_id.to_string()), tunnel_pk);
        Ok(())
    }

    /// `create` — insert tunnel in cache.
    pub async fn apply_create(
        &self,
        endpoint_id: i64,
        instance_id: &str,
        tunnel_pk: i64,
        mode: &str,
        url: &str,
    ) -> CoreResult<()> {
        let shared = self
            .get_shared(endpoint_id)
            .await
            .ok_or_else(|| CoreError::EndpointNotFound(endpoint_id.to_string()))?;
        let mut state = shared.state.write().await;
        let now = Instant::now();
        state.traffic_snapshot.entry(instance_id.to_string()).or_default();
        state.tunnels.insert(
            instance_id.to_string(),
            TunnelState {
                tunnel_pk,
                instance_id: instance_id.to_string(),
                name: None,
                mode: mode.to_string(),
                status: "running".to_string(),
                url: url.to_string(),
                pool: 0,
                ping: 0,
                tcps: 0,
                udps: 0,
                restart: false,
                last_event_time: now,
                last_update_time: now,
                updated_at: Utc::now(),
            },
        );
        state.dirty = true;
        state.status = EndpointStatus::Online;
        state.last_event_time = Some(now);
        drop(state);
        self.instance_index
            .write()
            .await
            .insert((endpoint_id, instance_id.to_string()), tunnel_pk);
        Ok(())
    }

    /// `update` — overwrite volatile fields, run the counter-delta math,
    /// mark dirty. Returns the per-call delta for the Aggregator.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_update(
        &self,
        endpoint_id: i64,
        instance_id: &str,
        status: Option<&str>,
        pool_gauge: Option<i32>,
        ping: Option<i32>,
        tcps: Option<i32>,
        udps: Option<i32>,
        tcp_rx: Option<u64>,
        tcp_tx: Option<u64>,
        udp_rx: Option<u64>,
        udp_tx: Option<u64>,
    ) -> CoreResult<[u64; 4]> {
        let shared = self
            .get_shared(endpoint_id)
            .await
            .ok_or_else(|| CoreError::EndpointNotFound(endpoint_id.to_string()))?;
        let mut state = shared.state.write().await;
        let now = Instant::now();

        let snapshot = state
            .traffic_snapshot
            .entry(instance_id.to_string())
            .or_default();
        let current_rx_tcp = tcp_rx.unwrap_or(snapshot.last_tcp_rx);
        let current_tx_tcp = tcp_tx.unwrap_or(snapshot.last_tcp_tx);
        let current_rx_udp = udp_rx.unwrap_or(snapshot.last_udp_rx);
        let current_tx_udp = udp_tx.unwrap_or(snapshot.last_udp_tx);
        let delta = snapshot.apply_update(current_rx_tcp, current_tx_tcp, current_rx_udp, current_tx_udp);

        let found = if let Some(t) = state.tunnels.get_mut(instance_id) {
            if let Some(s) = status {
                t.status = s.to_string();
            }
            if let Some(p) = pool_gauge {
                t.pool = p;
            }
            if let Some(p) = ping {
                t.ping = p;
            }
            if let Some(p) = tcps {
                t.tcps = p;
            }
            if let Some(p) = udps {
                t.udps = p;
            }
            t.last_event_time = now;
            t.last_update_time = now;
            t.updated_at = Utc::now();
            true
        } else {
            false
        };

        if !found {
            return Err(CoreError::TunnelNotFound {
                endpoint_id: endpoint_id.to_string(),
                instance_id: instance_id.to_string(),
            });
        }

        state.dirty = true;
        state.status = EndpointStatus::Online;
        state.last_event_time = Some(now);
        Ok(delta)
    }

    /// `delete` — remove tunnel from cache *before* the caller issues the
    /// delete persist request (design notes §5 invariant: any in-flight
    /// `TrafficDelta` that already dequeued proceeds and no-ops if the row
    /// is gone).
    pub async fn apply_delete(&self, endpoint_id: i64, instance_id: &str) -> CoreResult<()> {
        let shared = self
            .get_shared(endpoint_id)
            .await
            .ok_or_else(|| CoreError::EndpointNotFound(endpoint_id.to_string()))?;
        let mut state = shared.state.write().await;
        state.tunnels.remove(instance_id);
        state.traffic_snapshot.remove(instance_id);
        state.dirty = true;
        state.status = EndpointStatus::Online;
        state.last_event_time = Some(Instant::now());
        drop(state);
        self.instance_index
            .write()
            .await
            .remove(&(endpoint_id, instance_id.to_string()));
        Ok(())
    }

    /// `shutdown` — every tunnel's status becomes `stopped`, connection
    /// marked down, endpoint status OFFLINE.
    pub async fn apply_shutdown(&self, endpoint_id: i64) -> CoreResult<()> {
        let shared = self
            .get_shared(endpoint_id)
            .await
            .ok_or_else(|| CoreError::EndpointNotFound(endpoint_id.to_string()))?;
        let mut state = shared.state.write().await;
        for t in state.tunnels.values_mut() {
            t.status = "stopped".to_string();
        }
        state.connection_up = false;
        state.status = EndpointStatus::Offline;
        state.last_event_time = Some(Instant::now());
        state.dirty = true;
        Ok(())
    }

    /// `log` — touch `last_event_time` only.
    pub async fn apply_log(&self, endpoint_id: i64) -> CoreResult<()> {
        let shared = self
            .get_shared(endpoint_id)
            .await
            .ok_or_else(|| CoreError::EndpointNotFound(endpoint_id.to_string()))?;
        let mut state = shared.state.write().await;
        state.last_event_time = Some(Instant::now());
        Ok(())
    }

    pub async fn set_endpoint_status(&self, endpoint_id: i64, status: EndpointStatus) {
        if let Some(shared) = self.get_shared(endpoint_id).await {
            let mut state = shared.state.write().await;
            state.status = status;
            state.dirty = true;
        }
    }

    /// Resync (design notes §4.3): after reconnect, tunnels not named by
    /// any `initial` within `live_instance_ids` during the bounded window
    /// are marked `offline`, never deleted.
    pub async fn mark_absent_offline(&self, endpoint_id: i64, live_instance_ids: &[String]) {
        let Some(shared) = self.get_shared(endpoint_id).await else {
            return;
        };
        let mut state = shared.state.write().await;
        let live: std::collections::HashSet<&String> = live_instance_ids.iter().collect();
        for (id, t) in &mut state.tunnels {
            if !live.contains(id) {
                t.status = "offline".to_string();
            }
        }
        state.dirty = true;
    }

    /// All instance ids currently tracked for an endpoint — used by resync
    /// bookkeeping to compute the stale set.
    pub async fn instance_ids(&self, endpoint_id: i64) -> Vec<String> {
        let Some(shared) = self.get_shared(endpoint_id).await else {
            return Vec::new();
        };
        shared.state.read().await.tunnels.keys().cloned().collect()
    }

    /// Resolves the endpoint owning an instance id, for UI surfaces that
    /// only name the instance (e.g. `GET /api/sse/tunnel/{instanceId}`).
    /// Scans the index rather than maintaining a reverse map — called once
    /// per subscription, not on the ingest hot path.
    pub async fn find_endpoint_for_instance(&self, instance_id: &str) -> Option<i64> {
        self.instance_index
            .read()
            .await
            .keys()
            .find(|(_, iid)| iid == instance_id)
            .map(|(endpoint_id, _)| *endpoint_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_accumulates_forward_progress() {
        let mut snapshot = TrafficSnapshot::default();
        snapshot.set_baseline(1000, 2000, 0, 0);
        let d = snapshot.apply_update(1500, 2000, 50, 0);
        assert_eq!(d, [500, 0, 50, 0]);
        assert_eq!(snapshot.delta_tcp_rx, 500);
        assert_eq!(snapshot.delta_udp_rx, 50);
    }

    #[test]
    fn delta_clamps_on_counter_reset() {
        let mut snapshot = TrafficSnapshot::default();
        snapshot.set_baseline(1500, 2000, 50, 0);
        snapshot.delta_tcp_rx = 500; // pretend a previous delta already accrued
        let d = snapshot.apply_update(100, 0, 0, 0);
        // Reset: d := current, not current - last (which would be negative)
        assert_eq!(d, [100, 0, 0, 0]);
        assert_eq!(snapshot.delta_tcp_rx, 600);
    }

    #[test]
    fn replaying_same_update_only_adds_delta_once() {
        let mut snapshot = TrafficSnapshot::default();
        snapshot.set_baseline(1000, 2000, 0, 0);
        let d1 = snapshot.apply_update(1500, 2000, 50, 0);
        assert_eq!(d1, [500, 0, 50, 0]);
        // Replaying the same absolute values again: d = current - last = 0
        let d2 = snapshot.apply_update(1500, 2000, 50, 0);
        assert_eq!(d2, [0, 0, 0, 0]);
        assert_eq!(snapshot.delta_tcp_rx, 500);
    }

    #[test]
    fn take_deltas_reads_and_zeros() {
        let mut snapshot = TrafficSnapshot::default();
        snapshot.set_baseline(0, 0, 0, 0);
        snapshot.apply_update(500, 0, 0, 0);
        let taken = snapshot.take_deltas();
        assert_eq!(taken, [500, 0, 0, 0]);
        assert_eq!(snapshot.delta_tcp_rx, 0);
    }

    #[test]
    fn initial_after_reconnect_resets_baseline_without_changing_cumulative_semantics() {
        let mut snapshot = TrafficSnapshot::default();
        snapshot.set_baseline(1000, 2000, 0, 0);
        snapshot.apply_update(1500, 2000, 50, 0);
        // Reconnect sends the same initial again
        snapshot.set_baseline(1500, 2000, 50, 0);
        assert_eq!(snapshot.delta_tcp_rx, 0);
        assert_eq!(snapshot.last_tcp_rx, 1500);
    }

    #[tokio::test]
    async fn apply_update_on_missing_endpoint_is_an_error() {
        let manager = Manager::new();
        let result = manager
            .apply_update(1, "inst-1", None, None, None, None, None, None, None, None, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn mark_absent_offline_does_not_delete() {
        let manager = Manager::new();
        manager
            .insert_endpoint(EndpointRow {
                id: 1,
                url: "http://x".into(),
                api_path: "/api".into(),
                api_key: "k".into(),
                name: "e1".into(),
                os: None,
                arch: None,
                ver: None,
                tls: false,
                status: "ONLINE".into(),
                last_check: Utc::now(),
            })
            .await;
        manager
            .apply_initial(1, "t1", 1, "server", "tcp://:1", "running", 0, 0, 0, 0)
            .await
            .unwrap();
        manager
            .apply_initial(1, "t2", 2, "server", "tcp://:2", "running", 0, 0, 0, 0)
            .await
            .unwrap();
        // Reconnect only reports t1 as live
        manager.mark_absent_offline(1, &["t1".to_string()]).await;
        let t1 = manager.tunnel_snapshot(1, "t1").await.unwrap();
        let t2 = manager.tunnel_snapshot(1, "t2").await.unwrap();
        assert_eq!(t1.status, "running");
        assert_eq!(t2.status, "offline");
    }
}
