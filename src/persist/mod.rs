//! Persistence Worker Pool (design notes §4.4): batched, bounded-queue
//! writeback of dirty cache entries to Postgres.
//!
//! Grounded on `sessions/journal.rs`'s mpsc-channel-plus-background-writer
//! pattern (bounded channel feeding a task that drains and writes), and on
//! the `a29afb42…retention.rs` ticker shape for the batch-tick scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::cache::Manager;
use crate::db::models::TrafficHistoryRow;
use crate::db::repo;
use crate::endpoint::types::ControlAction;
use crate::util::CatchUnwindExt;

/// One unit of persistence work (design notes §4.3 "enqueue a persistence
/// request whose kind depends on event type").
#[derive(Debug, Clone)]
pub enum PersistRequest {
    /// `create`/`initial` is a no-op here — the SSE service already ran the
    /// inline insert (design notes §4.4); kept as a variant so the worker
    /// dispatch table stays exhaustive and symmetrical with `Delete`.
    TunnelCreateNoop,
    TunnelDelete { endpoint_id: i64, instance_id: String },
    EndpointStateChange { endpoint_id: i64, status: crate::cache::EndpointStatus },
    OperationLog {
        tunnel_pk: i64,
        action: ControlAction,
        status: &'static str,
        message: String,
    },
}

impl PersistRequest {
    /// Critical requests must not be dropped on queue overflow (design
    /// notes §4.3); `TrafficDelta` is handled out-of-band by the batch
    /// tick, not through this queue, so every variant here is critical.
    fn is_critical(&self) -> bool {
        true
    }
}

/// Counters surfaced on periodic summary logs (design notes' supplemented
/// behavior: `persist_dropped_traffic_delta`, `persist_queue_depth`).
#[derive(Default)]
pub struct PersistMetrics {
    pub dropped_traffic_delta: AtomicU64,
    pub queue_depth: AtomicU64,
}

/// Bounded queue plus N consuming workers.
pub struct Pool {
    tx: mpsc::Sender<PersistRequest>,
    metrics: Arc<PersistMetrics>,
}

impl Pool {
    /// Spawns `workers` consumer tasks draining a channel of `queue_size`
    /// capacity. Each worker is wrapped in its own panic-recovery loop
    /// (design notes §4.4: "a worker that panics is replaced by its
    /// supervisor").
    pub fn spawn(pool: PgPool, workers: usize, queue_size: usize) -> (Self, Vec<tokio::task::JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let metrics = Arc::new(PersistMetrics::default());

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let rx = rx.clone();
            let pool = pool.clone();
            let metrics = metrics.clone();
            handles.push(tokio::spawn(worker_supervisor(worker_id, rx, pool, metrics)));
        }

        (Self { tx, metrics }, handles)
    }

    /// Enqueues a request. Critical requests use a bounded spin (design
    /// notes §4.3 "bounded spin, then logs and drops, never deadlocks");
    /// non-critical requests (traffic deltas, handled here only in case a
    /// future caller routes one through this queue) drop immediately on a
    /// full channel.
    pub async fn enqueue(&self, request: PersistRequest) {
        self.metrics.queue_depth.store(self.tx.capacity() as u64, Ordering::Relaxed);
        if !request.is_critical() {
            if self.tx.try_send(request).is_err() {
                self.metrics.dropped_traffic_delta.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let mut attempt = request;
        for _ in 0..5 {
            match self.tx.try_send(attempt) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(req)) => {
                    attempt = req;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
        warn!("persist queue full after bounded spin, dropping critical request");
    }

    pub fn metrics(&self) -> Arc<PersistMetrics> {
        self.metrics.clone()
    }

    /// Drains the queue with a deadline, for graceful shutdown (design
    /// notes §5: "the Persistence Pool drains the queue (bounded by a 10s
    /// deadline) then exits"). Closing the sender lets workers observe
    /// channel closure once drained and return.
    pub async fn drain(self, deadline: Duration) {
        drop(self.tx);
        tokio::time::sleep(deadline.min(Duration::from_secs(10))).await;
    }
}

async fn worker_supervisor(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PersistRequest>>>,
    pool: PgPool,
    metrics: Arc<PersistMetrics>,
) {
    loop {
        let result = worker_loop(worker_id, rx.clone(), pool.clone(), metrics.clone()).await;
        match result {
            WorkerExit::ChannelClosed => return,
            WorkerExit::Panicked => {
                error!(worker_id, "persist worker panicked, respawning");
                continue;
            }
        }
    }
}

enum WorkerExit {
    ChannelClosed,
    Panicked,
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PersistRequest>>>,
    pool: PgPool,
    metrics: Arc<PersistMetrics>,
) -> WorkerExit {
    loop {
        let request = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(request) = request else {
            return WorkerExit::ChannelClosed;
        };
        metrics.queue_depth.store(0, Ordering::Relaxed);

        let outcome = std::panic::AssertUnwindSafe(dispatch(&pool, request))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            error!(worker_id, "persist dispatch panicked");
            return WorkerExit::Panicked;
        }
    }
}

async fn dispatch(pool: &PgPool, request: PersistRequest) {
    let now = Utc::now();
    let result: Result<(), crate::error::CoreError> = async {
        match request {
            PersistRequest::TunnelCreateNoop => Ok(()),
            PersistRequest::TunnelDelete { endpoint_id, instance_id } => {
                repo::delete_tunnel(pool, endpoint_id, &instance_id).await
            }
            PersistRequest::EndpointStateChange { endpoint_id, status } => {
                repo::update_endpoint_status(pool, endpoint_id, status.as_db_str(), now).await
            }
            PersistRequest::OperationLog { tunnel_pk, action, status, message } => {
                sqlx::query(
                    "INSERT INTO tunnel_operation_logs (tunnel_id, action, status, message, created_at) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(tunnel_pk)
                .bind(action.as_str())
                .bind(status)
                .bind(message)
                .bind(now)
                .execute(pool)
                .await
                .map(|_| ())
                .map_err(crate::error::CoreError::Database)
            }
        }
    }
    .await;

    if let Err(e) = result {
        // No retry — the next batch tick or event carries fresh absolute
        // values (design notes §4.4 failure semantics).
        error!(error = %e, "persist worker request failed, not retrying");
    }
}

/// Batch-tick scheduler (design notes §4.4): independently scans all
/// endpoints for accumulated traffic deltas and flushes them.
pub async fn spawn_batch_ticker(
    pool: PgPool,
    cache: Arc<Manager>,
    tick: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            for endpoint_id in cache.all_endpoint_ids().await {
                flush_endpoint_deltas(&pool, &cache, endpoint_id).await;
            }
        }
    })
}

async fn flush_endpoint_deltas(pool: &PgPool, cache: &Manager, endpoint_id: i64) {
    let deltas = cache.take_endpoint_deltas(endpoint_id).await;
    for (instance_id, delta, current) in deltas {
        let now = Utc::now();
        let history = TrafficHistoryRow {
            id: 0,
            endpoint_id,
            instance_id: instance_id.clone(),
            record_time: now,
            cum_tcp_in: current[0] as i64,
            cum_tcp_out: current[1] as i64,
            cum_udp_in: current[2] as i64,
            cum_udp_out: current[3] as i64,
            delta_tcp_in: delta[0] as i64,
            delta_tcp_out: delta[1] as i64,
            delta_udp_in: delta[2] as i64,
            delta_udp_out: delta[3] as i64,
        };
        if let Err(e) = repo::insert_traffic_history(pool, &history).await {
            error!(endpoint_id, instance_id = %instance_id, error = %e, "failed to append traffic history");
            continue;
        }

        let snapshot = cache.tunnel_snapshot(endpoint_id, &instance_id).await;
        let (pool_gauge, ping) = snapshot.map_or((0, 0), |s| (s.pool, s.ping));
        if let Err(e) = repo::update_tunnel_counters(
            pool,
            endpoint_id,
            &instance_id,
            current[0] as i64,
            current[1] as i64,
            current[2] as i64,
            current[3] as i64,
            pool_gauge,
            ping,
            now,
        )
        .await
        {
            error!(endpoint_id, instance_id = %instance_id, error = %e, "failed to write tunnel counters");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_queued_request_is_critical() {
        assert!(PersistRequest::TunnelCreateNoop.is_critical());
        assert!(PersistRequest::TunnelDelete { endpoint_id: 1, instance_id: "t1".into() }.is_critical());
    }
}
