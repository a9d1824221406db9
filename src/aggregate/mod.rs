//! Metrics Aggregator (design notes §4.5): per-sample ping/pool/traffic
//! observations rolled into minute-resolution rows, plus a separate hourly
//! traffic rollup.
//!
//! Grounded on the bounded-sample-array-plus-incremental-average shape used
//! by monitoring-agent status accumulators (`metrics-engine.rs`'s
//! `MetricAccumulator` trait: keep a running summary, never replay the raw
//! series) and on `a29afb42…retention.rs`'s ticker-driven scan-all-tasks
//! pattern for the flush cadence.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use sqlx::PgPool;
use tokio::sync::{Mutex, RwLock};
use tracing::error;

use crate::db::models::MinuteMetricsRow;
use crate::db::repo;
use crate::error::CoreResult;

type TaskKey = (i64, String);

#[derive(Debug, Clone, Copy)]
struct PingResult {
    latency: i32,
    success: bool,
}

#[derive(Debug, Clone, Copy)]
struct PoolResult {
    count: i32,
}

#[derive(Debug, Clone, Copy)]
struct TrafficResult {
    cum: [u64; 4],
    ts: Instant,
}

fn push_capped<T>(buf: &mut VecDeque<T>, item: T, cap: usize) {
    if buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(item);
}

/// What a flush hands off to the caller for the `MinuteMetrics` upsert.
struct FlushSnapshot {
    ping_samples: VecDeque<PingResult>,
    pool_samples: VecDeque<PoolResult>,
    traffic_samples: VecDeque<TrafficResult>,
    success_count: u64,
    failure_count: u64,
    avg_ping: f64,
    avg_pool: f64,
}

/// Live sliding-window state for one `(endpointId, instanceId)`.
///
/// A ping latency below zero is treated as a failed probe, not a missing
/// sample — tunnel daemons that attempt and fail a tcping report it this
/// way, and the failure still counts toward the window's sample total.
struct TaskStatus {
    sample_count: u64,
    ping_samples: VecDeque<PingResult>,
    pool_samples: VecDeque<PoolResult>,
    traffic_samples: VecDeque<TrafficResult>,
    success_count: u64,
    failure_count: u64,
    avg_ping: f64,
    avg_pool: f64,
    pool_count: u64,
    first_data_time: Option<Instant>,
}

impl TaskStatus {
    fn new() -> Self {
        Self {
            sample_count: 0,
            ping_samples: VecDeque::new(),
            pool_samples: VecDeque::new(),
            traffic_samples: VecDeque::new(),
            success_count: 0,
            failure_count: 0,
            avg_ping: 0.0,
            avg_pool: 0.0,
            pool_count: 0,
            first_data_time: None,
        }
    }

    fn record(&mut self, ping: Option<i32>, pool_gauge: Option<i32>, current: [u64; 4], cap: usize) {
        let now = Instant::now();
        self.sample_count += 1;
        self.first_data_time.get_or_insert(now);

        if let Some(latency) = ping {
            let success = latency >= 0;
            if success {
                self.success_count += 1;
                self.avg_ping =
                    (self.avg_ping * (self.success_count - 1) as f64 + latency as f64) / self.success_count as f64;
            } else {
                self.failure_count += 1;
            }
            push_capped(&mut self.ping_samples, PingResult { latency, success }, cap);
        }

        if let Some(count) = pool_gauge {
            self.pool_count += 1;
            self.avg_pool = (self.avg_pool * (self.pool_count - 1) as f64 + count as f64) / self.pool_count as f64;
            push_capped(&mut self.pool_samples, PoolResult { count }, cap);
        }

        push_capped(&mut self.traffic_samples, TrafficResult { cum: current, ts: now }, cap);
    }

    fn eligible_to_flush(&self, window: Duration, max: usize) -> bool {
        self.sample_count as usize >= max
            || self.first_data_time.is_some_and(|t| t.elapsed() >= window)
    }

    fn flush(&mut self) -> FlushSnapshot {
        let snapshot = FlushSnapshot {
            ping_samples: std::mem::take(&mut self.ping_samples),
            pool_samples: std::mem::take(&mut self.pool_samples),
            traffic_samples: std::mem::take(&mut self.traffic_samples),
            success_count: self.success_count,
            failure_count: self.failure_count,
            avg_ping: self.avg_ping,
            avg_pool: self.avg_pool,
        };
        self.sample_count = 0;
        self.success_count = 0;
        self.failure_count = 0;
        self.avg_ping = 0.0;
        self.avg_pool = 0.0;
        self.pool_count = 0;
        self.first_data_time = None;
        snapshot
    }
}

/// Projects a flush snapshot into the row fields (design notes §4.5 step 2).
fn summarize(snapshot: &FlushSnapshot) -> (Option<f64>, Option<i32>, Option<i32>, f64, Option<f64>, Option<i32>, Option<i32>, [f64; 4], i32) {
    let successes: Vec<i32> = snapshot
        .ping_samples
        .iter()
        .filter(|p| p.success)
        .map(|p| p.latency)
        .collect();
    let min_ping = successes.iter().copied().min();
    let max_ping = successes.iter().copied().max();
    let avg_ping = if successes.is_empty() { None } else { Some(snapshot.avg_ping) };

    let total = snapshot.success_count + snapshot.failure_count;
    let success_rate = if total == 0 {
        0.0
    } else {
        (snapshot.success_count as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    };

    let pool_values: Vec<i32> = snapshot.pool_samples.iter().map(|p| p.count).collect();
    let min_pool = pool_values.iter().copied().min();
    let max_pool = pool_values.iter().copied().max();
    let avg_pool = if pool_values.is_empty() { None } else { Some(snapshot.avg_pool) };

    let rates = if snapshot.traffic_samples.len() >= 2 {
        let first = snapshot.traffic_samples.front().unwrap();
        let last = snapshot.traffic_samples.back().unwrap();
        let delta_minutes = last.ts.duration_since(first.ts).as_secs_f64() / 60.0;
        if delta_minutes > 0.0 {
            let mut out = [0.0; 4];
            for i in 0..4 {
                let diff = last.cum[i] as i64 - first.cum[i] as i64;
                out[i] = diff.max(0) as f64 / delta_minutes;
            }
            out
        } else {
            [0.0; 4]
        }
    } else {
        [0.0; 4]
    };

    (avg_ping, min_ping, max_ping, success_rate, avg_pool, min_pool, max_pool, rates, total as i32)
}

fn current_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(now.hour(), now.minute(), 0)
        .expect("valid hms")
        .and_utc()
}

fn current_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_hms_opt(now.hour(), 0, 0).expect("valid hms").and_utc()
}

/// Process-wide map of sliding-window task status, plus the hourly rollup.
pub struct Aggregator {
    pool: PgPool,
    tasks: RwLock<HashMap<TaskKey, Mutex<TaskStatus>>>,
    window: Duration,
    max_current_status_size: usize,
}

impl Aggregator {
    #[must_use]
    pub fn new(pool: PgPool, window: Duration, max_current_status_size: usize) -> Self {
        Self {
            pool,
            tasks: RwLock::new(HashMap::new()),
            window,
            max_current_status_size,
        }
    }

    /// One ping/pool/traffic observation for a tunnel, from an `update` SSE
    /// event. Flushes and persists a `MinuteMetrics` row inline when the
    /// task becomes eligible (design notes §4.5).
    pub async fn record_sample(
        &self,
        endpoint_id: i64,
        instance_id: &str,
        ping: Option<i32>,
        pool_gauge: Option<i32>,
        current_cumulative: [u64; 4],
    ) {
        let key = (endpoint_id, instance_id.to_string());
        {
            let tasks = self.tasks.read().await;
            if let Some(task) = tasks.get(&key) {
                let mut guard = task.lock().await;
                guard.record(ping, pool_gauge, current_cumulative, self.max_current_status_size);
                if guard.eligible_to_flush(self.window, self.max_current_status_size) {
                    let snapshot = guard.flush();
                    drop(guard);
                    drop(tasks);
                    self.persist_flush(endpoint_id, instance_id, snapshot).await;
                }
                return;
            }
        }
        let mut tasks = self.tasks.write().await;
        let task = tasks.entry(key).or_insert_with(|| Mutex::new(TaskStatus::new()));
        let mut guard = task.lock().await;
        guard.record(ping, pool_gauge, current_cumulative, self.max_current_status_size);
        let eligible = guard.eligible_to_flush(self.window, self.max_current_status_size);
        if eligible {
            let snapshot = guard.flush();
            drop(guard);
            drop(tasks);
            self.persist_flush(endpoint_id, instance_id, snapshot).await;
        }
    }

    async fn persist_flush(&self, endpoint_id: i64, instance_id: &str, snapshot: FlushSnapshot) {
        let (avg_ping, min_ping, max_ping, success_rate, avg_pool, min_pool, max_pool, rates, sample_count) =
            summarize(&snapshot);
        let row = MinuteMetricsRow {
            endpoint_id,
            instance_id: instance_id.to_string(),
            metric_time: current_minute(Utc::now()),
            avg_ping,
            min_ping,
            max_ping,
            ping_success_rate: success_rate,
            avg_pool,
            min_pool,
            max_pool,
            rate_tcp_rx: rates[0],
            rate_tcp_tx: rates[1],
            rate_udp_rx: rates[2],
            rate_udp_tx: rates[3],
            sample_count,
        };
        if let Err(e) = repo::upsert_minute_metrics(&self.pool, &row).await {
            error!(endpoint_id, instance_id, error = %e, "failed to upsert minute metrics");
        }
    }

    /// Background ticker (design notes §4.5: "a background ticker at
    /// `aggregationWindow` cadence also scans all tasks and triggers
    /// eligible ones") — catches tasks that never hit the sample-count
    /// trigger because traffic is low.
    pub fn spawn_flush_ticker(self: Arc<Self>, tick: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let keys: Vec<TaskKey> = self.tasks.read().await.keys().cloned().collect();
                for (endpoint_id, instance_id) in keys {
                    let snapshot = {
                        let tasks = self.tasks.read().await;
                        let Some(task) = tasks.get(&(endpoint_id, instance_id.clone())) else {
                            continue;
                        };
                        let mut guard = task.lock().await;
                        if !guard.eligible_to_flush(self.window, self.max_current_status_size) {
                            continue;
                        }
                        guard.flush()
                    };
                    self.persist_flush(endpoint_id, &instance_id, snapshot).await;
                }
            }
        })
    }
}

/// Hourly traffic rollup (design notes §4.5 "Hourly traffic rollup"): for
/// the hour that just closed at `hour_end`, snapshot each instance's latest
/// cumulative totals and derive the per-hour increment against the
/// previous hour, clamped to zero on a counter reset.
pub async fn run_hourly_rollup(pool: &PgPool, hour_end: DateTime<Utc>) -> CoreResult<()> {
    let hour_time = hour_end - ChronoDuration::hours(1);
    let prev_hour_time = hour_time - ChronoDuration::hours(1);

    let instances = repo::distinct_instances_with_history(pool, hour_end).await?;
    let mut dashboard_totals = [0i64; 4];
    let mut instance_count = 0i32;

    for (endpoint_id, instance_id) in instances {
        let Some(latest) = repo::latest_traffic_history_at(pool, endpoint_id, &instance_id, hour_end).await? else {
            continue;
        };
        let totals = [latest.cum_tcp_in, latest.cum_tcp_out, latest.cum_udp_in, latest.cum_udp_out];

        let previous = repo::hourly_summary_at(pool, prev_hour_time, &instance_id).await?;
        let increments = match previous {
            Some(prev) => {
                let prev_totals = [
                    prev.tcp_rx_total,
                    prev.tcp_tx_total,
                    prev.udp_rx_total,
                    prev.udp_tx_total,
                ];
                let mut out = [0i64; 4];
                for i in 0..4 {
                    out[i] = (totals[i] - prev_totals[i]).max(0);
                }
                out
            }
            None => totals,
        };

        repo::upsert_hourly_summary(
            pool,
            &crate::db::models::TrafficHourlySummaryRow {
                hour_time,
                instance_id,
                endpoint_id,
                tcp_rx_total: totals[0],
                tcp_tx_total: totals[1],
                udp_rx_total: totals[2],
                udp_tx_total: totals[3],
                tcp_rx_increment: increments[0],
                tcp_tx_increment: increments[1],
                udp_rx_increment: increments[2],
                udp_tx_increment: increments[3],
                record_count: 1,
            },
        )
        .await?;

        for i in 0..4 {
            dashboard_totals[i] += totals[i];
        }
        instance_count += 1;
    }

    repo::upsert_dashboard_summary(
        pool,
        &crate::db::models::DashboardTrafficSummaryRow {
            hour_time,
            tcp_rx_total: dashboard_totals[0],
            tcp_tx_total: dashboard_totals[1],
            udp_rx_total: dashboard_totals[2],
            udp_tx_total: dashboard_totals[3],
            instance_count,
        },
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_average_matches_five_sample_example() {
        let mut task = TaskStatus::new();
        for latency in [20, 30, -1, 40, 50] {
            task.record(Some(latency), None, [0; 4], 50);
        }
        let snapshot = task.flush();
        let (avg_ping, min_ping, max_ping, success_rate, ..) = summarize(&snapshot);
        assert_eq!(avg_ping, Some(35.0));
        assert_eq!(min_ping, Some(20));
        assert_eq!(max_ping, Some(50));
        assert_eq!(success_rate, 80.0);
    }

    #[test]
    fn flush_trigger_fires_on_sample_count() {
        let mut task = TaskStatus::new();
        for _ in 0..49 {
            task.record(Some(10), None, [0; 4], 50);
        }
        assert!(!task.eligible_to_flush(Duration::from_secs(30), 50));
        task.record(Some(10), None, [0; 4], 50);
        assert!(task.eligible_to_flush(Duration::from_secs(30), 50));
    }

    #[test]
    fn minute_rate_ignores_single_sample() {
        let mut task = TaskStatus::new();
        task.record(None, None, [100, 0, 0, 0], 50);
        let snapshot = task.flush();
        let (_, _, _, _, _, _, _, rates, _) = summarize(&snapshot);
        assert_eq!(rates, [0.0; 4]);
    }

    #[test]
    fn pool_average_tracks_incremental_mean() {
        let mut task = TaskStatus::new();
        task.record(None, Some(10), [0; 4], 50);
        task.record(None, Some(20), [0; 4], 50);
        let snapshot = task.flush();
        let (_, _, _, _, avg_pool, min_pool, max_pool, ..) = summarize(&snapshot);
        assert_eq!(avg_pool, Some(15.0));
        assert_eq!(min_pool, Some(10));
        assert_eq!(max_pool, Some(20));
    }

    #[test]
    fn hourly_increment_clamps_negative_to_zero() {
        let current = [5i64, 5, 0, 0];
        let previous = [8i64, 18, 0, 0];
        let mut increments = [0i64; 4];
        for i in 0..4 {
            increments[i] = (current[i] - previous[i]).max(0);
        }
        assert_eq!(increments, [0, 0, 0, 0]);
    }
}
