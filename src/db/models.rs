//! Row types for the relational store (design notes §3, §6).
//!
//! These mirror the database schema table-for-table; the Telemetry Cache's
//! in-memory structures (see [`crate::cache`]) are the live projection and
//! are intentionally a different shape (volatile fields split from cold
//! bookkeeping, atomics where the cache needs lock-free hot-path updates).

use chrono::{DateTime, Utc};

/// `endpoints` table row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EndpointRow {
    pub id: i64,
    pub url: String,
    pub api_path: String,
    pub api_key: String,
    pub name: String,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub ver: Option<String>,
    pub tls: bool,
    pub status: String,
    pub last_check: DateTime<Utc>,
}

/// `tunnels` table row. Counter fields are cumulative absolutes as last
/// committed by the Persistence Worker Pool, never deltas.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TunnelRow {
    pub id: i64,
    pub endpoint_id: i64,
    pub instance_id: String,
    pub name: Option<String>,
    pub mode: String,
    pub status: String,
    pub url: String,
    pub tcp_rx: i64,
    pub tcp_tx: i64,
    pub udp_rx: i64,
    pub udp_tx: i64,
    pub pool: i32,
    pub ping: i32,
    pub tcps: i32,
    pub udps: i32,
    pub restart: bool,
    pub updated_at: DateTime<Utc>,
    pub last_event_time: DateTime<Utc>,
}

/// `tunnel_operation_logs` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationLogRow {
    pub id: i64,
    pub tunnel_id: i64,
    pub action: String,
    pub status: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// `traffic_history` (`service_history`) row — one append-only record per
/// flush of an endpoint's accumulated delta.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrafficHistoryRow {
    pub id: i64,
    pub endpoint_id: i64,
    pub instance_id: String,
    pub record_time: DateTime<Utc>,
    pub cum_tcp_in: i64,
    pub cum_tcp_out: i64,
    pub cum_udp_in: i64,
    pub cum_udp_out: i64,
    pub delta_tcp_in: i64,
    pub delta_tcp_out: i64,
    pub delta_udp_in: i64,
    pub delta_udp_out: i64,
}

/// `traffic_hourly_summary` row, keyed `(hour_time, instance_id)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrafficHourlySummaryRow {
    pub hour_time: DateTime<Utc>,
    pub instance_id: String,
    pub endpoint_id: i64,
    pub tcp_rx_total: i64,
    pub tcp_tx_total: i64,
    pub udp_rx_total: i64,
    pub udp_tx_total: i64,
    pub tcp_rx_increment: i64,
    pub tcp_tx_increment: i64,
    pub udp_rx_increment: i64,
    pub udp_tx_increment: i64,
    pub record_count: i32,
}

/// `dashboard_traffic_summary` row, keyed `hour_time` — sum over all
/// instances for that hour.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DashboardTrafficSummaryRow {
    pub hour_time: DateTime<Utc>,
    pub tcp_rx_total: i64,
    pub tcp_tx_total: i64,
    pub udp_rx_total: i64,
    pub udp_tx_total: i64,
    pub instance_count: i32,
}

/// `minute_metrics` row, keyed `(endpoint_id, instance_id, metric_time)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MinuteMetricsRow {
    pub endpoint_id: i64,
    pub instance_id: String,
    pub metric_time: DateTime<Utc>,
    pub avg_ping: Option<f64>,
    pub min_ping: Option<i32>,
    pub max_ping: Option<i32>,
    pub ping_success_rate: f64,
    pub avg_pool: Option<f64>,
    pub min_pool: Option<i32>,
    pub max_pool: Option<i32>,
    pub rate_tcp_rx: f64,
    pub rate_tcp_tx: f64,
    pub rate_udp_rx: f64,
    pub rate_udp_tx: f64,
    pub sample_count: i32,
}

/// `raw_sse` row — archival of selected raw events.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawSseLogRow {
    pub id: i64,
    pub endpoint_id: i64,
    pub instance_id: Option<String>,
    pub event_time: DateTime<Utc>,
    pub push_type: String,
    pub fields: serde_json::Value,
}
