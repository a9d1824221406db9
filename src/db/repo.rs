//! Query functions — the portable DAO surface over the schema in §6.
//!
//! Upserts use Postgres `ON CONFLICT DO UPDATE`, the dialect-aware upsert
//! named in the design notes' re-architecture guidance for summary tables.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;

use super::models::{
    DashboardTrafficSummaryRow, EndpointRow, MinuteMetricsRow, TrafficHistoryRow,
    TrafficHourlySummaryRow, TunnelRow,
};
use crate::error::CoreResult;

pub async fn load_endpoints(pool: &PgPool) -> CoreResult<Vec<EndpointRow>> {
    let rows = sqlx::query_as::<_, EndpointRow>(
        "SELECT id, url, api_path, api_key, name, os, arch, ver, tls, status, last_check FROM endpoints",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn load_tunnels(pool: &PgPool) -> CoreResult<Vec<TunnelRow>> {
    let rows = sqlx::query_as::<_, TunnelRow>(
        "SELECT id, endpoint_id, instance_id, name, mode, status, url, \
         tcp_rx, tcp_tx, udp_rx, udp_tx, pool, ping, tcps, udps, restart, \
         updated_at, last_event_time FROM tunnels",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn update_endpoint_status(
    pool: &PgPool,
    endpoint_id: i64,
    status: &str,
    last_check: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query("UPDATE endpoints SET status = $1, last_check = $2 WHERE id = $3")
        .bind(status)
        .bind(last_check)
        .bind(endpoint_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Inline create for a tunnel observed via an `initial`/`create` SSE event.
/// Design notes §4.4: "create path is handled inline by the SSE service",
/// the Persistence Worker Pool's `TunnelStateChange.create` handler is a
/// no-op because this already ran synchronously on ingest.
#[allow(clippy::too_many_arguments)]
pub async fn insert_tunnel(
    pool: &PgPool,
    endpoint_id: i64,
    instance_id: &str,
    name: Option<&str>,
    mode: &str,
    status: &str,
    url: &str,
    now: DateTime<Utc>,
) -> CoreResult<i64> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO tunnels (endpoint_id, instance_id, name, mode, status, url, updated_at, last_event_time) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $7) \
         ON CONFLICT (endpoint_id, instance_id) DO UPDATE SET status = EXCLUDED.status, updated_at = EXCLUDED.updated_at \
         RETURNING id",
    )
    .bind(endpoint_id)
    .bind(instance_id)
    .bind(name)
    .bind(mode)
    .bind(status)
    .bind(url)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

/// Deletes dependent operation-log rows first, then the tunnel row, per
/// §4.4's explicit ordering (the schema also cascades, but the worker pool
/// does this itself so the two deletes are observable as one unit of work
/// in the query log).
pub async fn delete_tunnel(pool: &PgPool, endpoint_id: i64, instance_id: &str) -> CoreResult<()> {
    let mut tx = pool.begin().await?;
    let tunnel_id: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM tunnels WHERE endpoint_id = $1 AND instance_id = $2 FOR UPDATE",
    )
    .bind(endpoint_id)
    .bind(instance_id)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some((id,)) = tunnel_id {
        sqlx::query("DELETE FROM tunnel_operation_logs WHERE tunnel_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tunnels WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Batched `TrafficDelta` writeback — one UPDATE per tunnel for cumulative
/// counters and gauges (§4.4 batch tick).
#[allow(clippy::too_many_arguments)]
pub async fn update_tunnel_counters(
    pool: &PgPool,
    endpoint_id: i64,
    instance_id: &str,
    tcp_rx: i64,
    tcp_tx: i64,
    udp_rx: i64,
    udp_tx: i64,
    pool_gauge: i32,
    ping: i32,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        "UPDATE tunnels SET tcp_rx = $1, tcp_tx = $2, udp_rx = $3, udp_tx = $4, \
         pool = $5, ping = $6, updated_at = $7, last_event_time = $7 \
         WHERE endpoint_id = $8 AND instance_id = $9",
    )
    .bind(tcp_rx)
    .bind(tcp_tx)
    .bind(udp_rx)
    .bind(udp_tx)
    .bind(pool_gauge)
    .bind(ping)
    .bind(now)
    .bind(endpoint_id)
    .bind(instance_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_tunnel_status(
    pool: &PgPool,
    endpoint_id: i64,
    instance_id: &str,
    status: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        "UPDATE tunnels SET status = $1, updated_at = $2 WHERE endpoint_id = $3 AND instance_id = $4",
    )
    .bind(status)
    .bind(now)
    .bind(endpoint_id)
    .bind(instance_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn insert_traffic_history(pool: &PgPool, row: &TrafficHistoryRow) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO traffic_history \
         (endpoint_id, instance_id, record_time, cum_tcp_in, cum_tcp_out, cum_udp_in, cum_udp_out, \
          delta_tcp_in, delta_tcp_out, delta_udp_in, delta_udp_out) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(row.endpoint_id)
    .bind(&row.instance_id)
    .bind(row.record_time)
    .bind(row.cum_tcp_in)
    .bind(row.cum_tcp_out)
    .bind(row.cum_udp_in)
    .bind(row.cum_udp_out)
    .bind(row.delta_tcp_in)
    .bind(row.delta_tcp_out)
    .bind(row.delta_udp_in)
    .bind(row.delta_udp_out)
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent `traffic_history` row at or before `at` for one instance —
/// used by the hourly rollup (§4.5 step 1) and by late-binding trend
/// queries that fall back to history reconstruction.
pub async fn latest_traffic_history_at(
    pool: &PgPool,
    endpoint_id: i64,
    instance_id: &str,
    at: DateTime<Utc>,
) -> CoreResult<Option<TrafficHistoryRow>> {
    let row = sqlx::query_as::<_, TrafficHistoryRow>(
        "SELECT id, endpoint_id, instance_id, record_time, cum_tcp_in, cum_tcp_out, \
         cum_udp_in, cum_udp_out, delta_tcp_in, delta_tcp_out, delta_udp_in, delta_udp_out \
         FROM traffic_history \
         WHERE endpoint_id = $1 AND instance_id = $2 AND record_time <= $3 \
         ORDER BY record_time DESC LIMIT 1",
    )
    .bind(endpoint_id)
    .bind(instance_id)
    .bind(at)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Distinct `(endpoint_id, instance_id)` pairs with at least one history
/// row at or before `at` — the hourly rollup iterates this set.
pub async fn distinct_instances_with_history(
    pool: &PgPool,
    at: DateTime<Utc>,
) -> CoreResult<Vec<(i64, String)>> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        "SELECT DISTINCT endpoint_id, instance_id FROM traffic_history WHERE record_time <= $1",
    )
    .bind(at)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn upsert_hourly_summary(
    pool: &PgPool,
    row: &TrafficHourlySummaryRow,
) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO traffic_hourly_summary \
         (hour_time, instance_id, endpoint_id, tcp_rx_total, tcp_tx_total, udp_rx_total, udp_tx_total, \
          tcp_rx_increment, tcp_tx_increment, udp_rx_increment, udp_tx_increment, record_count) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         ON CONFLICT (hour_time, instance_id) DO UPDATE SET \
            endpoint_id = EXCLUDED.endpoint_id, \
            tcp_rx_total = EXCLUDED.tcp_rx_total, tcp_tx_total = EXCLUDED.tcp_tx_total, \
            udp_rx_total = EXCLUDED.udp_rx_total, udp_tx_total = EXCLUDED.udp_tx_total, \
            tcp_rx_increment = EXCLUDED.tcp_rx_increment, tcp_tx_increment = EXCLUDED.tcp_tx_increment, \
            udp_rx_increment = EXCLUDED.udp_rx_increment, udp_tx_increment = EXCLUDED.udp_tx_increment, \
            record_count = EXCLUDED.record_count",
    )
    .bind(row.hour_time)
    .bind(&row.instance_id)
    .bind(row.endpoint_id)
    .bind(row.tcp_rx_total)
    .bind(row.tcp_tx_total)
    .bind(row.udp_rx_total)
    .bind(row.udp_tx_total)
    .bind(row.tcp_rx_increment)
    .bind(row.tcp_tx_increment)
    .bind(row.udp_rx_increment)
    .bind(row.udp_tx_increment)
    .bind(row.record_count)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn hourly_summary_at(
    pool: &PgPool,
    hour_time: DateTime<Utc>,
    instance_id: &str,
) -> CoreResult<Option<TrafficHourlySummaryRow>> {
    let row = sqlx::query_as::<_, TrafficHourlySummaryRow>(
        "SELECT hour_time, instance_id, endpoint_id, tcp_rx_total, tcp_tx_total, udp_rx_total, \
         udp_tx_total, tcp_rx_increment, tcp_tx_increment, udp_rx_increment, udp_tx_increment, record_count \
         FROM traffic_hourly_summary WHERE hour_time = $1 AND instance_id = $2",
    )
    .bind(hour_time)
    .bind(instance_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn upsert_dashboard_summary(
    pool: &PgPool,
    row: &DashboardTrafficSummaryRow,
) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO dashboard_traffic_summary \
         (hour_time, tcp_rx_total, tcp_tx_total, udp_rx_total, udp_tx_total, instance_count) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (hour_time) DO UPDATE SET \
            tcp_rx_total = EXCLUDED.tcp_rx_total, tcp_tx_total = EXCLUDED.tcp_tx_total, \
            udp_rx_total = EXCLUDED.udp_rx_total, udp_tx_total = EXCLUDED.udp_tx_total, \
            instance_count = EXCLUDED.instance_count",
    )
    .bind(row.hour_time)
    .bind(row.tcp_rx_total)
    .bind(row.tcp_tx_total)
    .bind(row.udp_rx_total)
    .bind(row.udp_tx_total)
    .bind(row.instance_count)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn upsert_minute_metrics(pool: &PgPool, row: &MinuteMetricsRow) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO minute_metrics \
         (endpoint_id, instance_id, metric_time, avg_ping, min_ping, max_ping, ping_success_rate, \
          avg_pool, min_pool, max_pool, rate_tcp_rx, rate_tcp_tx, rate_udp_rx, rate_udp_tx, sample_count) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         ON CONFLICT (endpoint_id, instance_id, metric_time) DO UPDATE SET \
            avg_ping = CASE \
                WHEN minute_metrics.avg_ping IS NULL THEN EXCLUDED.avg_ping \
                WHEN EXCLUDED.avg_ping IS NULL THEN minute_metrics.avg_ping \
                ELSE (minute_metrics.avg_ping * minute_metrics.sample_count + EXCLUDED.avg_ping * EXCLUDED.sample_count) \
                     / NULLIF(minute_metrics.sample_count + EXCLUDED.sample_count, 0) \
            END, \
            min_ping = LEAST(minute_metrics.min_ping, EXCLUDED.min_ping), \
            max_ping = GREATEST(minute_metrics.max_ping, EXCLUDED.max_ping), \
            ping_success_rate = (minute_metrics.ping_success_rate * minute_metrics.sample_count \
                    + EXCLUDED.ping_success_rate * EXCLUDED.sample_count) \
                / NULLIF(minute_metrics.sample_count + EXCLUDED.sample_count, 0), \
            avg_pool = CASE \
                WHEN minute_metrics.avg_pool IS NULL THEN EXCLUDED.avg_pool \
                WHEN EXCLUDED.avg_pool IS NULL THEN minute_metrics.avg_pool \
                ELSE (minute_metrics.avg_pool * minute_metrics.sample_count + EXCLUDED.avg_pool * EXCLUDED.sample_count) \
                     / NULLIF(minute_metrics.sample_count + EXCLUDED.sample_count, 0) \
            END, \
            min_pool = LEAST(minute_metrics.min_pool, EXCLUDED.min_pool), \
            max_pool = GREATEST(minute_metrics.max_pool, EXCLUDED.max_pool), \
            rate_tcp_rx = (minute_metrics.rate_tcp_rx * minute_metrics.sample_count \
                    + EXCLUDED.rate_tcp_rx * EXCLUDED.sample_count) \
                / NULLIF(minute_metrics.sample_count + EXCLUDED.sample_count, 0), \
            rate_tcp_tx = (minute_metrics.rate_tcp_tx * minute_metrics.sample_count \
                    + EXCLUDED.rate_tcp_tx * EXCLUDED.sample_count) \
                / NULLIF(minute_metrics.sample_count + EXCLUDED.sample_count, 0), \
            rate_udp_rx = (minute_metrics.rate_udp_rx * minute_metrics.sample_count \
                    + EXCLUDED.rate_udp_rx * EXCLUDED.sample_count) \
                / NULLIF(minute_metrics.sample_count + EXCLUDED.sample_count, 0), \
            rate_udp_tx = (minute_metrics.rate_udp_tx * minute_metrics.sample_count \
                    + EXCLUDED.rate_udp_tx * EXCLUDED.sample_count) \
                / NULLIF(minute_metrics.sample_count + EXCLUDED.sample_count, 0), \
            sample_count = minute_metrics.sample_count + EXCLUDED.sample_count",
    )
    .bind(row.endpoint_id)
    .bind(&row.instance_id)
    .bind(row.metric_time)
    .bind(row.avg_ping)
    .bind(row.min_ping)
    .bind(row.max_ping)
    .bind(row.ping_success_rate)
    .bind(row.avg_pool)
    .bind(row.min_pool)
    .bind(row.max_pool)
    .bind(row.rate_tcp_rx)
    .bind(row.rate_tcp_tx)
    .bind(row.rate_udp_rx)
    .bind(row.rate_udp_tx)
    .bind(row.sample_count)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn minute_metrics_since(
    pool: &PgPool,
    endpoint_id: i64,
    instance_id: &str,
    since: DateTime<Utc>,
) -> CoreResult<Vec<MinuteMetricsRow>> {
    let rows = sqlx::query_as::<_, MinuteMetricsRow>(
        "SELECT endpoint_id, instance_id, metric_time, avg_ping, min_ping, max_ping, ping_success_rate, \
         avg_pool, min_pool, max_pool, rate_tcp_rx, rate_tcp_tx, rate_udp_rx, rate_udp_tx, sample_count \
         FROM minute_metrics WHERE endpoint_id = $1 AND instance_id = $2 AND metric_time >= $3 \
         ORDER BY metric_time ASC",
    )
    .bind(endpoint_id)
    .bind(instance_id)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn hourly_summary_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> CoreResult<Vec<DashboardTrafficSummaryRow>> {
    let rows = sqlx::query_as::<_, DashboardTrafficSummaryRow>(
        "SELECT hour_time, tcp_rx_total, tcp_tx_total, udp_rx_total, udp_tx_total, instance_count \
         FROM dashboard_traffic_summary WHERE hour_time >= $1 ORDER BY hour_time ASC",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// One row in the result of a retention job (design notes §4.6).
pub struct RetentionResult {
    pub table: &'static str,
    pub deleted: i64,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Deletes rows older than `cutoff` from `table` keyed by `key_column`, in
/// batches of `batch_size` with a short sleep between batches to avoid
/// holding a long lock (§4.6). A failure partway through is recorded on the
/// result rather than propagated, so sibling tables still get their sweep.
pub async fn purge_older_than(
    pool: &PgPool,
    table: &'static str,
    key_column: &'static str,
    cutoff: DateTime<Utc>,
    batch_size: i64,
) -> RetentionResult {
    let start = std::time::Instant::now();
    let mut total: i64 = 0;
    loop {
        // Table/column names are compile-time constants from the fixed
        // table list below, never user input.
        let sql = format!(
            "DELETE FROM {table} WHERE ctid IN (SELECT ctid FROM {table} WHERE {key_column} < $1 LIMIT $2)"
        );
        match sqlx::query(&sql)
            .bind(cutoff)
            .bind(batch_size)
            .execute(pool)
            .await
        {
            Ok(result) => {
                let deleted = result.rows_affected() as i64;
                total += deleted;
                if deleted < batch_size {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => {
                return RetentionResult {
                    table,
                    deleted: total,
                    duration: start.elapsed(),
                    error: Some(e.to_string()),
                };
            }
        }
    }
    RetentionResult {
        table,
        deleted: total,
        duration: start.elapsed(),
        error: None,
    }
}

/// Archives one raw SSE frame (design notes §3 `RawSSELog`) — used for the
/// `log` event kind, which carries no structured counters worth projecting
/// into the cache.
pub async fn insert_raw_sse(
    pool: &PgPool,
    endpoint_id: i64,
    instance_id: Option<&str>,
    event_time: DateTime<Utc>,
    push_type: &str,
    fields: &serde_json::Value,
) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO raw_sse (endpoint_id, instance_id, event_time, push_type, fields) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(endpoint_id)
    .bind(instance_id)
    .bind(event_time)
    .bind(push_type)
    .bind(fields)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn vacuum_table(pool: &PgPool, table: &str) -> CoreResult<()> {
    sqlx::query(&format!("VACUUM {table}")).execute(pool).await?;
    Ok(())
}
