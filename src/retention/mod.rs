//! Retention & Cleanup Scheduler (design notes §4.6): a single dedicated
//! timer driving the hourly rollup invocation and the daily retention sweep.
//!
//! Grounded on `a29afb42…retention.rs`'s hourly-ticker-plus-batched-purge
//! shape; the batched DELETE itself lives in [`crate::db::repo::purge_older_than`]
//! since it's shared with the dashboard summary and operation-log tables
//! that teacher file doesn't have analogues for.

use chrono::{Local, NaiveTime, Timelike, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::aggregate;
use crate::config::RetentionConfig;
use crate::db::repo::{self, RetentionResult};

/// Fixed table list for the daily sweep (design notes §4.6, §6 retention
/// table). Table and column names are compile-time constants, never derived
/// from user input — see [`repo::purge_older_than`].
fn sweep_targets(config: &RetentionConfig) -> [(&'static str, &'static str, i64); 5] {
    [
        ("raw_sse", "event_time", config.raw_sse_days),
        ("traffic_history", "record_time", config.history_days),
        ("traffic_hourly_summary", "hour_time", config.summary_days),
        ("dashboard_traffic_summary", "hour_time", config.summary_days),
        ("tunnel_operation_logs", "created_at", config.operation_log_days),
    ]
}

/// Runs one daily sweep: a batched purge per table, each isolated from the
/// others' failures, followed by a `VACUUM` of whatever was touched.
pub async fn run_daily_sweep(pool: &PgPool, config: &RetentionConfig) -> Vec<RetentionResult> {
    let now = Utc::now();
    let mut results = Vec::with_capacity(5);
    for (table, key_column, days) in sweep_targets(config) {
        let cutoff = now - chrono::Duration::days(days);
        let result = repo::purge_older_than(pool, table, key_column, cutoff, config.cleanup_batch_size).await;
        if let Some(err) = &result.error {
            warn!(table, error = %err, "retention sweep failed for table");
        } else {
            info!(table, deleted = result.deleted, duration_ms = result.duration.as_millis() as u64, "retention sweep complete");
            if result.deleted > 0 {
                if let Err(e) = repo::vacuum_table(pool, table).await {
                    warn!(table, error = %e, "vacuum failed after retention sweep");
                }
            }
        }
        results.push(result);
    }
    results
}

/// Spawns the hourly rollup ticker (design notes §4.6 job 1: "invoke the
/// hourly rollup path"). Fires at the top of every hour.
pub fn spawn_hourly_ticker(pool: PgPool) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let sleep_for = duration_until_next_hour();
            tokio::time::sleep(sleep_for).await;
            let hour_end = current_hour_boundary();
            if let Err(e) = aggregate::run_hourly_rollup(&pool, hour_end).await {
                warn!(error = %e, "hourly traffic rollup failed");
            }
        }
    })
}

/// Spawns the daily retention sweep ticker (design notes §4.6 job 2: "daily
/// at 03:00 local, execute the retention sweep").
pub fn spawn_daily_sweep_ticker(pool: PgPool, config: RetentionConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let sleep_for = duration_until_next_3am_local();
            tokio::time::sleep(sleep_for).await;
            let results = run_daily_sweep(&pool, &config).await;
            let total: i64 = results.iter().map(|r| r.deleted).sum();
            info!(total_deleted = total, "daily retention sweep finished");
        }
    })
}

fn current_hour_boundary() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    now.date_naive().and_hms_opt(now.hour(), 0, 0).expect("valid hms").and_utc()
}

fn duration_until_next_hour() -> std::time::Duration {
    let now = Utc::now();
    let next = current_hour_boundary() + chrono::Duration::hours(1);
    (next - now).to_std().unwrap_or(std::time::Duration::from_secs(1))
}

fn duration_until_next_3am_local() -> std::time::Duration {
    let now = Local::now();
    let three_am = NaiveTime::from_hms_opt(3, 0, 0).expect("valid time");
    let mut next = now.date_naive().and_time(three_am);
    if now.time() >= three_am {
        next += chrono::Duration::days(1);
    }
    let next_local = next.and_local_timezone(now.timezone()).single().unwrap_or_else(|| {
        // DST gap at 03:00 on the transition day — fall back to the next
        // representable instant rather than panicking the scheduler.
        now + chrono::Duration::days(1)
    });
    (next_local - now).to_std().unwrap_or(std::time::Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_targets_cover_five_tables() {
        let config = RetentionConfig {
            raw_sse_days: 30,
            history_days: 7,
            summary_days: 365,
            operation_log_days: 90,
            cleanup_batch_size: 10_000,
        };
        let targets = sweep_targets(&config);
        assert_eq!(targets.len(), 5);
        assert!(targets.iter().any(|(t, _, _)| *t == "raw_sse"));
        assert!(targets.iter().any(|(t, _, _)| *t == "tunnel_operation_logs"));
    }

    #[test]
    fn next_hour_boundary_is_in_the_future_and_within_an_hour() {
        let d = duration_until_next_hour();
        assert!(d.as_secs() <= 3600);
    }
}
