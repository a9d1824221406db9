//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `NDP_DATABASE_URL`, `NDP_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `ndp-core.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy and the tunables named in the
//! design notes' "Configuration (recognized options)" section:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8686"
//!
//! [database]
//! url = "postgres://localhost/nodepassdash"
//!
//! [logging]
//! level = "info"
//!
//! [persist]
//! interval_secs = 2
//! batch_tick_secs = 5
//! queue_size = 1024
//! workers = 2
//!
//! [aggregation]
//! window_secs = 30
//! max_current_status_size = 50
//!
//! [sse]
//! read_idle_secs = 90
//! reconnect_backoff_max_secs = 30
//!
//! [retention]
//! raw_sse_days = 30
//! history_days = 7
//! summary_days = 365
//! operation_log_days = 90
//! cleanup_batch_size = 10000
//!
//! [fanout]
//! subscriber_queue_size = 256
//!
//! [shutdown]
//! grace_secs = 5
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub persist: PersistConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub sse: SseConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// HTTP server settings for the exposed SSE/WebSocket surfaces.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8686`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Relational store connection settings. Single process, single database
/// per the design notes' non-goals (no cluster coordination).
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection string. Override with `NDP_DATABASE_URL`.
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Connection pool size (default 10).
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Persistence Worker Pool tunables (design notes §4.4).
#[derive(Debug, Clone, Deserialize)]
pub struct PersistConfig {
    /// Minimum interval between a dirty endpoint's persist flushes (default 2s).
    #[serde(default = "default_persist_interval_secs")]
    pub interval_secs: u64,
    /// Batch tick cadence that scans all endpoints for accumulated deltas (default 5s).
    #[serde(default = "default_batch_tick_secs")]
    pub batch_tick_secs: u64,
    /// Bounded persistence queue capacity (default 1024).
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Number of persistence worker tasks (default 2).
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Metrics Aggregator tunables (design notes §4.5).
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Sliding-window flush age trigger (default 30s).
    #[serde(default = "default_aggregation_window_secs")]
    pub window_secs: u64,
    /// Sample-count flush trigger (default 50).
    #[serde(default = "default_max_current_status_size")]
    pub max_current_status_size: usize,
}

/// SSE subscription tunables for the Endpoint Client (design notes §4.1, §5).
#[derive(Debug, Clone, Deserialize)]
pub struct SseConfig {
    /// Idle read timeout before forcing a reconnect (default 90s).
    #[serde(default = "default_sse_read_idle_secs")]
    pub read_idle_secs: u64,
    /// Cap on reconnect backoff (default 30s).
    #[serde(default = "default_sse_reconnect_backoff_max_secs")]
    pub reconnect_backoff_max_secs: u64,
    /// Window during which tunnels absent from post-reconnect `initial`
    /// events are marked offline rather than deleted (default 30s).
    #[serde(default = "default_resync_window_secs")]
    pub resync_window_secs: u64,
}

/// Retention & Cleanup Scheduler tunables (design notes §4.6).
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_raw_sse_days")]
    pub raw_sse_days: i64,
    #[serde(default = "default_history_days")]
    pub history_days: i64,
    #[serde(default = "default_summary_days")]
    pub summary_days: i64,
    #[serde(default = "default_operation_log_days")]
    pub operation_log_days: i64,
    /// Rows deleted per batch, with a sleep between batches (default 10000).
    #[serde(default = "default_cleanup_batch_size")]
    pub cleanup_batch_size: i64,
}

/// Fan-out Hub tunables (design notes §4.7).
#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Bounded per-subscriber queue depth (default 256).
    #[serde(default = "default_subscriber_queue_size")]
    pub subscriber_queue_size: usize,
}

/// Process-wide shutdown tunables (design notes §5).
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Grace period for in-flight drains before forced exit (default 5s).
    #[serde(default = "default_shutdown_grace_secs")]
    pub grace_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8686".to_string()
}
fn default_database_url() -> String {
    "postgres://localhost/nodepassdash".to_string()
}
fn default_pool_size() -> u32 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_persist_interval_secs() -> u64 {
    2
}
fn default_batch_tick_secs() -> u64 {
    5
}
fn default_queue_size() -> usize {
    1024
}
fn default_workers() -> usize {
    2
}
fn default_aggregation_window_secs() -> u64 {
    30
}
fn default_max_current_status_size() -> usize {
    50
}
fn default_sse_read_idle_secs() -> u64 {
    90
}
fn default_sse_reconnect_backoff_max_secs() -> u64 {
    30
}
fn default_resync_window_secs() -> u64 {
    30
}
fn default_raw_sse_days() -> i64 {
    30
}
fn default_history_days() -> i64 {
    7
}
fn default_summary_days() -> i64 {
    365
}
fn default_operation_log_days() -> i64 {
    90
}
fn default_cleanup_batch_size() -> i64 {
    10_000
}
fn default_subscriber_queue_size() -> usize {
    256
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_persist_interval_secs(),
            batch_tick_secs: default_batch_tick_secs(),
            queue_size: default_queue_size(),
            workers: default_workers(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_secs: default_aggregation_window_secs(),
            max_current_status_size: default_max_current_status_size(),
        }
    }
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            read_idle_secs: default_sse_read_idle_secs(),
            reconnect_backoff_max_secs: default_sse_reconnect_backoff_max_secs(),
            resync_window_secs: default_resync_window_secs(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_sse_days: default_raw_sse_days(),
            history_days: default_history_days(),
            summary_days: default_summary_days(),
            operation_log_days: default_operation_log_days(),
            cleanup_batch_size: default_cleanup_batch_size(),
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_size: default_subscriber_queue_size(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl PersistConfig {
    #[must_use]
    pub fn batch_tick(&self) -> Duration {
        Duration::from_secs(self.batch_tick_secs)
    }
}

impl AggregationConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl SseConfig {
    #[must_use]
    pub fn read_idle(&self) -> Duration {
        Duration::from_secs(self.read_idle_secs)
    }

    #[must_use]
    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_max_secs)
    }

    #[must_use]
    pub fn resync_window(&self) -> Duration {
        Duration::from_secs(self.resync_window_secs)
    }
}

impl ShutdownConfig {
    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `ndp-core.toml` in the current directory, falling back to compiled
    /// defaults.
    #[must_use]
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("ndp-core.toml").exists() {
            let content =
                std::fs::read_to_string("ndp-core.toml").expect("Failed to read ndp-core.toml");
            toml::from_str(&content).expect("Failed to parse ndp-core.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                database: DatabaseConfig::default(),
                logging: LoggingConfig::default(),
                persist: PersistConfig::default(),
                aggregation: AggregationConfig::default(),
                sse: SseConfig::default(),
                retention: RetentionConfig::default(),
                fanout: FanoutConfig::default(),
                shutdown: ShutdownConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(url) = std::env::var("NDP_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(listen) = std::env::var("NDP_LISTEN") {
            config.server.listen = listen;
        }

        config
    }

    /// Sanity-check config values that would otherwise fail confusingly deep
    /// inside a worker task.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.persist.workers == 0 {
            errors.push("persist.workers must be at least 1".to_string());
        }
        if self.persist.queue_size == 0 {
            errors.push("persist.queue_size must be at least 1".to_string());
        }
        if self.aggregation.max_current_status_size == 0 {
            errors.push("aggregation.max_current_status_size must be at least 1".to_string());
        }
        if self.database.url.is_empty() {
            errors.push("database.url must not be empty".to_string());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Config {
        Config {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            persist: PersistConfig::default(),
            aggregation: AggregationConfig::default(),
            sse: SseConfig::default(),
            retention: RetentionConfig::default(),
            fanout: FanoutConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }

    #[test]
    fn defaults_match_design_notes() {
        let config = defaults();
        assert_eq!(config.persist.interval_secs, 2);
        assert_eq!(config.persist.batch_tick_secs, 5);
        assert_eq!(config.persist.queue_size, 1024);
        assert_eq!(config.persist.workers, 2);
        assert_eq!(config.aggregation.window_secs, 30);
        assert_eq!(config.aggregation.max_current_status_size, 50);
        assert_eq!(config.sse.read_idle_secs, 90);
        assert_eq!(config.sse.reconnect_backoff_max_secs, 30);
        assert_eq!(config.retention.cleanup_batch_size, 10_000);
        assert_eq!(config.fanout.subscriber_queue_size, 256);
        assert_eq!(config.shutdown.grace_secs, 5);
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = defaults();
        config.persist.workers = 0;
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("workers")));
    }
}
