#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # ndp-telemetry-core
//!
//! Telemetry core for a tunnel-fleet control plane: ingests per-instance SSE
//! events from a fleet of tunnel daemons ("endpoints"), maintains an
//! authoritative in-memory cache, persists to Postgres on a batched timer,
//! aggregates sliding-window metrics, and pushes live updates to dashboard
//! clients over SSE/WebSocket.
//!
//! ## Subcommands
//!
//! - `ndp-core serve` (default) — run the telemetry core

use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use ndp_telemetry_core::aggregate::Aggregator;
use ndp_telemetry_core::cache::Manager;
use ndp_telemetry_core::config::Config;
use ndp_telemetry_core::db;
use ndp_telemetry_core::endpoint::{self, client::EndpointHandle};
use ndp_telemetry_core::fanout::Hub;
use ndp_telemetry_core::ingest::Pipeline;
use ndp_telemetry_core::persist;
use ndp_telemetry_core::retention;
use ndp_telemetry_core::routes;
use ndp_telemetry_core::state::AppState;

/// Telemetry core for a tunnel-fleet control plane.
#[derive(Parser)]
#[command(name = "ndp-core", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the telemetry core (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => {
            let args: Vec<String> = std::env::args().collect();
            args.windows(2).find(|w| w[0] == "--config").map(|w| w[1].clone())
        }
    };
    run_server(config_path.as_deref()).await;
}

#[allow(clippy::too_many_lines)]
async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("ndp-telemetry-core v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let pool = db::connect(&config.database).await.expect("Failed to connect to database");

    let cache = Arc::new(Manager::new());
    cache.load_from_db(&pool).await.expect("Failed to load initial cache state from database");

    let aggregator = Arc::new(Aggregator::new(
        pool.clone(),
        config.aggregation.window(),
        config.aggregation.max_current_status_size,
    ));
    let fanout = Arc::new(Hub::new(config.fanout.subscriber_queue_size));

    let (persist_pool, persist_workers) =
        persist::Pool::spawn(pool.clone(), config.persist.workers, config.persist.queue_size);
    let persist_pool = Arc::new(persist_pool);

    let pipeline = Arc::new(Pipeline::new(
        cache.clone(),
        pool.clone(),
        aggregator.clone(),
        fanout.clone(),
        persist_pool.clone(),
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        start_time: Instant::now(),
        pool: pool.clone(),
        cache: cache.clone(),
        aggregator: aggregator.clone(),
        fanout: fanout.clone(),
        persist: persist_pool.clone(),
        pipeline: pipeline.clone(),
    };

    // One SSE reader task per configured endpoint, each wrapped in its own
    // panic-recovery supervisor loop (design notes §4.1 mirrors the tunnel
    // client's outer-spawn/inner-loop split).
    let mut endpoint_tasks = Vec::new();
    for endpoint_id in cache.all_endpoint_ids().await {
        let Some(snapshot) = cache.endpoint_snapshot(endpoint_id).await else {
            continue;
        };
        let handle = match EndpointHandle::new(&snapshot.url, &snapshot.api_path, &snapshot.api_key, !snapshot.tls) {
            Ok(h) => h,
            Err(e) => {
                warn!(endpoint_id, error = %e, "failed to build endpoint client, skipping");
                continue;
            }
        };
        let pipeline = pipeline.clone();
        let sse_config = config.sse.clone();
        endpoint_tasks.push(tokio::spawn(async move {
            loop {
                let join = endpoint::client::spawn(endpoint_id, handle.clone(), pipeline.clone(), sse_config.clone());
                match join.await {
                    Ok(()) => {
                        info!(endpoint_id, "endpoint client task exited, not restarting");
                        break;
                    }
                    Err(e) => {
                        error!(endpoint_id, error = %e, "endpoint client panicked, restarting in 5s");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        }));
    }

    let batch_ticker = persist::spawn_batch_ticker(pool.clone(), cache.clone(), config.persist.batch_tick()).await;
    let flush_ticker = aggregator.clone().spawn_flush_ticker(config.aggregation.window());
    let hourly_ticker = retention::spawn_hourly_ticker(pool.clone());
    let daily_sweep_ticker = retention::spawn_daily_sweep_ticker(pool.clone(), config.retention.clone());

    // Periodic structured summary log of the hot-path counters that would
    // otherwise only be visible by polling /healthz (design notes §7).
    let summary_log_ticker = {
        let pipeline = pipeline.clone();
        let persist_pool = persist_pool.clone();
        let fanout = fanout.clone();
        let cache = cache.clone();
        let period = config.persist.batch_tick();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let metrics = persist_pool.metrics();
                info!(
                    sse_invalid_frames = pipeline.invalid_frame_count(),
                    persist_dropped_traffic_delta =
                        metrics.dropped_traffic_delta.load(std::sync::atomic::Ordering::Relaxed),
                    persist_queue_depth = metrics.queue_depth.load(std::sync::atomic::Ordering::Relaxed),
                    fanout_dropped_subscribers = fanout.dropped_subscribers(),
                    fanout_subscriber_count = fanout.subscriber_count().await,
                    cache_lazy_reloads = cache.lazy_reload_count(),
                    "summary"
                );
            }
        })
    };

    let app = routes::router(state);
    let listener = TcpListener::bind(&config.server.listen).await.expect("Failed to bind");

    info!("Server ready");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    // Each endpoint task's future holds the last clones of `pipeline` (and
    // through it, `persist_pool`) left alive once `app` is dropped above —
    // abort alone only requests cancellation, it doesn't guarantee the
    // future (and what it captured) is dropped before we proceed. Awaiting
    // the aborted handle blocks until that drop has actually happened.
    for task in endpoint_tasks {
        task.abort();
        let _ = task.await;
    }
    batch_ticker.abort();
    flush_ticker.abort();
    hourly_ticker.abort();
    daily_sweep_ticker.abort();
    // The summary log ticker holds its own clones of `pipeline` and
    // `persist_pool`; like the endpoint tasks above, it must actually be
    // dropped, not just told to stop, before `Arc::try_unwrap` below.
    summary_log_ticker.abort();
    let _ = summary_log_ticker.await;

    // `pipeline` is the last live reference to `persist_pool` now that every
    // endpoint task and the summary log ticker have actually been dropped
    // (see above) and `app` (which held its own clone per route via
    // `AppState`) was fully consumed when `axum::serve(...)` returned.
    drop(pipeline);

    // Persistence Pool drains its queue within a bounded deadline before
    // exiting (design notes §5: "bounded by a 10s deadline").
    match Arc::try_unwrap(persist_pool) {
        Ok(pool) => pool.drain(config.shutdown.grace()).await,
        Err(_) => {
            warn!("persist pool still referenced at shutdown, skipping drain");
        }
    }
    for worker in persist_workers {
        worker.abort();
    }

    info!("Goodbye");
}
