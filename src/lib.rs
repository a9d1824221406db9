#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! ndp-telemetry-core library — the server-side telemetry core for a
//! tunnel-fleet control plane.
//!
//! Re-exports the key building blocks:
//! - `cache` — authoritative in-memory projection of the live fleet
//! - `endpoint` — outbound REST+SSE client, one per configured endpoint
//! - `ingest` — decodes SSE frames, drives the cache, notifies listeners
//! - `persist` — batched, bounded-queue writeback to Postgres
//! - `aggregate` — sliding-window metrics aggregation and hourly rollups
//! - `retention` — scheduled cleanup of time-bucketed history
//! - `fanout` — live push to browser SSE/WebSocket subscribers
//! - `routes` — the core's own exposed HTTP surface (health, SSE, WS)
//! - `db` — Postgres connection and query layer
//! - `config` — configuration loading
//! - `error` — typed error taxonomy

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod db;
pub mod endpoint;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod persist;
pub mod retention;
pub mod routes;
pub mod state;
pub mod util;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use state::AppState;
