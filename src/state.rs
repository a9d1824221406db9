//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use sqlx::PgPool;

use crate::aggregate::Aggregator;
use crate::cache::Manager;
use crate::config::Config;
use crate::fanout::Hub;
use crate::ingest::Pipeline;
use crate::persist;

/// Shared application state for the telemetry core's HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub start_time: Instant,
    pub pool: PgPool,
    pub cache: Arc<Manager>,
    pub aggregator: Arc<Aggregator>,
    pub fanout: Arc<Hub>,
    pub persist: Arc<persist::Pool>,
    pub pipeline: Arc<Pipeline>,
}
