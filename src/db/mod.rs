//! Relational store access (design notes §6).
//!
//! One portable DAO layer per the design notes' re-architecture guidance
//! (replace interleaved per-dialect SQL with a single DAO interface); this
//! crate targets Postgres specifically (the design's non-goals commit to a
//! single relational database, no cross-dialect abstraction needed).

pub mod models;
pub mod repo;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;
use crate::error::CoreResult;

/// Connect to Postgres and run embedded migrations.
pub async fn connect(config: &DatabaseConfig) -> CoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .connect(&config.url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
