// crates/ridership-core/src/db.rs

use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::Result;

pub type DbPool = Pool<Postgres>;

/// Establishes the warehouse connection pool.
///
/// The pipeline uses the pool strictly serially; `max_connections` only
/// bounds how many sessions a run may hold open at once.
pub async fn connect(config: &PipelineConfig) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await?;

    info!(max_connections = config.max_connections, "Warehouse connection pool established");
    Ok(pool)
}

/// Connects with default pool settings, for tests and one-off tooling.
pub async fn connect_url(database_url: &str) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}
