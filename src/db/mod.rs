// src/db/mod.rs
// Postgres pool construction and schema bootstrap.

pub mod schema;

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Connect to Postgres and verify the connection.
pub async fn connect(dsn: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(2))
        .connect(dsn)
        .await
        .context("Failed to connect to Postgres")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("Postgres liveness probe failed")?;

    Ok(pool)
}

/// Create all schemas and tables if they do not exist yet.
/// Idempotent; safe to run on every startup.
pub async fn bootstrap(pool: &PgPool) -> Result<()> {
    for stmt in schema::DDL {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .with_context(|| format!("DDL failed: {}", stmt.lines().next().unwrap_or("")))?;
    }
    info!("database schema bootstrap complete");
    Ok(())
}
