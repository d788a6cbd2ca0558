//! Durable-store connection setup.
//!
//! Absent `DATABASE_URL` selects dev mode: the authenticator and quota
//! counter fall back to their in-memory implementations and the log
//! pipeline discards batches via `log_pipeline::noop_sink`.

use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;

pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Option<sqlx::PgPool>> {
    let Some(url) = &config.url else {
        tracing::info!("DATABASE_URL not set, running in dev mode (in-memory quota, no auth store)");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .connect(url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(Some(pool))
}
