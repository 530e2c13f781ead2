use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::{config::AppConfig, error::AppError};

/// Lazily connecting pool; `None` when no database URL is configured so the
/// service can still boot and answer `/health`.
pub fn build_pool(config: &AppConfig) -> Result<Option<PgPool>, AppError> {
    let Some(database_url) = config.supabase_db_url.as_deref() else {
        tracing::warn!("No database URL configured; data endpoints will return 502");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max_connections.max(1))
        .min_connections(
            config
                .db_pool_min_connections
                .min(config.db_pool_max_connections.max(1)),
        )
        .acquire_timeout(Duration::from_secs(config.db_pool_acquire_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.db_pool_idle_timeout_seconds))
        .connect_lazy(database_url)
        .map_err(|error| AppError::Dependency(format!("Invalid database URL: {error}")))?;

    tracing::info!(
        max_connections = config.db_pool_max_connections,
        "Postgres pool configured"
    );
    Ok(Some(pool))
}
