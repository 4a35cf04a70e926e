use crate::config::DatabaseConfig;
use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Thin wrapper so callers depend on our own type rather than `sqlx::PgPool`
/// directly, matching the teacher's separation of pool construction from
/// query code in `database::repository`.
#[derive(Clone)]
pub struct DbPool(PgPool);

impl DbPool {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_seconds))
            .max_lifetime(Duration::from_secs(300))
            .test_before_acquire(true)
            .connect(&config.url)
            .await?;

        Ok(Self(pool))
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.0
    }
}
