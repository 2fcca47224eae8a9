//! Configuration repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::GlobalConfigDbModel;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Configuration repository trait.
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn get_global_config(&self) -> Result<GlobalConfigDbModel>;
    async fn update_global_config(&self, config: &GlobalConfigDbModel) -> Result<()>;
}

/// SQLx implementation of ConfigRepository.
pub struct SqlxConfigRepository {
    pool: SqlitePool,
}

impl SqlxConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigRepository for SqlxConfigRepository {
    async fn get_global_config(&self) -> Result<GlobalConfigDbModel> {
        // The row is seeded by the initial migration; recreate it if someone deleted it.
        sqlx::query("INSERT OR IGNORE INTO global_config (id) VALUES (1)")
            .execute(&self.pool)
            .await?;

        sqlx::query_as::<_, GlobalConfigDbModel>("SELECT * FROM global_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("GlobalConfig", 1))
    }

    async fn update_global_config(&self, config: &GlobalConfigDbModel) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE global_config SET
                alist_host = ?,
                alist_token = ?,
                alist_public_host = ?,
                alist_per_page = ?,
                alist_refresh = ?,
                max_retries = ?,
                retry_delay_ms = ?,
                req_delay_ms = ?,
                strm_replace_suffix = ?,
                strm_url_encode = ?,
                strm_extension = ?,
                sidecar_batch_size = ?,
                max_concurrent_runs = ?,
                scheduler_tick_ms = ?,
                scheduler_timezone = ?,
                queue_max_retries = ?,
                queue_retry_interval_secs = ?,
                queue_concurrency = ?,
                queue_poll_interval_ms = ?,
                notification_enabled = ?,
                notification_channels = ?,
                notification_templates = ?,
                run_log_retention_days = ?,
                queue_retention_days = ?,
                updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(&config.alist_host)
        .bind(&config.alist_token)
        .bind(&config.alist_public_host)
        .bind(config.alist_per_page)
        .bind(config.alist_refresh)
        .bind(config.max_retries)
        .bind(config.retry_delay_ms)
        .bind(config.req_delay_ms)
        .bind(config.strm_replace_suffix)
        .bind(config.strm_url_encode)
        .bind(&config.strm_extension)
        .bind(config.sidecar_batch_size)
        .bind(config.max_concurrent_runs)
        .bind(config.scheduler_tick_ms)
        .bind(&config.scheduler_timezone)
        .bind(config.queue_max_retries)
        .bind(config.queue_retry_interval_secs)
        .bind(config.queue_concurrency)
        .bind(config.queue_poll_interval_ms)
        .bind(config.notification_enabled)
        .bind(&config.notification_channels)
        .bind(&config.notification_templates)
        .bind(config.run_log_retention_days)
        .bind(config.queue_retention_days)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
