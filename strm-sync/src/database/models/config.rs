//! Global configuration database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Runtime settings row (`global_config`, always `id = 1`).
///
/// `notification_channels` and `notification_templates` are JSON blobs.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GlobalConfigDbModel {
    pub id: i64,
    pub alist_host: String,
    pub alist_token: String,
    pub alist_public_host: String,
    pub alist_per_page: i64,
    pub alist_refresh: bool,
    pub max_retries: i64,
    pub retry_delay_ms: i64,
    pub req_delay_ms: i64,
    pub strm_replace_suffix: bool,
    pub strm_url_encode: bool,
    pub strm_extension: String,
    pub sidecar_batch_size: i64,
    pub max_concurrent_runs: i64,
    pub scheduler_tick_ms: i64,
    pub scheduler_timezone: String,
    pub queue_max_retries: i64,
    pub queue_retry_interval_secs: i64,
    pub queue_concurrency: i64,
    pub queue_poll_interval_ms: i64,
    pub notification_enabled: bool,
    pub notification_channels: String,
    pub notification_templates: String,
    pub run_log_retention_days: i64,
    pub queue_retention_days: i64,
    pub updated_at: i64,
}
