//! Typed runtime settings.
//!
//! [`AppSettings`] is an immutable snapshot built from the `global_config`
//! row. Services never read the row directly; they receive a snapshot when
//! they are constructed and a fresh one on every settings change.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::database::models::GlobalConfigDbModel;
use crate::database::time::now_ms;
use crate::notification::{ChannelConfig, TemplateConfig};
use crate::{Error, Result};

/// Listing page size used when the configured value is zero.
pub const DEFAULT_PER_PAGE: u32 = 100;

/// Connection details for the remote index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Internal base URL used for API calls and raw downloads.
    pub host: String,
    pub token: String,
    /// External-facing base URL written into pointer files. Empty means `host`.
    pub public_host: String,
    pub per_page: u32,
    /// Ask the index to refresh its cache when listing.
    pub refresh: bool,
}

impl RemoteSettings {
    /// Base URL for URLs written into pointer files.
    pub fn playback_host(&self) -> &str {
        let public = self.public_host.trim();
        if public.is_empty() {
            self.host.trim()
        } else {
            public
        }
    }

    pub fn effective_per_page(&self) -> u32 {
        if self.per_page == 0 {
            DEFAULT_PER_PAGE
        } else {
            self.per_page
        }
    }

    /// Fail with a configuration error when a run could not reach the index.
    pub fn ensure_ready(&self) -> Result<()> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(Error::config("remote host is not configured"));
        }
        if self.token.trim().is_empty() {
            return Err(Error::config("remote token is not configured"));
        }
        url::Url::parse(host)
            .map_err(|e| Error::config(format!("remote host {host:?} is not a valid URL: {e}")))?;
        Ok(())
    }
}

/// Pacing of remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingSettings {
    /// Total attempts per remote call (at least one).
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub req_delay_ms: u64,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 3000,
            req_delay_ms: 500,
        }
    }
}

/// Pointer file generation options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrmSettings {
    pub replace_suffix: bool,
    pub url_encode: bool,
    pub pointer_extension: String,
    pub sidecar_batch_size: usize,
}

impl Default for StrmSettings {
    fn default() -> Self {
        Self {
            replace_suffix: false,
            url_encode: true,
            pointer_extension: "strm".to_string(),
            sidecar_batch_size: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub max_concurrent_runs: usize,
    pub tick_interval_ms: u64,
    /// IANA timezone name used to evaluate cron expressions.
    pub timezone: String,
}

impl SchedulerSettings {
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            warn!(timezone = %self.timezone, "Unknown scheduler timezone, using UTC");
            chrono_tz::UTC
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub max_retries: u32,
    pub retry_interval_secs: u64,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub channels: Vec<ChannelConfig>,
    pub templates: TemplateConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSettings {
    pub run_log_days: u32,
    pub queue_days: u32,
}

/// Complete runtime settings snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    pub remote: RemoteSettings,
    pub pacing: PacingSettings,
    pub strm: StrmSettings,
    pub scheduler: SchedulerSettings,
    pub queue: QueueSettings,
    pub notification: NotificationSettings,
    pub retention: RetentionSettings,
}

fn non_negative(value: i64) -> u64 {
    value.max(0) as u64
}

impl AppSettings {
    /// Build a snapshot from the persisted row.
    ///
    /// Malformed JSON columns are logged and replaced by empty values so a
    /// bad notification config never prevents synchronization.
    pub fn from_db(row: &GlobalConfigDbModel) -> Self {
        let channels = serde_json::from_str::<Vec<ChannelConfig>>(&row.notification_channels)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Invalid notification_channels JSON, ignoring channels");
                Vec::new()
            });
        let templates = serde_json::from_str::<TemplateConfig>(&row.notification_templates)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Invalid notification_templates JSON, using defaults");
                TemplateConfig::default()
            });

        Self {
            remote: RemoteSettings {
                host: row.alist_host.clone(),
                token: row.alist_token.clone(),
                public_host: row.alist_public_host.clone(),
                per_page: non_negative(row.alist_per_page).min(u32::MAX as u64) as u32,
                refresh: row.alist_refresh,
            },
            pacing: PacingSettings {
                max_retries: non_negative(row.max_retries).max(1) as u32,
                retry_delay_ms: non_negative(row.retry_delay_ms),
                req_delay_ms: non_negative(row.req_delay_ms),
            },
            strm: StrmSettings {
                replace_suffix: row.strm_replace_suffix,
                url_encode: row.strm_url_encode,
                pointer_extension: normalize_extension(&row.strm_extension),
                sidecar_batch_size: non_negative(row.sidecar_batch_size).max(1) as usize,
            },
            scheduler: SchedulerSettings {
                max_concurrent_runs: non_negative(row.max_concurrent_runs).max(1) as usize,
                tick_interval_ms: non_negative(row.scheduler_tick_ms).max(100),
                timezone: row.scheduler_timezone.clone(),
            },
            queue: QueueSettings {
                max_retries: non_negative(row.queue_max_retries) as u32,
                retry_interval_secs: non_negative(row.queue_retry_interval_secs),
                concurrency: non_negative(row.queue_concurrency).max(1) as usize,
                poll_interval_ms: non_negative(row.queue_poll_interval_ms).max(100),
            },
            notification: NotificationSettings {
                enabled: row.notification_enabled,
                channels,
                templates,
            },
            retention: RetentionSettings {
                run_log_days: non_negative(row.run_log_retention_days) as u32,
                queue_days: non_negative(row.queue_retention_days) as u32,
            },
        }
    }

    /// Convert back into the persisted row.
    pub fn to_db(&self) -> Result<GlobalConfigDbModel> {
        Ok(GlobalConfigDbModel {
            id: 1,
            alist_host: self.remote.host.trim().to_string(),
            alist_token: self.remote.token.clone(),
            alist_public_host: self.remote.public_host.trim().to_string(),
            alist_per_page: self.remote.per_page as i64,
            alist_refresh: self.remote.refresh,
            max_retries: self.pacing.max_retries as i64,
            retry_delay_ms: self.pacing.retry_delay_ms as i64,
            req_delay_ms: self.pacing.req_delay_ms as i64,
            strm_replace_suffix: self.strm.replace_suffix,
            strm_url_encode: self.strm.url_encode,
            strm_extension: self.strm.pointer_extension.clone(),
            sidecar_batch_size: self.strm.sidecar_batch_size as i64,
            max_concurrent_runs: self.scheduler.max_concurrent_runs as i64,
            scheduler_tick_ms: self.scheduler.tick_interval_ms as i64,
            scheduler_timezone: self.scheduler.timezone.clone(),
            queue_max_retries: self.queue.max_retries as i64,
            queue_retry_interval_secs: self.queue.retry_interval_secs as i64,
            queue_concurrency: self.queue.concurrency as i64,
            queue_poll_interval_ms: self.queue.poll_interval_ms as i64,
            notification_enabled: self.notification.enabled,
            notification_channels: serde_json::to_string(&self.notification.channels)?,
            notification_templates: serde_json::to_string(&self.notification.templates)?,
            run_log_retention_days: self.retention.run_log_days as i64,
            queue_retention_days: self.retention.queue_days as i64,
            updated_at: now_ms(),
        })
    }

    /// Reject settings that would make services misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.pacing.max_retries == 0 {
            return Err(Error::validation("max_retries must be at least 1"));
        }
        if self.strm.pointer_extension.is_empty()
            || self.strm.pointer_extension.contains(['/', '\\', '.'])
        {
            return Err(Error::validation(format!(
                "invalid pointer extension {:?}",
                self.strm.pointer_extension
            )));
        }
        if self.scheduler.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(Error::validation(format!(
                "unknown timezone {:?}",
                self.scheduler.timezone
            )));
        }
        if self.scheduler.max_concurrent_runs == 0 || self.queue.concurrency == 0 {
            return Err(Error::validation("concurrency limits must be at least 1"));
        }
        let public = self.remote.public_host.trim();
        if !public.is_empty() {
            url::Url::parse(public)
                .map_err(|e| Error::validation(format!("invalid public host: {e}")))?;
        }
        Ok(())
    }
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().trim_start_matches('.');
    if ext.is_empty() {
        "strm".to_string()
    } else {
        ext.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> GlobalConfigDbModel {
        GlobalConfigDbModel {
            id: 1,
            alist_host: "http://127.0.0.1:5244".to_string(),
            alist_token: "token".to_string(),
            alist_public_host: String::new(),
            alist_per_page: 0,
            alist_refresh: false,
            max_retries: 0,
            retry_delay_ms: 3000,
            req_delay_ms: 500,
            strm_replace_suffix: true,
            strm_url_encode: true,
            strm_extension: ".strm".to_string(),
            sidecar_batch_size: 4,
            max_concurrent_runs: 2,
            scheduler_tick_ms: 1000,
            scheduler_timezone: "Asia/Shanghai".to_string(),
            queue_max_retries: 3,
            queue_retry_interval_secs: 60,
            queue_concurrency: 2,
            queue_poll_interval_ms: 1000,
            notification_enabled: true,
            notification_channels: "not json".to_string(),
            notification_templates: "{}".to_string(),
            run_log_retention_days: 30,
            queue_retention_days: 7,
            updated_at: 0,
        }
    }

    #[test]
    fn test_from_db_normalizes_values() {
        let settings = AppSettings::from_db(&row());
        assert_eq!(settings.remote.effective_per_page(), DEFAULT_PER_PAGE);
        assert_eq!(settings.pacing.max_retries, 1);
        assert_eq!(settings.strm.pointer_extension, "strm");
        assert!(settings.notification.channels.is_empty());
        assert_eq!(settings.scheduler.tz(), chrono_tz::Asia::Shanghai);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_remote_readiness() {
        let mut settings = AppSettings::from_db(&row());
        assert!(settings.remote.ensure_ready().is_ok());
        assert_eq!(settings.remote.playback_host(), "http://127.0.0.1:5244");

        settings.remote.public_host = "https://media.example.com".to_string();
        assert_eq!(settings.remote.playback_host(), "https://media.example.com");

        settings.remote.token.clear();
        assert!(matches!(
            settings.remote.ensure_ready(),
            Err(Error::Configuration(_))
        ));

        settings.remote.token = "t".to_string();
        settings.remote.host = "not a url".to_string();
        assert!(settings.remote.ensure_ready().is_err());
    }

    #[test]
    fn test_to_db_round_trip_keeps_channels() {
        let mut settings = AppSettings::from_db(&row());
        settings.scheduler.timezone = "Mars/Olympus".to_string();
        assert!(settings.validate().is_err());

        settings.scheduler.timezone = "UTC".to_string();
        let db = settings.to_db().unwrap();
        assert_eq!(db.notification_channels, "[]");
        assert_eq!(db.max_retries, 1);
    }
}
