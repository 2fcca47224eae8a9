//! Database maintenance.
//!
//! Prunes finished run logs and settled notification rows once they are
//! older than their retention period. File history is never pruned here.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AppSettings, SettingsSubscriber};
use crate::database::repositories::{NotificationQueueRepository, RunLogRepository};
use crate::database::time::now_ms;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Configuration for the maintenance scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceConfig {
    /// Interval between maintenance passes (default: 1 hour).
    pub interval: Duration,
    /// Run log retention in days; 0 keeps everything (default: 30).
    pub run_log_retention_days: u32,
    /// Sent/failed notification retention in days; 0 keeps everything
    /// (default: 7).
    pub queue_retention_days: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            run_log_retention_days: 30,
            queue_retention_days: 7,
        }
    }
}

/// Rows removed by one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub run_logs_deleted: u64,
    pub notifications_deleted: u64,
}

/// Database maintenance scheduler.
pub struct MaintenanceScheduler {
    run_logs: Arc<dyn RunLogRepository>,
    queue: Arc<dyn NotificationQueueRepository>,
    config: RwLock<MaintenanceConfig>,
    cancel: CancellationToken,
}

impl MaintenanceScheduler {
    pub fn new(
        run_logs: Arc<dyn RunLogRepository>,
        queue: Arc<dyn NotificationQueueRepository>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            run_logs,
            queue,
            config: RwLock::new(config),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> MaintenanceConfig {
        *self.config.read()
    }

    /// Start the maintenance scheduler.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config().interval);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.run_maintenance().await {
                            tracing::error!("Maintenance error: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Stop the maintenance scheduler.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run all maintenance tasks.
    pub async fn run_maintenance(&self) -> crate::Result<MaintenanceReport> {
        let config = self.config();
        let now = now_ms();
        let mut report = MaintenanceReport::default();

        if config.run_log_retention_days > 0 {
            let cutoff = now - i64::from(config.run_log_retention_days) * DAY_MS;
            report.run_logs_deleted = self.run_logs.cleanup_older_than(cutoff).await?;
        }
        if config.queue_retention_days > 0 {
            let cutoff = now - i64::from(config.queue_retention_days) * DAY_MS;
            report.notifications_deleted = self.queue.cleanup_terminal_older_than(cutoff).await?;
        }

        if report != MaintenanceReport::default() {
            tracing::info!(
                "Database maintenance removed {} run logs and {} notifications",
                report.run_logs_deleted,
                report.notifications_deleted
            );
        }
        Ok(report)
    }
}

impl SettingsSubscriber for MaintenanceScheduler {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    fn apply_settings(&self, settings: &AppSettings) {
        let mut config = self.config.write();
        config.run_log_retention_days = settings.retention.run_log_days;
        config.queue_retention_days = settings.retention.queue_days;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{
        NotificationQueueDbModel, RunCounters, RunLogDbModel, RunStatus,
    };
    use crate::database::repositories::{
        RunLogFinalization, SqlxNotificationQueueRepository, SqlxRunLogRepository,
    };
    use crate::database::test_pool;

    #[tokio::test]
    async fn test_prunes_only_old_terminal_rows() {
        let pool = test_pool().await;
        let run_logs = Arc::new(SqlxRunLogRepository::new(pool.clone()));
        let queue = Arc::new(SqlxNotificationQueueRepository::new(pool.clone()));

        let old = now_ms() - 40 * DAY_MS;
        let mut finished = RunLogDbModel::started(1);
        finished.start_time = old;
        finished.created_at = old;
        let finished_id = run_logs.create_run_log(&finished).await.unwrap();
        run_logs
            .finalize(
                finished_id,
                &RunLogFinalization {
                    status: RunStatus::Completed,
                    end_time: old,
                    duration_ms: 0,
                    counters: RunCounters::default(),
                    message: "done".to_string(),
                },
            )
            .await
            .unwrap();
        let mut stale_running = RunLogDbModel::started(2);
        stale_running.start_time = old;
        stale_running.created_at = old;
        run_logs.create_run_log(&stale_running).await.unwrap();
        run_logs
            .create_run_log(&RunLogDbModel::started(3))
            .await
            .unwrap();

        let sent_id = queue
            .enqueue(&NotificationQueueDbModel::new("webhook", "test", "{}", 0))
            .await
            .unwrap();
        queue.mark_sent(sent_id).await.unwrap();

        let scheduler = MaintenanceScheduler::new(
            run_logs.clone(),
            queue.clone(),
            MaintenanceConfig::default(),
        );
        let report = scheduler.run_maintenance().await.unwrap();
        assert_eq!(report.run_logs_deleted, 1);
        // The sent row is fresh.
        assert_eq!(report.notifications_deleted, 0);

        assert!(run_logs.get_run_log(finished_id).await.is_err());
        assert_eq!(run_logs.count_for_task(2).await.unwrap(), 1);
        assert_eq!(run_logs.count_for_task(3).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zero_retention_keeps_rows() {
        let pool = test_pool().await;
        let scheduler = MaintenanceScheduler::new(
            Arc::new(SqlxRunLogRepository::new(pool.clone())),
            Arc::new(SqlxNotificationQueueRepository::new(pool)),
            MaintenanceConfig {
                run_log_retention_days: 0,
                queue_retention_days: 0,
                ..Default::default()
            },
        );
        assert_eq!(
            scheduler.run_maintenance().await.unwrap(),
            MaintenanceReport::default()
        );
    }
}
