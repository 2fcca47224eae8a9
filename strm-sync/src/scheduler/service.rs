//! Cron-driven run triggering.
//!
//! The SyncScheduler keeps the next fire time of every enabled task that has
//! a cron expression and asks the [`RunCoordinator`] to start due tasks. A
//! tick that finds its task already running is dropped; missed ticks are
//! never replayed.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::RunCoordinator;
use crate::config::{ConfigService, ConfigUpdateEvent};
use crate::{Error, Result};

/// Interval between full cache rebuilds.
const REBUILD_INTERVAL: Duration = Duration::from_secs(60);

/// Parse a cron expression.
///
/// Five-field expressions get a `0` seconds field prepended.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::validation(format!("invalid cron expression {expr:?}: {e}")))
}

struct ScheduledTask {
    name: String,
    expression: String,
    schedule: Schedule,
    next_fire: Option<DateTime<Utc>>,
}

pub struct SyncScheduler {
    config: Arc<ConfigService>,
    coordinator: Arc<RunCoordinator>,
    entries: Mutex<HashMap<i64, ScheduledTask>>,
    cancel: CancellationToken,
}

impl SyncScheduler {
    pub fn new(config: Arc<ConfigService>, coordinator: Arc<RunCoordinator>) -> Self {
        Self {
            config,
            coordinator,
            entries: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn next_after(&self, schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tz = self.config.settings().scheduler.tz();
        schedule
            .after(&now.with_timezone(&tz))
            .next()
            .map(|next| next.with_timezone(&Utc))
    }

    /// Reload scheduled tasks.
    ///
    /// Tasks whose expression did not change keep their pending fire time.
    pub async fn rebuild(&self) -> Result<usize> {
        let tasks = self.config.list_tasks().await?;
        let now = Utc::now();
        let mut previous = std::mem::take(&mut *self.entries.lock());
        let mut next_entries = HashMap::new();

        for task in tasks.into_iter().filter(|t| t.enabled) {
            let Some(expression) = task.cron_expression() else {
                continue;
            };
            let schedule = match parse_cron(expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "Task not scheduled");
                    continue;
                }
            };
            let next_fire = match previous.remove(&task.id) {
                Some(old) if old.expression == expression => old.next_fire,
                _ => self.next_after(&schedule, now),
            };
            next_entries.insert(
                task.id,
                ScheduledTask {
                    name: task.name.clone(),
                    expression: expression.to_string(),
                    schedule,
                    next_fire,
                },
            );
        }

        let count = next_entries.len();
        *self.entries.lock() = next_entries;
        debug!(count, "Schedule rebuilt");
        Ok(count)
    }

    /// Tasks whose fire time has passed. Their next fire time is computed
    /// from `now`, so ticks missed while busy are not replayed.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Vec<i64> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();
        for (task_id, entry) in entries.iter_mut() {
            if entry.next_fire.is_some_and(|at| at <= now) {
                due.push(*task_id);
                entry.next_fire = self.next_after(&entry.schedule, now);
            }
        }
        due.sort_unstable();
        due
    }

    /// Start every due task that is not already running. Returns how many
    /// runs were started.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let mut started = 0;
        for task_id in self.due_tasks(now) {
            if self.coordinator.is_running(task_id) {
                debug!(task_id, "Scheduled run dropped, task is running");
                continue;
            }
            match self.coordinator.execute_scheduled(task_id).await {
                Ok(ack) => {
                    started += 1;
                    let name = self
                        .entries
                        .lock()
                        .get(&task_id)
                        .map(|e| e.name.clone())
                        .unwrap_or_default();
                    info!(task_id, run_log_id = ack.run_log_id, task = %name, "Scheduled run started");
                }
                Err(Error::AlreadyRunning { .. }) => {
                    debug!(task_id, "Scheduled run dropped, task is running");
                }
                Err(e) => warn!(task_id, error = %e, "Scheduled run not started"),
            }
        }
        started
    }

    /// Start the scheduling loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = this.config.subscribe();
            let mut events_open = true;
            if let Err(e) = this.rebuild().await {
                warn!(error = %e, "Failed to build schedule");
            }

            let mut tick = tick_interval(&this);
            let mut rebuild = tokio::time::interval(REBUILD_INTERVAL);
            rebuild.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    event = events.recv(), if events_open => {
                        let event = match event {
                            Ok(event) => Some(event),
                            Err(RecvError::Lagged(skipped)) => {
                                debug!(skipped, "Scheduler lagged behind config events");
                                None
                            }
                            Err(RecvError::Closed) => {
                                events_open = false;
                                continue;
                            }
                        };
                        if matches!(event, Some(ConfigUpdateEvent::SettingsUpdated) | None) {
                            tick = tick_interval(&this);
                        }
                        if let Err(e) = this.rebuild().await {
                            warn!(error = %e, "Failed to rebuild schedule");
                        }
                    }
                    _ = tick.tick() => {
                        this.tick(Utc::now()).await;
                    }
                    _ = rebuild.tick() => {
                        if let Err(e) = this.rebuild().await {
                            warn!(error = %e, "Failed to rebuild schedule");
                        }
                    }
                }
            }
            info!("Scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

fn tick_interval(scheduler: &SyncScheduler) -> tokio::time::Interval {
    let ms = scheduler.config.settings().scheduler.tick_interval_ms.max(100);
    let mut interval = tokio::time::interval(Duration::from_millis(ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{RunLogRepository, TaskRepository};
    use crate::scheduler::coordinator::tests::{Harness, harness, wait_idle};

    #[test]
    fn test_parse_cron() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron(" 0 0 3 * * * ").is_ok());
        assert!(matches!(parse_cron("every day"), Err(Error::Validation(_))));
    }

    async fn scheduled(cron: &str) -> (Harness, SyncScheduler) {
        let h = harness().await;
        let mut task = h.tasks.get_task(h.task_id).await.unwrap();
        task.cron = Some(cron.to_string());
        h.config.update_task(&task).await.unwrap();
        let scheduler = SyncScheduler::new(h.config.clone(), h.coordinator.clone());
        assert_eq!(scheduler.rebuild().await.unwrap(), 1);
        (h, scheduler)
    }

    fn force_due(scheduler: &SyncScheduler, task_id: i64) {
        scheduler
            .entries
            .lock()
            .get_mut(&task_id)
            .unwrap()
            .next_fire = Some(Utc::now() - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_due_tasks_advance_without_backlog() {
        let (h, scheduler) = scheduled("* * * * *").await;
        let now = Utc::now();
        assert!(scheduler.due_tasks(now).is_empty());

        // Fire time far in the past: one due result, next fire in the future.
        scheduler.entries.lock().get_mut(&h.task_id).unwrap().next_fire =
            Some(now - chrono::Duration::hours(3));
        assert_eq!(scheduler.due_tasks(now), vec![h.task_id]);
        assert!(scheduler.due_tasks(now).is_empty());
        let next = scheduler.entries.lock()[&h.task_id].next_fire.unwrap();
        assert!(next > now);

        // Rebuild keeps the pending fire time for an unchanged expression.
        scheduler.rebuild().await.unwrap();
        assert_eq!(scheduler.entries.lock()[&h.task_id].next_fire, Some(next));
    }

    #[tokio::test]
    async fn test_tick_while_running_is_dropped() {
        let (h, scheduler) = scheduled("* * * * *").await;
        assert!(h.tasks.try_mark_running(h.task_id).await.unwrap());

        force_due(&scheduler, h.task_id);
        assert_eq!(scheduler.tick(Utc::now()).await, 0);
        assert_eq!(h.run_logs.count_for_task(h.task_id).await.unwrap(), 0);
        // Nothing queued: the next tick is not due yet.
        assert!(scheduler.due_tasks(Utc::now()).is_empty());

        h.tasks.clear_running(h.task_id).await.unwrap();
        force_due(&scheduler, h.task_id);
        assert_eq!(scheduler.tick(Utc::now()).await, 1);
        wait_idle(&h.coordinator, h.task_id).await;
        assert_eq!(h.run_logs.count_for_task(h.task_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disabled_and_invalid_tasks_are_not_scheduled() {
        let (h, scheduler) = scheduled("* * * * *").await;
        let mut task = h.tasks.get_task(h.task_id).await.unwrap();
        task.enabled = false;
        h.config.update_task(&task).await.unwrap();
        assert_eq!(scheduler.rebuild().await.unwrap(), 0);

        // Bypass validation to store an expression the scheduler must skip.
        task.enabled = true;
        task.cron = Some("not a cron".to_string());
        h.tasks.update_task(&task).await.unwrap();
        assert_eq!(scheduler.rebuild().await.unwrap(), 0);
    }
}
