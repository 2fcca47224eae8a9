//! Run coordination.
//!
//! The [`RunCoordinator`] owns the per-task state machine
//! `idle → running → {completed, failed, cancelled} → idle`. A task has at
//! most one live run: the in-process map is checked first, then the
//! persisted `running` flag is claimed with a conditional update. Every
//! accepted run ends with exactly one finalized run log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppSettings, ConfigService, SettingsSubscriber};
use crate::database::models::{FileType, RunCounters, RunLogDbModel, RunStatus, TaskDbModel};
use crate::database::repositories::{
    FileHistoryRepository, RunLogAggregate, RunLogFinalization, RunLogRepository, TaskRepository,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{ms_to_datetime, now_ms};
use crate::generator::{GenerationContext, PipelineReport, ProgressSink, SyncPipeline};
use crate::notification::{NotificationDispatcher, RunNotification};
use crate::{Error, Result};

/// Largest page size accepted by [`RunCoordinator::get_run_logs`].
const MAX_PAGE_SIZE: u32 = 200;

/// How long [`RunCoordinator::shutdown`] waits for runs to finalize.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Whether the caller waits for the run to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteMode {
    Sync,
    Async,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub task_id: i64,
    pub run_log_id: i64,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub duration_ms: i64,
    pub message: String,
}

/// Acknowledgement for a run started in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAck {
    pub task_id: i64,
    pub run_log_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Completed(RunSummary),
    Started(RunAck),
}

/// One page of rows plus the total row count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Half-open `[from_ms, to_ms)` window in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from_ms: i64,
    pub to_ms: i64,
}

impl TimeRange {
    /// The last `days` days up to now.
    pub fn last_days(days: u32) -> Self {
        let to_ms = now_ms();
        Self {
            from_ms: to_ms - i64::from(days) * 86_400_000,
            to_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileProcessingStats {
    pub runs: RunLogAggregate,
    pub files_by_type: HashMap<FileType, u64>,
}

#[derive(Debug)]
struct ActiveRun {
    run_log_id: i64,
    cancel: CancellationToken,
}

/// Removes the task from the active map when the run task ends, including
/// by panic.
struct ActiveRunGuard {
    active: Arc<DashMap<i64, ActiveRun>>,
    task_id: i64,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.active.remove(&self.task_id);
    }
}

/// Writes intermediate counters to the run log.
struct RunLogProgress {
    run_logs: Arc<dyn RunLogRepository>,
    run_log_id: i64,
}

#[async_trait]
impl ProgressSink for RunLogProgress {
    async fn report(&self, counters: &RunCounters) {
        if let Err(e) = self.run_logs.update_progress(self.run_log_id, counters).await {
            debug!(run_log_id = self.run_log_id, error = %e, "Failed to record run progress");
        }
    }
}

pub struct RunCoordinator {
    config: Arc<ConfigService>,
    tasks: Arc<dyn TaskRepository>,
    run_logs: Arc<dyn RunLogRepository>,
    history: Arc<dyn FileHistoryRepository>,
    pipeline: Arc<SyncPipeline>,
    notifier: Arc<NotificationDispatcher>,
    active: Arc<DashMap<i64, ActiveRun>>,
    permits: RwLock<Arc<Semaphore>>,
    permit_count: RwLock<usize>,
    shutdown: CancellationToken,
}

impl RunCoordinator {
    pub fn new(
        config: Arc<ConfigService>,
        tasks: Arc<dyn TaskRepository>,
        run_logs: Arc<dyn RunLogRepository>,
        history: Arc<dyn FileHistoryRepository>,
        pipeline: Arc<SyncPipeline>,
        notifier: Arc<NotificationDispatcher>,
    ) -> Self {
        let max_runs = config.settings().scheduler.max_concurrent_runs.max(1);
        Self {
            config,
            tasks,
            run_logs,
            history,
            pipeline,
            notifier,
            active: Arc::new(DashMap::new()),
            permits: RwLock::new(Arc::new(Semaphore::new(max_runs))),
            permit_count: RwLock::new(max_runs),
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether the task has a live run in this process.
    pub fn is_running(&self, task_id: i64) -> bool {
        self.active.contains_key(&task_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Run a task on demand.
    ///
    /// `Sync` waits for the run and returns its summary; `Async` returns as
    /// soon as the run log exists. Both reject a task that is already
    /// running with [`Error::AlreadyRunning`].
    pub async fn execute(
        self: &Arc<Self>,
        task_id: i64,
        mode: ExecuteMode,
    ) -> Result<ExecuteOutcome> {
        let task = self.tasks.get_task(task_id).await?;
        self.start(task, mode).await
    }

    /// Run a task because its schedule fired. Disabled tasks are rejected.
    pub async fn execute_scheduled(self: &Arc<Self>, task_id: i64) -> Result<RunAck> {
        let task = self.tasks.get_task(task_id).await?;
        if !task.enabled {
            return Err(Error::validation(format!("task {task_id} is disabled")));
        }
        match self.start(task, ExecuteMode::Async).await? {
            ExecuteOutcome::Started(ack) => Ok(ack),
            ExecuteOutcome::Completed(summary) => Ok(RunAck {
                task_id: summary.task_id,
                run_log_id: summary.run_log_id,
            }),
        }
    }

    async fn start(
        self: &Arc<Self>,
        task: TaskDbModel,
        mode: ExecuteMode,
    ) -> Result<ExecuteOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let cancel = self.shutdown.child_token();
        match self.active.entry(task.id) {
            Entry::Occupied(_) => return Err(Error::AlreadyRunning { task_id: task.id }),
            Entry::Vacant(slot) => {
                slot.insert(ActiveRun {
                    run_log_id: 0,
                    cancel: cancel.clone(),
                });
            }
        }
        let guard = ActiveRunGuard {
            active: Arc::clone(&self.active),
            task_id: task.id,
        };

        if !self.tasks.try_mark_running(task.id).await? {
            return Err(Error::AlreadyRunning { task_id: task.id });
        }

        // Readiness is only judged for a run that owns the task.
        let settings = self.config.settings();
        if let Err(e) = settings.remote.ensure_ready() {
            self.reject_not_ready(&task, &settings, &e).await;
            self.release_claim(task.id).await;
            drop(guard);
            return Err(e);
        }

        let run_log_id = match self
            .run_logs
            .create_run_log(&RunLogDbModel::started(task.id))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.release_claim(task.id).await;
                return Err(e);
            }
        };
        if let Some(mut run) = self.active.get_mut(&task.id) {
            run.run_log_id = run_log_id;
        }

        info!(task_id = task.id, run_log_id, task = %task.name, "Run started");
        let ack = RunAck {
            task_id: task.id,
            run_log_id,
        };
        let started_at = now_ms();
        let this = Arc::clone(self);
        let run = tokio::spawn(async move {
            this.run(task, run_log_id, settings, cancel, guard).await
        });
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.join_run(ack, started_at, run).await });

        match mode {
            ExecuteMode::Async => Ok(ExecuteOutcome::Started(ack)),
            ExecuteMode::Sync => {
                let summary = handle
                    .await
                    .map_err(|e| Error::Other(format!("run task aborted: {e}")))??;
                Ok(ExecuteOutcome::Completed(summary))
            }
        }
    }

    /// Wait for a run task. A run that panicked never reached its own
    /// finalization, so its log is failed and the persisted flag released
    /// here.
    async fn join_run(
        &self,
        ack: RunAck,
        started_at: i64,
        run: JoinHandle<Result<RunSummary>>,
    ) -> Result<RunSummary> {
        let join_error = match run.await {
            Ok(result) => return result,
            Err(e) => e,
        };
        error!(
            task_id = ack.task_id,
            run_log_id = ack.run_log_id,
            error = %join_error,
            "Run task aborted"
        );

        let finished_at = now_ms();
        let finalization = RunLogFinalization {
            status: RunStatus::Failed,
            end_time: finished_at,
            duration_ms: finished_at - started_at,
            counters: RunCounters::default(),
            message: format!("Failed: run aborted: {join_error}"),
        };
        if let Err(e) = retry_on_sqlite_busy("finalize_run_log", || {
            self.run_logs.finalize(ack.run_log_id, &finalization)
        })
        .await
        {
            error!(run_log_id = ack.run_log_id, error = %e, "Failed to finalize aborted run log");
        }
        self.release_claim(ack.task_id).await;

        Err(Error::Other(format!("run task aborted: {join_error}")))
    }

    async fn release_claim(&self, task_id: i64) {
        if let Err(e) = self.tasks.clear_running(task_id).await {
            warn!(task_id, error = %e, "Failed to release running flag");
        }
    }

    async fn run(
        self: Arc<Self>,
        task: TaskDbModel,
        run_log_id: i64,
        settings: Arc<AppSettings>,
        cancel: CancellationToken,
        guard: ActiveRunGuard,
    ) -> Result<RunSummary> {
        let started_at = now_ms();
        let semaphore = self.permits.read().clone();
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        };

        let report = match permit {
            Some(_permit) => {
                let ctx = GenerationContext::new(&task, &settings);
                let progress = RunLogProgress {
                    run_logs: Arc::clone(&self.run_logs),
                    run_log_id,
                };
                self.pipeline.run(&ctx, &cancel, &progress).await
            }
            None => PipelineReport {
                cancelled: true,
                ..Default::default()
            },
        };

        let finished_at = now_ms();
        let (status, message) = describe(&report);
        let finalization = RunLogFinalization {
            status,
            end_time: finished_at,
            duration_ms: finished_at - started_at,
            counters: report.counters,
            message: message.clone(),
        };

        let finalized = retry_on_sqlite_busy("finalize_run_log", || {
            self.run_logs.finalize(run_log_id, &finalization)
        })
        .await;
        let released = retry_on_sqlite_busy("finish_run", || {
            self.tasks.finish_run(task.id, finished_at)
        })
        .await;
        drop(guard);

        match &finalized {
            Ok(true) => {}
            Ok(false) => warn!(task_id = task.id, run_log_id, "Run log was already finalized"),
            Err(e) => error!(task_id = task.id, run_log_id, error = %e, "Failed to finalize run log"),
        }
        if let Err(e) = &released {
            error!(task_id = task.id, error = %e, "Failed to release running flag");
        }

        info!(
            task_id = task.id,
            run_log_id,
            status = %status,
            duration_ms = finalization.duration_ms,
            "Run finished: {}",
            message
        );

        let notification = RunNotification {
            task_id: task.id,
            task_name: task.name.clone(),
            status: status.to_string(),
            message: message.clone(),
            error: report.fatal.as_ref().map(ToString::to_string),
            started_at: format_time(started_at, &settings),
            finished_at: format_time(finished_at, &settings),
            duration_ms: finalization.duration_ms,
            ..Default::default()
        }
        .with_counters(&report.counters);
        if let Err(e) = self.notifier.enqueue_run_outcome(&notification).await {
            warn!(task_id = task.id, error = %e, "Failed to queue run notification");
        }

        finalized?;
        released?;
        Ok(RunSummary {
            task_id: task.id,
            run_log_id,
            status,
            counters: report.counters,
            duration_ms: finalization.duration_ms,
            message,
        })
    }

    /// Write the single failed run log for a run rejected because the remote
    /// index is not configured, and notify about it.
    async fn reject_not_ready(&self, task: &TaskDbModel, settings: &AppSettings, reason: &Error) {
        warn!(task_id = task.id, error = %reason, "Run rejected, remote index not configured");
        let now = now_ms();
        let message = format!("Run rejected: {reason}");
        let result = async {
            let id = self
                .run_logs
                .create_run_log(&RunLogDbModel::started(task.id))
                .await?;
            self.run_logs
                .finalize(
                    id,
                    &RunLogFinalization {
                        status: RunStatus::Failed,
                        end_time: now,
                        duration_ms: 0,
                        counters: RunCounters::default(),
                        message: message.clone(),
                    },
                )
                .await
        }
        .await;
        if let Err(e) = result {
            error!(task_id = task.id, error = %e, "Failed to record rejected run");
        }

        let notification = RunNotification {
            task_id: task.id,
            task_name: task.name.clone(),
            status: RunStatus::Failed.to_string(),
            message,
            error: Some(reason.to_string()),
            started_at: format_time(now, settings),
            finished_at: format_time(now, settings),
            ..Default::default()
        };
        if let Err(e) = self.notifier.enqueue_run_outcome(&notification).await {
            warn!(task_id = task.id, error = %e, "Failed to queue run notification");
        }
    }

    /// Ask a live run to stop. Returns false when the task is not running
    /// in this process.
    pub fn cancel(&self, task_id: i64) -> bool {
        match self.active.get(&task_id) {
            Some(run) => {
                info!(task_id, run_log_id = run.run_log_id, "Cancelling run");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Force a task back to idle.
    ///
    /// A live run is cancelled and finalizes itself. Without one, the
    /// persisted flag is cleared and any `running` logs of the task are
    /// failed. Returns true when a live run was cancelled.
    pub async fn reset_status(&self, task_id: i64) -> Result<bool> {
        if self.cancel(task_id) {
            return Ok(true);
        }
        self.tasks.get_task(task_id).await?;
        let cleared = self.tasks.clear_running(task_id).await?;
        let orphaned = self
            .run_logs
            .fail_orphaned(Some(task_id), "Reset by operator")
            .await?;
        info!(task_id, cleared, orphaned, "Task status reset");
        Ok(false)
    }

    /// Recover from an unclean shutdown: no run survives a restart.
    pub async fn reconcile_on_startup(&self) -> Result<u64> {
        let tasks = self.tasks.reset_all_running().await?;
        let logs = self
            .run_logs
            .fail_orphaned(None, "Interrupted by restart")
            .await?;
        if tasks > 0 || logs > 0 {
            warn!(tasks, logs, "Recovered stale runs from previous process");
        }
        Ok(tasks)
    }

    /// A task's run logs, newest first. `page` starts at 1.
    pub async fn get_run_logs(
        &self,
        task_id: i64,
        page: u32,
        page_size: u32,
    ) -> Result<Page<RunLogDbModel>> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = i64::from(page - 1) * i64::from(page_size);
        let items = self
            .run_logs
            .list_for_task(task_id, i64::from(page_size), offset)
            .await?;
        let total = self.run_logs.count_for_task(task_id).await?;
        Ok(Page {
            items,
            total: total.max(0) as u64,
            page,
            page_size,
        })
    }

    pub async fn get_file_processing_stats(&self, range: TimeRange) -> Result<FileProcessingStats> {
        if range.to_ms < range.from_ms {
            return Err(Error::validation("time range ends before it starts"));
        }
        Ok(FileProcessingStats {
            runs: self.run_logs.aggregate(range.from_ms, range.to_ms).await?,
            files_by_type: self
                .history
                .count_by_type(range.from_ms, range.to_ms)
                .await?,
        })
    }

    /// Cancel every live run and wait for them to finalize.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.active_count(), "Runs still active at shutdown");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("Run coordinator stopped");
    }
}

impl SettingsSubscriber for RunCoordinator {
    fn name(&self) -> &'static str {
        "run-coordinator"
    }

    fn apply_settings(&self, settings: &AppSettings) {
        let wanted = settings.scheduler.max_concurrent_runs.max(1);
        let mut count = self.permit_count.write();
        if *count != wanted {
            // Runs holding permits of the old semaphore finish under the old limit.
            *self.permits.write() = Arc::new(Semaphore::new(wanted));
            info!(from = *count, to = wanted, "Concurrent run limit changed");
            *count = wanted;
        }
    }
}

/// Terminal status and log message for a finished pipeline.
fn describe(report: &PipelineReport) -> (RunStatus, String) {
    let summary = report.counters.summary();
    let (status, mut message) = if report.cancelled {
        (RunStatus::Cancelled, format!("Cancelled: {summary}"))
    } else if let Some(error) = &report.fatal {
        (RunStatus::Failed, format!("Failed: {error}; {summary}"))
    } else {
        (RunStatus::Completed, format!("Completed: {summary}"))
    };
    if !report.failures.is_empty() {
        message.push_str("; failures: ");
        message.push_str(&report.failures.join(", "));
    }
    (status, message)
}

fn format_time(ms: i64, settings: &AppSettings) -> String {
    ms_to_datetime(ms)
        .with_timezone(&settings.scheduler.tz())
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
