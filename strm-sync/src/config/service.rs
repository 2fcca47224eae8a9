//! Configuration service implementation.
//!
//! The ConfigService owns the current [`AppSettings`] snapshot, persists
//! settings and task edits, and broadcasts events for every change.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Result;
use crate::database::models::TaskDbModel;
use crate::database::repositories::{ConfigRepository, TaskRepository};
use crate::generator::naming::SuffixRules;
use crate::scheduler::parse_cron;

use super::events::{ConfigEventBroadcaster, ConfigUpdateEvent};
use super::settings::AppSettings;

/// Observer of settings changes.
///
/// Subscribers keep their own snapshot of the settings they care about and
/// replace it wholesale in `apply_settings`.
pub trait SettingsSubscriber: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    fn apply_settings(&self, settings: &AppSettings);
}

/// Configuration service providing snapshot access to settings and tasks.
pub struct ConfigService {
    config_repo: Arc<dyn ConfigRepository>,
    task_repo: Arc<dyn TaskRepository>,
    snapshot: RwLock<Arc<AppSettings>>,
    broadcaster: ConfigEventBroadcaster,
}

impl ConfigService {
    /// Load the persisted settings and build the service.
    pub async fn load(
        config_repo: Arc<dyn ConfigRepository>,
        task_repo: Arc<dyn TaskRepository>,
    ) -> Result<Self> {
        let row = config_repo.get_global_config().await?;
        let settings = AppSettings::from_db(&row);
        Ok(Self {
            config_repo,
            task_repo,
            snapshot: RwLock::new(Arc::new(settings)),
            broadcaster: ConfigEventBroadcaster::new(),
        })
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Arc<AppSettings> {
        self.snapshot.read().clone()
    }

    /// Subscribe to configuration update events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigUpdateEvent> {
        self.broadcaster.subscribe()
    }

    pub fn broadcaster(&self) -> &ConfigEventBroadcaster {
        &self.broadcaster
    }

    /// Validate, persist and publish new settings.
    pub async fn update_settings(&self, settings: AppSettings) -> Result<()> {
        settings.validate()?;
        let row = settings.to_db()?;
        self.config_repo.update_global_config(&row).await?;

        *self.snapshot.write() = Arc::new(settings);
        self.broadcaster.publish(ConfigUpdateEvent::SettingsUpdated);

        info!("Settings updated");
        Ok(())
    }

    /// Re-read settings from the database and publish them.
    pub async fn reload(&self) -> Result<()> {
        let row = self.config_repo.get_global_config().await?;
        *self.snapshot.write() = Arc::new(AppSettings::from_db(&row));
        self.broadcaster.publish(ConfigUpdateEvent::SettingsUpdated);
        Ok(())
    }

    /// Apply the current snapshot to `subscriber` and keep it updated.
    ///
    /// The listener subscribes before the first apply, so an update published
    /// in between is re-applied rather than lost.
    pub fn attach(self: &Arc<Self>, subscriber: Arc<dyn SettingsSubscriber>) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        subscriber.apply_settings(&self.settings());

        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(ConfigUpdateEvent::SettingsUpdated) => {
                        debug!(subscriber = subscriber.name(), "Applying updated settings");
                        subscriber.apply_settings(&service.settings());
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            subscriber = subscriber.name(),
                            skipped, "Settings listener lagged, re-applying snapshot"
                        );
                        subscriber.apply_settings(&service.settings());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // ========== Tasks ==========

    pub async fn get_task(&self, id: i64) -> Result<TaskDbModel> {
        self.task_repo.get_task(id).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskDbModel>> {
        self.task_repo.list_tasks().await
    }

    pub async fn create_task(&self, task: &TaskDbModel) -> Result<i64> {
        validate_task(task)?;
        let id = self.task_repo.create_task(task).await?;
        self.broadcaster
            .publish(ConfigUpdateEvent::TaskUpdated { task_id: id });
        info!(task_id = id, name = %task.name, "Task created");
        Ok(id)
    }

    pub async fn update_task(&self, task: &TaskDbModel) -> Result<()> {
        validate_task(task)?;
        self.task_repo.update_task(task).await?;
        self.broadcaster
            .publish(ConfigUpdateEvent::TaskUpdated { task_id: task.id });
        info!(task_id = task.id, "Task updated");
        Ok(())
    }

    pub async fn delete_task(&self, id: i64) -> Result<()> {
        self.task_repo.delete_task(id).await?;
        self.broadcaster
            .publish(ConfigUpdateEvent::TaskDeleted { task_id: id });
        info!(task_id = id, "Task deleted");
        Ok(())
    }
}

/// Reject task definitions that could never run.
pub fn validate_task(task: &TaskDbModel) -> Result<()> {
    if task.name.trim().is_empty() {
        return Err(crate::Error::validation("task name must not be empty"));
    }
    if !task.source_path.starts_with('/') {
        return Err(crate::Error::validation(format!(
            "source path {:?} must be absolute",
            task.source_path
        )));
    }
    if task.target_path.trim().is_empty() {
        return Err(crate::Error::validation("target path must not be empty"));
    }
    if SuffixRules::from_task(task).media_is_empty() {
        return Err(crate::Error::validation(format!(
            "file suffix list {:?} has no usable entries",
            task.file_suffix
        )));
    }
    if let Some(expr) = task.cron_expression() {
        parse_cron(expr)?;
    }
    Ok(())
}
