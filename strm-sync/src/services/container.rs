//! Service container for dependency injection.
//!
//! The ServiceContainer wires repositories and services together and
//! manages their background tasks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::config::{ConfigService, SettingsSubscriber};
use crate::database::repositories::{
    SqlxConfigRepository, SqlxFileHistoryRepository, SqlxNotificationQueueRepository,
    SqlxRunLogRepository, SqlxTaskRepository,
};
use crate::database::{MaintenanceConfig, MaintenanceScheduler};
use crate::generator::{GenerationEngine, SyncPipeline};
use crate::notification::NotificationDispatcher;
use crate::remote::{AlistClient, RetryExecutor};
use crate::scheduler::{RunCoordinator, SyncScheduler};
use crate::utils::http_client;

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: SqlitePool,
    pub config_service: Arc<ConfigService>,
    pub remote: Arc<AlistClient>,
    pub retry: Arc<RetryExecutor>,
    pub history: Arc<SqlxFileHistoryRepository>,
    pub coordinator: Arc<RunCoordinator>,
    pub scheduler: Arc<SyncScheduler>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub maintenance: Arc<MaintenanceScheduler>,
    background: Mutex<Vec<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build every service from the database.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let config_repo = Arc::new(SqlxConfigRepository::new(pool.clone()));
        let task_repo = Arc::new(SqlxTaskRepository::new(pool.clone()));
        let run_log_repo = Arc::new(SqlxRunLogRepository::new(pool.clone()));
        let history = Arc::new(SqlxFileHistoryRepository::new(pool.clone()));
        let queue_repo = Arc::new(SqlxNotificationQueueRepository::new(pool.clone()));

        let config_service = Arc::new(ConfigService::load(config_repo, task_repo.clone()).await?);
        let settings = config_service.settings();

        let remote = Arc::new(AlistClient::new(settings.remote.clone())?);
        let retry = Arc::new(RetryExecutor::new(settings.pacing));
        let engine = Arc::new(GenerationEngine::new(
            remote.clone(),
            retry.clone(),
            history.clone(),
        ));

        let dispatcher = Arc::new(NotificationDispatcher::new(
            queue_repo.clone(),
            http_client::default_client_builder().build()?,
            &settings,
        ));

        let coordinator = Arc::new(RunCoordinator::new(
            config_service.clone(),
            task_repo,
            run_log_repo.clone(),
            history.clone(),
            Arc::new(SyncPipeline::new(engine)),
            dispatcher.clone(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            config_service.clone(),
            coordinator.clone(),
        ));
        let maintenance = Arc::new(MaintenanceScheduler::new(
            run_log_repo,
            queue_repo,
            MaintenanceConfig::default(),
        ));

        Ok(Self {
            pool,
            config_service,
            remote,
            retry,
            history,
            coordinator,
            scheduler,
            dispatcher,
            maintenance,
            background: Mutex::new(Vec::new()),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Recover stale runs, subscribe services to settings changes and start
    /// the background workers.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing services");

        self.coordinator.reconcile_on_startup().await?;

        let subscribers: [Arc<dyn SettingsSubscriber>; 5] = [
            self.retry.clone(),
            self.remote.clone(),
            self.dispatcher.clone(),
            self.coordinator.clone(),
            self.maintenance.clone(),
        ];
        let mut background = self.background.lock();
        for subscriber in subscribers {
            background.push(self.config_service.attach(subscriber));
        }

        background.push(self.dispatcher.start());
        background.push(self.scheduler.start());
        background.push(self.maintenance.start());

        info!("Services initialized");
        Ok(())
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        self.scheduler.stop();
        if tokio::time::timeout(timeout, self.coordinator.shutdown())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached, forcing shutdown");
        }
        self.dispatcher.stop();
        self.maintenance.stop();

        for handle in self.background.lock().drain(..) {
            handle.abort();
        }

        info!("Closing database pool...");
        self.pool.close().await;

        info!("Services shut down");
        Ok(())
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
