//! Notification dispatcher.
//!
//! Run outcomes are written to the `notification_queue` table and delivered
//! by a background worker, so a slow or unreachable channel never holds up
//! synchronization. Failed deliveries are retried after a fixed interval
//! until the retry budget is spent, then marked `failed`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channels::NotificationChannel;
use super::events::{RunNotification, TemplateType};
use super::template::{TemplateConfig, render};
use crate::config::{AppSettings, QueueSettings, SettingsSubscriber};
use crate::database::models::NotificationQueueDbModel;
use crate::database::repositories::NotificationQueueRepository;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Settings-derived state, swapped wholesale on config change.
struct DispatcherState {
    enabled: bool,
    queue: QueueSettings,
    templates: TemplateConfig,
    channels: HashMap<&'static str, Arc<dyn NotificationChannel>>,
}

impl DispatcherState {
    fn build(settings: &AppSettings, client: &Client) -> Self {
        let mut channels: HashMap<&'static str, Arc<dyn NotificationChannel>> = HashMap::new();
        for config in &settings.notification.channels {
            let channel_type = config.channel_type();
            if channels.contains_key(channel_type) {
                warn!(channel_type, "Duplicate notification channel ignored");
                continue;
            }
            channels.insert(channel_type, config.build(client.clone()));
        }
        Self {
            enabled: settings.notification.enabled,
            queue: settings.queue,
            templates: settings.notification.templates.clone(),
            channels,
        }
    }
}

enum Delivery {
    Sent,
    /// Worth another attempt later.
    Retry(String),
    /// Will never succeed as configured.
    Reject(String),
}

pub struct NotificationDispatcher {
    queue: Arc<dyn NotificationQueueRepository>,
    client: Client,
    state: RwLock<Arc<DispatcherState>>,
    cancel: CancellationToken,
}

impl NotificationDispatcher {
    pub fn new(
        queue: Arc<dyn NotificationQueueRepository>,
        client: Client,
        settings: &AppSettings,
    ) -> Self {
        let state = DispatcherState::build(settings, &client);
        Self {
            queue,
            client,
            state: RwLock::new(Arc::new(state)),
            cancel: CancellationToken::new(),
        }
    }

    fn state(&self) -> Arc<DispatcherState> {
        self.state.read().clone()
    }

    /// Configured channel types, enabled or not.
    pub fn channel_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.state().channels.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Queue one notification for a channel.
    pub async fn enqueue(
        &self,
        channel_type: &str,
        template_type: TemplateType,
        payload: &RunNotification,
    ) -> Result<i64> {
        let row = NotificationQueueDbModel::new(
            channel_type,
            template_type.to_string(),
            serde_json::to_string(payload)?,
            template_type.priority(),
        );
        let id = self.queue.enqueue(&row).await?;
        debug!(id, channel_type, %template_type, "Notification queued");
        Ok(id)
    }

    /// Queue a run outcome on every configured channel.
    ///
    /// Returns how many rows were queued; nothing is queued while
    /// notifications are disabled.
    pub async fn enqueue_run_outcome(&self, outcome: &RunNotification) -> Result<usize> {
        let state = self.state();
        if !state.enabled {
            return Ok(0);
        }
        let template_type = outcome.template_type();
        let mut queued = 0;
        for channel_type in state.channels.keys() {
            self.enqueue(channel_type, template_type, outcome).await?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Send a `test` message through a channel right away, bypassing the
    /// queue.
    pub async fn test_channel(&self, channel_type: &str) -> Result<()> {
        let state = self.state();
        let channel = state
            .channels
            .get(channel_type)
            .ok_or_else(|| Error::not_found("notification channel", channel_type))?;
        if !channel.is_enabled() {
            return Err(Error::validation(format!(
                "notification channel {channel_type} is disabled"
            )));
        }
        let payload = serde_json::to_value(RunNotification::sample())?;
        let template = state.templates.resolve(channel_type, TemplateType::Test);
        let rendered = render(template, &payload, channel.escaper());
        channel.send(TemplateType::Test, &rendered, &payload).await
    }

    /// Claim and deliver the events that are due now.
    pub async fn process_due(&self) -> Result<usize> {
        let state = self.state();
        let limit = state.queue.concurrency.max(1);
        let rows = retry_on_sqlite_busy("claim_notifications", || {
            self.queue.claim_due(now_ms(), limit as i64)
        })
        .await?;
        let claimed = rows.len();
        if claimed == 0 {
            return Ok(0);
        }
        debug!(claimed, "Delivering notifications");

        futures::stream::iter(rows)
            .for_each_concurrent(limit, |row| {
                let state = &state;
                async move {
                    let delivery = self.deliver(&row, state).await;
                    self.settle(&row, delivery, &state.queue).await;
                }
            })
            .await;
        Ok(claimed)
    }

    async fn deliver(&self, row: &NotificationQueueDbModel, state: &DispatcherState) -> Delivery {
        let Ok(template_type) = row.template_type.parse::<TemplateType>() else {
            return Delivery::Reject(format!("unknown template type {}", row.template_type));
        };
        let Some(channel) = state.channels.get(row.channel_type.as_str()) else {
            return Delivery::Reject(format!(
                "notification channel {} is not configured",
                row.channel_type
            ));
        };
        if !channel.is_enabled() {
            return Delivery::Reject(format!(
                "notification channel {} is disabled",
                row.channel_type
            ));
        }
        let payload: serde_json::Value = match serde_json::from_str(&row.payload) {
            Ok(payload) => payload,
            Err(e) => return Delivery::Reject(format!("unreadable payload: {e}")),
        };

        let template = state.templates.resolve(&row.channel_type, template_type);
        let rendered = render(template, &payload, channel.escaper());
        match channel.send(template_type, &rendered, &payload).await {
            Ok(()) => Delivery::Sent,
            Err(e) => Delivery::Retry(e.to_string()),
        }
    }

    async fn settle(
        &self,
        row: &NotificationQueueDbModel,
        delivery: Delivery,
        policy: &QueueSettings,
    ) {
        let result = match delivery {
            Delivery::Sent => {
                debug!(id = row.id, channel_type = %row.channel_type, "Notification sent");
                self.queue.mark_sent(row.id).await
            }
            Delivery::Reject(reason) => {
                warn!(id = row.id, channel_type = %row.channel_type, %reason, "Notification rejected");
                self.queue.mark_failed(row.id, row.retry_count, &reason).await
            }
            Delivery::Retry(error) => {
                let retry_count = row.retry_count + 1;
                if retry_count > i64::from(policy.max_retries) {
                    warn!(
                        id = row.id,
                        channel_type = %row.channel_type,
                        retry_count,
                        %error,
                        "Notification failed permanently"
                    );
                    self.queue.mark_failed(row.id, retry_count, &error).await
                } else {
                    let interval_ms = (policy.retry_interval_secs as i64).saturating_mul(1000);
                    debug!(id = row.id, retry_count, %error, "Notification delivery failed, will retry");
                    self.queue
                        .mark_retry(row.id, retry_count, now_ms() + interval_ms, &error)
                        .await
                }
            }
        };
        if let Err(e) = result {
            warn!(id = row.id, error = %e, "Failed to update notification status");
        }
    }

    /// Start the delivery worker.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.queue.reset_in_flight().await {
                Ok(0) => {}
                Ok(n) => info!("Returned {} in-flight notifications to the queue", n),
                Err(e) => warn!(error = %e, "Failed to reset in-flight notifications"),
            }

            loop {
                if let Err(e) = this.process_due().await {
                    warn!(error = %e, "Notification worker pass failed");
                }
                let poll = Duration::from_millis(this.state().queue.poll_interval_ms.max(100));
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            info!("Notification dispatcher stopped");
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl SettingsSubscriber for NotificationDispatcher {
    fn name(&self) -> &'static str {
        "notification-dispatcher"
    }

    fn apply_settings(&self, settings: &AppSettings) {
        let state = DispatcherState::build(settings, &self.client);
        *self.state.write() = Arc::new(state);
    }
}
