//! Notification queue database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// A queued notification awaiting (or finished with) delivery.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationQueueDbModel {
    pub id: i64,
    /// Channel type: telegram, wework, webhook
    pub channel_type: String,
    /// Template type: task_completed, task_failed, ...
    pub template_type: String,
    /// JSON blob of the event payload
    pub payload: String,
    /// Status: pending, sending, sent, failed
    pub status: String,
    pub priority: i64,
    pub retry_count: i64,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub sent_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl NotificationQueueDbModel {
    pub fn new(
        channel_type: impl Into<String>,
        template_type: impl Into<String>,
        payload: impl Into<String>,
        priority: i64,
    ) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            channel_type: channel_type.into(),
            template_type: template_type.into(),
            payload: payload.into(),
            status: QueueStatus::Pending.to_string(),
            priority,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn queue_status(&self) -> Option<QueueStatus> {
        self.status.parse().ok()
    }
}

/// Delivery status of a queued notification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}
