//! Notification payloads.

use serde::{Deserialize, Serialize};

use crate::database::models::{RunCounters, RunStatus};

/// Which template a queued notification is rendered with.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TemplateType {
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    Test,
}

impl TemplateType {
    pub fn for_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Failed => Self::TaskFailed,
            RunStatus::Cancelled => Self::TaskCancelled,
            RunStatus::Running | RunStatus::Completed => Self::TaskCompleted,
        }
    }

    /// Queue priority; failures are delivered first.
    pub fn priority(&self) -> i64 {
        match self {
            Self::TaskFailed => 2,
            Self::TaskCancelled => 1,
            Self::TaskCompleted | Self::Test => 0,
        }
    }
}

/// Outcome of a run, as delivered to notification channels.
///
/// Serialized into the queue row; template placeholders refer to these
/// field names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunNotification {
    pub task_id: i64,
    pub task_name: String,
    pub status: String,
    pub total: u64,
    pub generated: u64,
    pub skipped: u64,
    pub overwritten: u64,
    pub metadata: u64,
    pub subtitle: u64,
    pub failed: u64,
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: i64,
}

impl RunNotification {
    pub fn with_counters(mut self, counters: &RunCounters) -> Self {
        self.total = counters.total;
        self.generated = counters.generated;
        self.skipped = counters.skipped;
        self.overwritten = counters.overwritten;
        self.metadata = counters.metadata;
        self.subtitle = counters.subtitle;
        self.failed = counters.failed;
        self
    }

    /// Template matching the run's terminal status.
    pub fn template_type(&self) -> TemplateType {
        self.status
            .parse::<RunStatus>()
            .map(TemplateType::for_status)
            .unwrap_or(TemplateType::TaskCompleted)
    }

    /// Payload used by channel tests.
    pub fn sample() -> Self {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        Self {
            task_id: 0,
            task_name: "strm-sync".to_string(),
            status: RunStatus::Completed.to_string(),
            message: "Test notification".to_string(),
            started_at: now.clone(),
            finished_at: now,
            ..Default::default()
        }
    }
}
