//! Run log database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Run log database model. One row per execution of a task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RunLogDbModel {
    pub id: i64,
    pub task_id: i64,
    /// Status: running, completed, failed, cancelled
    pub status: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration_ms: Option<i64>,
    pub total_file: i64,
    pub generated_file: i64,
    pub skip_file: i64,
    pub overwrite_file: i64,
    pub metadata_count: i64,
    pub subtitle_count: i64,
    pub failed_count: i64,
    pub message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RunLogDbModel {
    /// A fresh `running` log for a task, not yet persisted.
    pub fn started(task_id: i64) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            task_id,
            status: RunStatus::Running.to_string(),
            start_time: now,
            end_time: None,
            duration_ms: None,
            total_file: 0,
            generated_file: 0,
            skip_file: 0,
            overwrite_file: 0,
            metadata_count: 0,
            subtitle_count: 0,
            failed_count: 0,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn run_status(&self) -> Option<RunStatus> {
        self.status.parse().ok()
    }

    pub fn counters(&self) -> RunCounters {
        RunCounters {
            total: self.total_file as u64,
            generated: self.generated_file as u64,
            skipped: self.skip_file as u64,
            overwritten: self.overwrite_file as u64,
            metadata: self.metadata_count as u64,
            subtitle: self.subtitle_count as u64,
            failed: self.failed_count as u64,
        }
    }
}

/// Run status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Per-category counters accumulated during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total: u64,
    pub generated: u64,
    pub skipped: u64,
    pub overwritten: u64,
    pub metadata: u64,
    pub subtitle: u64,
    pub failed: u64,
}

impl RunCounters {
    /// One-line human readable summary used in run log messages.
    pub fn summary(&self) -> String {
        format!(
            "scanned {}, generated {}, overwritten {}, skipped {}, metadata {}, subtitles {}, failed {}",
            self.total,
            self.generated,
            self.overwritten,
            self.skipped,
            self.metadata,
            self.subtitle,
            self.failed
        )
    }
}
