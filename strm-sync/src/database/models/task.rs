//! Task database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Synchronization task database model.
///
/// Created and edited by the configuration surface. During a run the
/// `running` and `last_run_at` columns belong to the run coordinator.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskDbModel {
    pub id: i64,
    pub name: String,
    /// Free-form media tag (movie, tv, ...).
    pub media_type: String,
    /// Remote root path mirrored by this task.
    pub source_path: String,
    /// Local root under which pointer files are written.
    pub target_path: String,
    /// Comma separated media suffixes, without the leading dot.
    pub file_suffix: String,
    pub overwrite: bool,
    pub enabled: bool,
    /// Optional cron expression (5 or 6 fields).
    pub cron: Option<String>,
    pub download_metadata: bool,
    pub metadata_suffix: String,
    pub download_subtitle: bool,
    pub subtitle_suffix: String,
    pub running: bool,
    /// Unix epoch milliseconds of the last finished run.
    pub last_run_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskDbModel {
    /// Build a new, not yet persisted task with default sidecar settings.
    pub fn new(
        name: impl Into<String>,
        source_path: impl Into<String>,
        target_path: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            name: name.into(),
            media_type: "movie".to_string(),
            source_path: source_path.into(),
            target_path: target_path.into(),
            file_suffix: "mp4,mkv".to_string(),
            overwrite: false,
            enabled: true,
            cron: None,
            download_metadata: false,
            metadata_suffix: "nfo,jpg,png".to_string(),
            download_subtitle: false,
            subtitle_suffix: "srt,ass,ssa".to_string(),
            running: false,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The trimmed cron expression, if the task is scheduled.
    pub fn cron_expression(&self) -> Option<&str> {
        self.cron
            .as_deref()
            .map(str::trim)
            .filter(|expr| !expr.is_empty())
    }
}
