//! File history (ledger) database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// One row per pointer or sidecar file written by any run.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FileHistoryDbModel {
    pub id: i64,
    pub task_id: Option<i64>,
    pub file_name: String,
    /// Remote path the file was produced from.
    pub source_path: String,
    /// Local path that was written.
    pub target_path: String,
    pub file_size: i64,
    /// strm, metadata or subtitle
    pub file_type: String,
    pub file_suffix: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FileHistoryDbModel {
    pub fn new(
        task_id: i64,
        file_name: impl Into<String>,
        source_path: impl Into<String>,
        target_path: impl Into<String>,
        file_size: i64,
        file_type: FileType,
        file_suffix: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            task_id: Some(task_id),
            file_name: file_name.into(),
            source_path: source_path.into(),
            target_path: target_path.into(),
            file_size,
            file_type: file_type.to_string(),
            file_suffix: file_suffix.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Kind of file recorded in the ledger.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Strm,
    Metadata,
    Subtitle,
}
