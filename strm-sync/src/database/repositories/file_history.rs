//! File history repository (the history ledger).
//!
//! Rows are append-only. The generation engine consults [`FileHistoryRepository::exists`]
//! before recording, and the unique `(source_path, target_path)` index turns a
//! racing duplicate insert into a no-op.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{FileHistoryDbModel, FileType};

/// File history repository trait.
#[async_trait]
pub trait FileHistoryRepository: Send + Sync {
    async fn exists(&self, source_path: &str, target_path: &str) -> Result<bool>;
    /// Append a row. Returns false when the pair was already recorded.
    async fn record(&self, entry: &FileHistoryDbModel) -> Result<bool>;
    async fn bulk_delete(&self, ids: &[i64]) -> Result<u64>;
    async fn clear_all(&self) -> Result<u64>;
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<FileHistoryDbModel>>;
    async fn count(&self) -> Result<i64>;
    /// Rows created within `[from_ms, to_ms)` grouped by file type.
    async fn count_by_type(&self, from_ms: i64, to_ms: i64) -> Result<HashMap<FileType, u64>>;
}

/// SQLx implementation of FileHistoryRepository.
pub struct SqlxFileHistoryRepository {
    pool: SqlitePool,
}

impl SqlxFileHistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileHistoryRepository for SqlxFileHistoryRepository {
    async fn exists(&self, source_path: &str, target_path: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM file_history WHERE source_path = ? AND target_path = ? LIMIT 1",
        )
        .bind(source_path)
        .bind(target_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn record(&self, entry: &FileHistoryDbModel) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO file_history (
                task_id, file_name, source_path, target_path, file_size, file_type,
                file_suffix, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.task_id)
        .bind(&entry.file_name)
        .bind(&entry.source_path)
        .bind(&entry.target_path)
        .bind(entry.file_size)
        .bind(&entry.file_type)
        .bind(&entry.file_suffix)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn bulk_delete(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM file_history WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn clear_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM file_history")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<FileHistoryDbModel>> {
        let rows = sqlx::query_as::<_, FileHistoryDbModel>(
            "SELECT * FROM file_history ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM file_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_by_type(&self, from_ms: i64, to_ms: i64) -> Result<HashMap<FileType, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT file_type, COUNT(*) FROM file_history
            WHERE created_at >= ? AND created_at < ?
            GROUP BY file_type
            "#,
        )
        .bind(from_ms)
        .bind(to_ms)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for (file_type, count) in rows {
            match file_type.parse::<FileType>() {
                Ok(kind) => {
                    counts.insert(kind, count as u64);
                }
                Err(_) => tracing::warn!(file_type = %file_type, "Unknown file type in history"),
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;

    fn entry(source: &str, target: &str, kind: FileType) -> FileHistoryDbModel {
        FileHistoryDbModel::new(1, "a.mp4", source, target, 42, kind, "mp4")
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let repo = SqlxFileHistoryRepository::new(test_pool().await);

        assert!(!repo.exists("/m/a.mp4", "/t/a.strm").await.unwrap());
        assert!(
            repo.record(&entry("/m/a.mp4", "/t/a.strm", FileType::Strm))
                .await
                .unwrap()
        );
        assert!(
            !repo
                .record(&entry("/m/a.mp4", "/t/a.strm", FileType::Strm))
                .await
                .unwrap()
        );
        assert!(repo.exists("/m/a.mp4", "/t/a.strm").await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_stats() {
        let repo = SqlxFileHistoryRepository::new(test_pool().await);
        repo.record(&entry("/m/a.mp4", "/t/a.strm", FileType::Strm))
            .await
            .unwrap();
        repo.record(&entry("/m/b.mp4", "/t/b.strm", FileType::Strm))
            .await
            .unwrap();
        repo.record(&entry("/m/b.nfo", "/t/b.nfo", FileType::Metadata))
            .await
            .unwrap();

        let counts = repo.count_by_type(0, i64::MAX).await.unwrap();
        assert_eq!(counts.get(&FileType::Strm), Some(&2));
        assert_eq!(counts.get(&FileType::Metadata), Some(&1));
        assert_eq!(counts.get(&FileType::Subtitle), None);

        let ids: Vec<i64> = repo
            .list(10, 0)
            .await
            .unwrap()
            .iter()
            .take(2)
            .map(|row| row.id)
            .collect();
        assert_eq!(repo.bulk_delete(&ids).await.unwrap(), 2);
        assert_eq!(repo.bulk_delete(&[]).await.unwrap(), 0);
        assert_eq!(repo.clear_all().await.unwrap(), 1);
        assert_eq!(repo.count().await.unwrap(), 0);
    }
}
