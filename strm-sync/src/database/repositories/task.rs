//! Task repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::TaskDbModel;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Task repository trait.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_task(&self, id: i64) -> Result<TaskDbModel>;
    async fn list_tasks(&self) -> Result<Vec<TaskDbModel>>;
    async fn list_enabled_tasks(&self) -> Result<Vec<TaskDbModel>>;
    async fn create_task(&self, task: &TaskDbModel) -> Result<i64>;
    async fn update_task(&self, task: &TaskDbModel) -> Result<()>;
    async fn delete_task(&self, id: i64) -> Result<()>;

    // Run ownership
    /// Atomically flip `running` from false to true. Returns false when the
    /// task was already marked as running.
    async fn try_mark_running(&self, id: i64) -> Result<bool>;
    /// Clear `running` and stamp `last_run_at`.
    async fn finish_run(&self, id: i64, last_run_at: i64) -> Result<()>;
    /// Clear `running` without touching `last_run_at`. Returns true if the flag was set.
    async fn clear_running(&self, id: i64) -> Result<bool>;
    /// Clear every `running` flag (startup reconciliation).
    async fn reset_all_running(&self) -> Result<u64>;
}

/// SQLx implementation of TaskRepository.
pub struct SqlxTaskRepository {
    pool: SqlitePool,
}

impl SqlxTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for SqlxTaskRepository {
    async fn get_task(&self, id: i64) -> Result<TaskDbModel> {
        sqlx::query_as::<_, TaskDbModel>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Task", id))
    }

    async fn list_tasks(&self) -> Result<Vec<TaskDbModel>> {
        let tasks = sqlx::query_as::<_, TaskDbModel>("SELECT * FROM tasks ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(tasks)
    }

    async fn list_enabled_tasks(&self) -> Result<Vec<TaskDbModel>> {
        let tasks =
            sqlx::query_as::<_, TaskDbModel>("SELECT * FROM tasks WHERE enabled = 1 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(tasks)
    }

    async fn create_task(&self, task: &TaskDbModel) -> Result<i64> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                name, media_type, source_path, target_path, file_suffix, overwrite, enabled,
                cron, download_metadata, metadata_suffix, download_subtitle, subtitle_suffix,
                running, last_run_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?)
            "#,
        )
        .bind(&task.name)
        .bind(&task.media_type)
        .bind(&task.source_path)
        .bind(&task.target_path)
        .bind(&task.file_suffix)
        .bind(task.overwrite)
        .bind(task.enabled)
        .bind(&task.cron)
        .bind(task.download_metadata)
        .bind(&task.metadata_suffix)
        .bind(task.download_subtitle)
        .bind(&task.subtitle_suffix)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_task(&self, task: &TaskDbModel) -> Result<()> {
        // running / last_run_at are owned by the coordinator and never written here.
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                name = ?, media_type = ?, source_path = ?, target_path = ?, file_suffix = ?,
                overwrite = ?, enabled = ?, cron = ?, download_metadata = ?, metadata_suffix = ?,
                download_subtitle = ?, subtitle_suffix = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&task.name)
        .bind(&task.media_type)
        .bind(&task.source_path)
        .bind(&task.target_path)
        .bind(&task.file_suffix)
        .bind(task.overwrite)
        .bind(task.enabled)
        .bind(&task.cron)
        .bind(task.download_metadata)
        .bind(&task.metadata_suffix)
        .bind(task.download_subtitle)
        .bind(&task.subtitle_suffix)
        .bind(now_ms())
        .bind(task.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Task", task.id));
        }
        Ok(())
    }

    async fn delete_task(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_mark_running(&self, id: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE tasks SET running = 1, updated_at = ? WHERE id = ? AND running = 0")
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_run(&self, id: i64, last_run_at: i64) -> Result<()> {
        sqlx::query("UPDATE tasks SET running = 0, last_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(last_run_at)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_running(&self, id: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE tasks SET running = 0, updated_at = ? WHERE id = ? AND running = 1")
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_all_running(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE tasks SET running = 0, updated_at = ? WHERE running = 1")
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;

    #[tokio::test]
    async fn test_task_crud_and_running_flag() {
        let repo = SqlxTaskRepository::new(test_pool().await);

        let mut task = TaskDbModel::new("movies", "/media/movies", "/strm/movies");
        task.cron = Some("0 */6 * * *".to_string());
        let id = repo.create_task(&task).await.unwrap();

        let stored = repo.get_task(id).await.unwrap();
        assert_eq!(stored.name, "movies");
        assert_eq!(stored.cron.as_deref(), Some("0 */6 * * *"));
        assert!(!stored.running);

        assert!(repo.try_mark_running(id).await.unwrap());
        assert!(!repo.try_mark_running(id).await.unwrap());

        repo.finish_run(id, 42).await.unwrap();
        let stored = repo.get_task(id).await.unwrap();
        assert!(!stored.running);
        assert_eq!(stored.last_run_at, Some(42));

        assert!(!repo.clear_running(id).await.unwrap());
        assert!(repo.try_mark_running(id).await.unwrap());
        assert_eq!(repo.reset_all_running().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_preserves_run_ownership() {
        let repo = SqlxTaskRepository::new(test_pool().await);
        let id = repo
            .create_task(&TaskDbModel::new("tv", "/media/tv", "/strm/tv"))
            .await
            .unwrap();
        assert!(repo.try_mark_running(id).await.unwrap());

        let mut task = repo.get_task(id).await.unwrap();
        task.running = false;
        task.enabled = false;
        repo.update_task(&task).await.unwrap();

        let stored = repo.get_task(id).await.unwrap();
        assert!(stored.running);
        assert!(!stored.enabled);
        assert!(repo.list_enabled_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_task() {
        let repo = SqlxTaskRepository::new(test_pool().await);
        assert!(matches!(
            repo.get_task(99).await,
            Err(Error::NotFound { .. })
        ));
    }
}
