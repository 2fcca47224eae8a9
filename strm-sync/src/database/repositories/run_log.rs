//! Run log repository.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::database::models::{RunCounters, RunLogDbModel, RunStatus};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Aggregated run counters over a time range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogAggregate {
    pub runs: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub running: u64,
    pub counters: RunCounters,
}

/// Terminal values written when a run log is finalized.
#[derive(Debug, Clone)]
pub struct RunLogFinalization {
    pub status: RunStatus,
    pub end_time: i64,
    pub duration_ms: i64,
    pub counters: RunCounters,
    pub message: String,
}

/// Run log repository trait.
#[async_trait]
pub trait RunLogRepository: Send + Sync {
    async fn create_run_log(&self, log: &RunLogDbModel) -> Result<i64>;
    async fn get_run_log(&self, id: i64) -> Result<RunLogDbModel>;
    /// Persist intermediate counters of a running log.
    async fn update_progress(&self, id: i64, counters: &RunCounters) -> Result<()>;
    /// Finalize a `running` log. Returns false if the log was already terminal.
    async fn finalize(&self, id: i64, finalization: &RunLogFinalization) -> Result<bool>;
    async fn list_for_task(&self, task_id: i64, limit: i64, offset: i64)
    -> Result<Vec<RunLogDbModel>>;
    async fn count_for_task(&self, task_id: i64) -> Result<i64>;
    /// Fail every `running` log (optionally only for one task). Returns the number of rows.
    async fn fail_orphaned(&self, task_id: Option<i64>, message: &str) -> Result<u64>;
    async fn aggregate(&self, from_ms: i64, to_ms: i64) -> Result<RunLogAggregate>;
    async fn cleanup_older_than(&self, cutoff_ms: i64) -> Result<u64>;
}

/// SQLx implementation of RunLogRepository.
pub struct SqlxRunLogRepository {
    pool: SqlitePool,
}

impl SqlxRunLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunLogRepository for SqlxRunLogRepository {
    async fn create_run_log(&self, log: &RunLogDbModel) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO run_logs (
                task_id, status, start_time, end_time, duration_ms, total_file, generated_file,
                skip_file, overwrite_file, metadata_count, subtitle_count, failed_count, message,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.task_id)
        .bind(&log.status)
        .bind(log.start_time)
        .bind(log.end_time)
        .bind(log.duration_ms)
        .bind(log.total_file)
        .bind(log.generated_file)
        .bind(log.skip_file)
        .bind(log.overwrite_file)
        .bind(log.metadata_count)
        .bind(log.subtitle_count)
        .bind(log.failed_count)
        .bind(&log.message)
        .bind(log.created_at)
        .bind(log.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get_run_log(&self, id: i64) -> Result<RunLogDbModel> {
        sqlx::query_as::<_, RunLogDbModel>("SELECT * FROM run_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("RunLog", id))
    }

    async fn update_progress(&self, id: i64, counters: &RunCounters) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE run_logs SET
                total_file = ?, generated_file = ?, skip_file = ?, overwrite_file = ?,
                metadata_count = ?, subtitle_count = ?, failed_count = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(counters.total as i64)
        .bind(counters.generated as i64)
        .bind(counters.skipped as i64)
        .bind(counters.overwritten as i64)
        .bind(counters.metadata as i64)
        .bind(counters.subtitle as i64)
        .bind(counters.failed as i64)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize(&self, id: i64, finalization: &RunLogFinalization) -> Result<bool> {
        let counters = &finalization.counters;
        let result = sqlx::query(
            r#"
            UPDATE run_logs SET
                status = ?, end_time = ?, duration_ms = ?, total_file = ?, generated_file = ?,
                skip_file = ?, overwrite_file = ?, metadata_count = ?, subtitle_count = ?,
                failed_count = ?, message = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(finalization.status.to_string())
        .bind(finalization.end_time)
        .bind(finalization.duration_ms)
        .bind(counters.total as i64)
        .bind(counters.generated as i64)
        .bind(counters.skipped as i64)
        .bind(counters.overwritten as i64)
        .bind(counters.metadata as i64)
        .bind(counters.subtitle as i64)
        .bind(counters.failed as i64)
        .bind(&finalization.message)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_for_task(
        &self,
        task_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunLogDbModel>> {
        let logs = sqlx::query_as::<_, RunLogDbModel>(
            "SELECT * FROM run_logs WHERE task_id = ? ORDER BY start_time DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(task_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    async fn count_for_task(&self, task_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM run_logs WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn fail_orphaned(&self, task_id: Option<i64>, message: &str) -> Result<u64> {
        let now = now_ms();
        let result = match task_id {
            Some(task_id) => {
                sqlx::query(
                    r#"
                    UPDATE run_logs SET status = 'failed', end_time = ?, duration_ms = ? - start_time,
                        message = ?, updated_at = ?
                    WHERE status = 'running' AND task_id = ?
                    "#,
                )
                .bind(now)
                .bind(now)
                .bind(message)
                .bind(now)
                .bind(task_id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE run_logs SET status = 'failed', end_time = ?, duration_ms = ? - start_time,
                        message = ?, updated_at = ?
                    WHERE status = 'running'
                    "#,
                )
                .bind(now)
                .bind(now)
                .bind(message)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn aggregate(&self, from_ms: i64, to_ms: i64) -> Result<RunLogAggregate> {
        let row: (i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(total_file), 0),
                COALESCE(SUM(generated_file), 0),
                COALESCE(SUM(skip_file), 0),
                COALESCE(SUM(overwrite_file), 0),
                COALESCE(SUM(metadata_count), 0),
                COALESCE(SUM(subtitle_count), 0),
                COALESCE(SUM(failed_count), 0)
            FROM run_logs
            WHERE start_time >= ? AND start_time < ?
            "#,
        )
        .bind(from_ms)
        .bind(to_ms)
        .fetch_one(&self.pool)
        .await?;

        Ok(RunLogAggregate {
            runs: row.0 as u64,
            completed: row.1 as u64,
            failed: row.2 as u64,
            cancelled: row.3 as u64,
            running: row.4 as u64,
            counters: RunCounters {
                total: row.5 as u64,
                generated: row.6 as u64,
                skipped: row.7 as u64,
                overwritten: row.8 as u64,
                metadata: row.9 as u64,
                subtitle: row.10 as u64,
                failed: row.11 as u64,
            },
        })
    }

    async fn cleanup_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM run_logs WHERE status != 'running' AND start_time < ?")
                .bind(cutoff_ms)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;

    fn finalization(status: RunStatus, generated: u64) -> RunLogFinalization {
        RunLogFinalization {
            status,
            end_time: now_ms(),
            duration_ms: 10,
            counters: RunCounters {
                total: generated + 1,
                generated,
                skipped: 1,
                ..Default::default()
            },
            message: "done".to_string(),
        }
    }

    #[tokio::test]
    async fn test_finalize_exactly_once() {
        let repo = SqlxRunLogRepository::new(test_pool().await);
        let id = repo.create_run_log(&RunLogDbModel::started(1)).await.unwrap();

        assert!(repo
            .finalize(id, &finalization(RunStatus::Completed, 3))
            .await
            .unwrap());
        assert!(!repo
            .finalize(id, &finalization(RunStatus::Failed, 0))
            .await
            .unwrap());

        let log = repo.get_run_log(id).await.unwrap();
        assert_eq!(log.run_status(), Some(RunStatus::Completed));
        assert_eq!(log.generated_file, 3);
        assert_eq!(log.message.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_fail_orphaned_and_aggregate() {
        let repo = SqlxRunLogRepository::new(test_pool().await);
        let done = repo.create_run_log(&RunLogDbModel::started(1)).await.unwrap();
        repo.finalize(done, &finalization(RunStatus::Completed, 2))
            .await
            .unwrap();
        repo.create_run_log(&RunLogDbModel::started(1)).await.unwrap();
        repo.create_run_log(&RunLogDbModel::started(2)).await.unwrap();

        assert_eq!(repo.fail_orphaned(Some(2), "stale").await.unwrap(), 1);
        assert_eq!(repo.fail_orphaned(None, "stale").await.unwrap(), 1);

        let agg = repo.aggregate(0, i64::MAX).await.unwrap();
        assert_eq!(agg.runs, 3);
        assert_eq!(agg.completed, 1);
        assert_eq!(agg.failed, 2);
        assert_eq!(agg.running, 0);
        assert_eq!(agg.counters.generated, 2);

        assert_eq!(repo.count_for_task(1).await.unwrap(), 2);
        let page = repo.list_for_task(1, 1, 0).await.unwrap();
        assert_eq!(page.len(), 1);
    }
}
