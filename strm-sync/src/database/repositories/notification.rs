//! Notification queue repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::NotificationQueueDbModel;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Notification queue repository trait.
#[async_trait]
pub trait NotificationQueueRepository: Send + Sync {
    async fn enqueue(&self, event: &NotificationQueueDbModel) -> Result<i64>;
    async fn get(&self, id: i64) -> Result<NotificationQueueDbModel>;
    async fn list(&self, status: Option<&str>, limit: i64) -> Result<Vec<NotificationQueueDbModel>>;

    /// Move up to `limit` due `pending` events to `sending` and return them,
    /// highest priority first, then oldest first.
    async fn claim_due(&self, now_ms: i64, limit: i64) -> Result<Vec<NotificationQueueDbModel>>;
    async fn mark_sent(&self, id: i64) -> Result<()>;
    /// Back to `pending` with a new retry count and due time.
    async fn mark_retry(
        &self,
        id: i64,
        retry_count: i64,
        next_retry_at: i64,
        error: &str,
    ) -> Result<()>;
    /// Terminal failure.
    async fn mark_failed(&self, id: i64, retry_count: i64, error: &str) -> Result<()>;
    /// Return rows stuck in `sending` to `pending` (startup recovery).
    async fn reset_in_flight(&self) -> Result<u64>;
    async fn cleanup_terminal_older_than(&self, cutoff_ms: i64) -> Result<u64>;
}

/// SQLx implementation of NotificationQueueRepository.
pub struct SqlxNotificationQueueRepository {
    pool: SqlitePool,
}

impl SqlxNotificationQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationQueueRepository for SqlxNotificationQueueRepository {
    async fn enqueue(&self, event: &NotificationQueueDbModel) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_queue (
                channel_type, template_type, payload, status, priority, retry_count,
                next_retry_at, last_error, sent_at, created_at, updated_at
            ) VALUES (?, ?, ?, 'pending', ?, 0, ?, NULL, NULL, ?, ?)
            "#,
        )
        .bind(&event.channel_type)
        .bind(&event.template_type)
        .bind(&event.payload)
        .bind(event.priority)
        .bind(event.next_retry_at)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> Result<NotificationQueueDbModel> {
        sqlx::query_as::<_, NotificationQueueDbModel>(
            "SELECT * FROM notification_queue WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("NotificationEvent", id))
    }

    async fn list(
        &self,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<NotificationQueueDbModel>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, NotificationQueueDbModel>(
                    "SELECT * FROM notification_queue WHERE status = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, NotificationQueueDbModel>(
                    "SELECT * FROM notification_queue ORDER BY id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    async fn claim_due(&self, now_ms: i64, limit: i64) -> Result<Vec<NotificationQueueDbModel>> {
        let mut tx = self.pool.begin().await?;

        let candidates = sqlx::query_as::<_, NotificationQueueDbModel>(
            r#"
            SELECT * FROM notification_queue
            WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut event in candidates {
            let result = sqlx::query(
                "UPDATE notification_queue SET status = 'sending', updated_at = ? WHERE id = ? AND status = 'pending'",
            )
            .bind(now_ms)
            .bind(event.id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 1 {
                event.status = "sending".to_string();
                event.updated_at = now_ms;
                claimed.push(event);
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn mark_sent(&self, id: i64) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            "UPDATE notification_queue SET status = 'sent', sent_at = ?, last_error = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: i64,
        retry_count: i64,
        next_retry_at: i64,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notification_queue
            SET status = 'pending', retry_count = ?, next_retry_at = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(error)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, retry_count: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notification_queue
            SET status = 'failed', retry_count = ?, next_retry_at = NULL, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(retry_count)
        .bind(error)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_in_flight(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE notification_queue SET status = 'pending', updated_at = ? WHERE status = 'sending'",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_terminal_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM notification_queue WHERE status IN ('sent', 'failed') AND updated_at < ?",
        )
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::QueueStatus;
    use crate::database::test_pool;

    #[tokio::test]
    async fn test_claim_order_and_due_time() {
        let repo = SqlxNotificationQueueRepository::new(test_pool().await);

        let low = repo
            .enqueue(&NotificationQueueDbModel::new("telegram", "task_completed", "{}", 0))
            .await
            .unwrap();
        let high = repo
            .enqueue(&NotificationQueueDbModel::new("telegram", "task_failed", "{}", 10))
            .await
            .unwrap();
        let mut later = NotificationQueueDbModel::new("webhook", "task_completed", "{}", 100);
        later.next_retry_at = Some(now_ms() + 60_000);
        repo.enqueue(&later).await.unwrap();

        let claimed = repo.claim_due(now_ms(), 10).await.unwrap();
        let ids: Vec<i64> = claimed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![high, low]);
        assert!(claimed
            .iter()
            .all(|e| e.queue_status() == Some(QueueStatus::Sending)));

        // Already claimed rows are not handed out twice.
        assert!(repo.claim_due(now_ms(), 10).await.unwrap().is_empty());

        assert_eq!(repo.reset_in_flight().await.unwrap(), 2);
        assert_eq!(repo.claim_due(now_ms(), 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_fail_and_cleanup() {
        let repo = SqlxNotificationQueueRepository::new(test_pool().await);
        let id = repo
            .enqueue(&NotificationQueueDbModel::new("wework", "test", "{}", 0))
            .await
            .unwrap();

        repo.mark_retry(id, 1, now_ms() + 1_000, "timeout")
            .await
            .unwrap();
        let event = repo.get(id).await.unwrap();
        assert_eq!(event.queue_status(), Some(QueueStatus::Pending));
        assert_eq!(event.retry_count, 1);
        assert_eq!(event.last_error.as_deref(), Some("timeout"));

        repo.mark_failed(id, 2, "gave up").await.unwrap();
        assert_eq!(
            repo.get(id).await.unwrap().queue_status(),
            Some(QueueStatus::Failed)
        );
        assert_eq!(repo.list(Some("failed"), 10).await.unwrap().len(), 1);

        assert_eq!(
            repo.cleanup_terminal_older_than(now_ms() + 1).await.unwrap(),
            1
        );
        assert!(repo.list(None, 10).await.unwrap().is_empty());
    }
}
