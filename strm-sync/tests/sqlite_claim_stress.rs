use dashmap::DashSet;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

use strm_sync::database::models::{NotificationQueueDbModel, TaskDbModel};
use strm_sync::database::repositories::{
    NotificationQueueRepository, SqlxNotificationQueueRepository, SqlxTaskRepository,
    TaskRepository,
};
use strm_sync::database::retry::retry_on_sqlite_busy;
use strm_sync::database::time::now_ms;
use strm_sync::database::{DbPool, run_migrations};

async fn init_stress_pool(database_url: &str) -> DbPool {
    let connect_options = SqliteConnectOptions::from_str(database_url)
        .unwrap()
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        // Make SQLITE_BUSY surface quickly so retry logic is exercised.
        .busy_timeout(Duration::from_millis(1))
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(connect_options)
        .await
        .unwrap()
}

fn file_db_url(dir: &TempDir) -> String {
    let db_path = dir.path().join("stress.db");
    format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "stress test; run explicitly to validate SQLite claim correctness under contention"]
async fn notification_claim_stress_no_double_claims_or_lost_transitions() {
    const EVENTS: usize = 300;
    const WORKERS: usize = 12;

    let dir = TempDir::new().unwrap();
    let pool = init_stress_pool(&file_db_url(&dir)).await;
    run_migrations(&pool).await.unwrap();

    let repo = Arc::new(SqlxNotificationQueueRepository::new(pool.clone()));

    // Seed a backlog of pending notifications.
    for i in 0..EVENTS {
        let event = NotificationQueueDbModel::new(
            "webhook",
            "task_completed",
            format!(r#"{{"task_id":{i}}}"#),
            (i % 3) as i64,
        );
        repo.enqueue(&event).await.unwrap();
    }

    let claimed_ids = Arc::new(DashSet::<i64>::new());

    let mut workers = JoinSet::new();
    for worker in 0..WORKERS {
        let repo = repo.clone();
        let claimed_ids = claimed_ids.clone();
        workers.spawn(async move {
            loop {
                let batch = retry_on_sqlite_busy("claim_due", || repo.claim_due(now_ms(), 4))
                    .await
                    .unwrap();
                if batch.is_empty() {
                    let pending = repo.list(Some("pending"), 1).await.unwrap();
                    if pending.is_empty() {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }

                for event in batch {
                    let inserted = claimed_ids.insert(event.id);
                    assert!(inserted, "double-claimed notification {}", event.id);

                    if worker % 2 == 0 {
                        tokio::task::yield_now().await;
                    }

                    retry_on_sqlite_busy("mark_sent", || repo.mark_sent(event.id))
                        .await
                        .unwrap();
                }
            }
        });
    }

    let joined = tokio::time::timeout(Duration::from_secs(30), async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    assert!(joined.is_ok(), "workers timed out (possible deadlock)");

    assert_eq!(claimed_ids.len(), EVENTS, "not all notifications were claimed");

    let (sent,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM notification_queue WHERE status = 'sent'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(sent, EVENTS as i64, "some transitions to sent were lost");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "stress test; run explicitly to validate the running flag under contention"]
async fn task_running_flag_has_single_owner_under_contention() {
    const ROUNDS: usize = 50;
    const CONTENDERS: usize = 8;

    let dir = TempDir::new().unwrap();
    let pool = init_stress_pool(&file_db_url(&dir)).await;
    run_migrations(&pool).await.unwrap();

    let repo = Arc::new(SqlxTaskRepository::new(pool.clone()));
    let task_id = repo
        .create_task(&TaskDbModel::new("stress", "/media", "/tmp/strm"))
        .await
        .unwrap();

    for round in 0..ROUNDS {
        let mut contenders = JoinSet::new();
        for _ in 0..CONTENDERS {
            let repo = repo.clone();
            contenders.spawn(async move {
                retry_on_sqlite_busy("try_mark_running", || repo.try_mark_running(task_id))
                    .await
                    .unwrap()
            });
        }

        let mut winners = 0;
        while let Some(won) = contenders.join_next().await {
            if won.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "round {round} had {winners} owners");

        retry_on_sqlite_busy("finish_run", || repo.finish_run(task_id, now_ms()))
            .await
            .unwrap();
    }
}
