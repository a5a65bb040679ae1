//! `PostgreSQL` task store tests.
//!
//! These need a database reachable through the `TEST_DB_*` variables.

#![allow(clippy::unwrap_used)]

use std::collections::HashSet;

use atelier_db::repositories::BackgroundTaskRepository;
use atelier_db::test_utils::TestDatabase;
use atelier_queue::{NewTask, PostgresTaskStore, TaskName, TaskStatus, TaskStore};
use chrono::{Duration, Utc};

async fn store() -> (TestDatabase, PostgresTaskStore) {
    let db = TestDatabase::new().await.unwrap();
    let repo = BackgroundTaskRepository::new(db.shared());
    repo.ensure_schema().await.unwrap();
    db.cleanup().await.unwrap();
    (db, PostgresTaskStore::new(repo))
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_concurrent_claims_are_disjoint() {
    let (_db, store) = store().await;
    let now = Utc::now();
    for i in 0..50 {
        store
            .insert(NewTask {
                id: format!("pg-{i:02}"),
                name: TaskName::EmailSend,
                payload: serde_json::json!({}),
                run_at: now - Duration::seconds(1),
                created_at: now,
            })
            .await
            .unwrap();
    }

    let claimers: Vec<_> = (0..6)
        .map(|worker| {
            let store = store.clone();
            tokio::spawn(async move {
                let worker_id = format!("worker-{worker}");
                let mut claimed = Vec::new();
                while let Some(task) = store
                    .claim_next_due(Utc::now(), &worker_id, Utc::now() + Duration::seconds(300))
                    .await
                    .unwrap()
                {
                    claimed.push(task.id);
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in claimers {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 50);
    assert_eq!(unique.len(), 50);
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_failure_freezes_run_at_at_max_attempts() {
    let (_db, store) = store().await;
    let now = Utc::now();
    store
        .insert(NewTask {
            id: "pg-fail".to_string(),
            name: TaskName::EmailSend,
            payload: serde_json::json!({}),
            run_at: now,
            created_at: now,
        })
        .await
        .unwrap();

    let claimed = store
        .claim_next_due(now, "w", now + Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();
    let failed = store
        .mark_failed(&claimed.id, "w", "boom", now, now + Duration::seconds(30), 1)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.run_at.timestamp(), now.timestamp());
    assert!(
        store
            .claim_next_due(now + Duration::days(1), "w", now + Duration::days(2))
            .await
            .unwrap()
            .is_none()
    );
}
