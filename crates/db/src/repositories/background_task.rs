//! Background task repository.
//!
//! The task table doubles as a job queue. Claiming is a single
//! `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)` statement so
//! that concurrent workers never receive the same row.

use std::sync::Arc;

use crate::entities::{
    BackgroundTask,
    background_task::{self, TaskName, TaskStatus},
};
use atelier_common::{AppError, AppResult};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection,
    EntityTrait, QueryFilter, Set, Statement, sea_query::Expr,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

const CREATE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS background_task (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    payload JSONB NOT NULL DEFAULT '{}'::jsonb,
    run_at TIMESTAMPTZ NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    locked_at TIMESTAMPTZ,
    locked_by TEXT,
    lease_expires_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

const CREATE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_background_task_status_run_at
    ON background_task (status, run_at)";

// Oldest due row first. Expired leases count as due.
const CLAIM_NEXT_DUE: &str = r"
UPDATE background_task
SET status = 'processing',
    locked_at = $1,
    locked_by = $2,
    lease_expires_at = $3,
    updated_at = $1
WHERE id = (
    SELECT id FROM background_task
    WHERE (status = 'queued' AND run_at <= $1)
       OR (status = 'processing' AND lease_expires_at IS NOT NULL AND lease_expires_at <= $1)
    ORDER BY run_at ASC, created_at ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
RETURNING *";

// `attempts` on the right-hand side is the pre-update value.
const MARK_FAILED: &str = r"
UPDATE background_task
SET attempts = attempts + 1,
    status = CASE WHEN attempts + 1 >= $6 THEN 'failed' ELSE 'queued' END,
    run_at = CASE WHEN attempts + 1 >= $6 THEN run_at ELSE $5 END,
    last_error = $3,
    locked_at = NULL,
    locked_by = NULL,
    lease_expires_at = NULL,
    updated_at = $4
WHERE id = $1 AND status = 'processing' AND locked_by = $2
RETURNING *";

/// Background task repository for database operations.
#[derive(Clone)]
pub struct BackgroundTaskRepository {
    db: Arc<DatabaseConnection>,
    schema: Arc<OnceCell<()>>,
}

impl BackgroundTaskRepository {
    /// Create a new background task repository.
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            schema: Arc::new(OnceCell::new()),
        }
    }

    /// Create the task table if it does not exist yet.
    ///
    /// Runs at most once per repository (and its clones). A failed attempt
    /// leaves the cell empty so the next call tries again.
    pub async fn ensure_schema(&self) -> AppResult<()> {
        self.schema
            .get_or_try_init(|| async {
                self.db
                    .execute_unprepared(CREATE_TABLE)
                    .await
                    .map_err(|e| AppError::Database(e.to_string()))?;
                self.db
                    .execute_unprepared(CREATE_INDEX)
                    .await
                    .map_err(|e| AppError::Database(e.to_string()))?;
                info!("Background task table ready");
                Ok::<(), AppError>(())
            })
            .await?;
        Ok(())
    }

    /// Insert a new queued task.
    pub async fn insert(
        &self,
        id: String,
        name: TaskName,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<background_task::Model> {
        self.ensure_schema().await?;

        let model = background_task::ActiveModel {
            id: Set(id),
            name: Set(name),
            payload: Set(payload),
            run_at: Set(run_at.into()),
            status: Set(TaskStatus::Queued),
            attempts: Set(0),
            last_error: Set(None),
            locked_at: Set(None),
            locked_by: Set(None),
            lease_expires_at: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Atomically claim the oldest due task for `worker_id`.
    pub async fn claim_next_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> AppResult<Option<background_task::Model>> {
        self.ensure_schema().await?;

        let claimed = BackgroundTask::find()
            .from_raw_sql(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                CLAIM_NEXT_DUE,
                [
                    now.fixed_offset().into(),
                    worker_id.into(),
                    lease_expires_at.fixed_offset().into(),
                ],
            ))
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        if let Some(task) = &claimed {
            debug!(task_id = %task.id, task_name = %task.name, worker_id, "Claimed task");
        }
        Ok(claimed)
    }

    /// Mark a task completed, counting the successful run as an attempt.
    ///
    /// Returns `false` when `worker_id` no longer holds the lease.
    pub async fn complete(&self, id: &str, worker_id: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let result = BackgroundTask::update_many()
            .col_expr(
                background_task::Column::Status,
                Expr::value(TaskStatus::Completed),
            )
            .col_expr(
                background_task::Column::Attempts,
                Expr::col(background_task::Column::Attempts).add(1),
            )
            .col_expr(
                background_task::Column::LastError,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                background_task::Column::LockedAt,
                Expr::value(Option::<DateTime<chrono::FixedOffset>>::None),
            )
            .col_expr(
                background_task::Column::LockedBy,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                background_task::Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<chrono::FixedOffset>>::None),
            )
            .col_expr(
                background_task::Column::UpdatedAt,
                Expr::value(now.fixed_offset()),
            )
            .filter(background_task::Column::Id.eq(id))
            .filter(background_task::Column::Status.eq(TaskStatus::Processing))
            .filter(background_task::Column::LockedBy.eq(worker_id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(result.rows_affected == 1)
    }

    /// Record a failed run.
    ///
    /// Requeues at `next_run_at`, or freezes the task as `failed` once the
    /// incremented attempt count reaches `max_attempts`. Returns `None` when
    /// `worker_id` no longer holds the lease.
    pub async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> AppResult<Option<background_task::Model>> {
        BackgroundTask::find()
            .from_raw_sql(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                MARK_FAILED,
                [
                    id.into(),
                    worker_id.into(),
                    error.into(),
                    now.fixed_offset().into(),
                    next_run_at.fixed_offset().into(),
                    (max_attempts as i32).into(),
                ],
            ))
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find a task by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<background_task::Model>> {
        self.ensure_schema().await?;

        BackgroundTask::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sea_orm::{MockDatabase, MockExecResult};

    fn ddl_ok() -> [MockExecResult; 2] {
        [
            MockExecResult {
                last_insert_id: 0,
                rows_affected: 0,
            },
            MockExecResult {
                last_insert_id: 0,
                rows_affected: 0,
            },
        ]
    }

    fn processing_task(id: &str) -> background_task::Model {
        let now = Utc::now().fixed_offset();
        background_task::Model {
            id: id.to_string(),
            name: TaskName::EmailSend,
            payload: serde_json::json!({ "messageId": "msg1" }),
            run_at: now,
            status: TaskStatus::Processing,
            attempts: 0,
            last_error: None,
            locked_at: Some(now),
            locked_by: Some("worker-a".to_string()),
            lease_expires_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_claim_runs_schema_once_then_claims() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results(ddl_ok())
                .append_query_results([[processing_task("t1")]])
                .append_query_results([Vec::<background_task::Model>::new()])
                .into_connection(),
        );

        let repo = BackgroundTaskRepository::new(db);
        let now = Utc::now();
        let first = repo
            .claim_next_due(now, "worker-a", now + chrono::Duration::seconds(300))
            .await
            .unwrap();
        let second = repo
            .claim_next_due(now, "worker-a", now + chrono::Duration::seconds(300))
            .await
            .unwrap();

        // The second claim would hit an exhausted exec queue if DDL ran again.
        assert_eq!(first.unwrap().id, "t1");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_schema_failure_is_retried() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_errors([sea_orm::DbErr::Custom("connection reset".to_string())])
                .append_exec_results(ddl_ok())
                .into_connection(),
        );

        let repo = BackgroundTaskRepository::new(db);
        assert!(repo.ensure_schema().await.is_err());
        assert!(repo.ensure_schema().await.is_ok());
        // Cached now: no further exec results are needed.
        assert!(repo.ensure_schema().await.is_ok());
    }

    #[tokio::test]
    async fn test_complete_reports_lost_lease() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([
                    MockExecResult {
                        last_insert_id: 0,
                        rows_affected: 1,
                    },
                    MockExecResult {
                        last_insert_id: 0,
                        rows_affected: 0,
                    },
                ])
                .into_connection(),
        );

        let repo = BackgroundTaskRepository::new(db);
        assert!(repo.complete("t1", "worker-a", Utc::now()).await.unwrap());
        assert!(!repo.complete("t1", "worker-b", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_returns_updated_row() {
        let mut failed = processing_task("t1");
        failed.status = TaskStatus::Queued;
        failed.attempts = 1;
        failed.last_error = Some("boom".to_string());
        failed.locked_by = None;

        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[failed]])
                .into_connection(),
        );

        let repo = BackgroundTaskRepository::new(db);
        let now = Utc::now();
        let row = repo
            .fail("t1", "worker-a", "boom", now, now + chrono::Duration::seconds(30), 5)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(row.status, TaskStatus::Queued);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.last_error.as_deref(), Some("boom"));
    }
}
