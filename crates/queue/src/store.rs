//! Durable task storage.

use async_trait::async_trait;
use atelier_common::AppResult;
use atelier_db::repositories::BackgroundTaskRepository;
use chrono::{DateTime, Utc};

use crate::task::{NewTask, Task};

/// Storage behind the task queue.
///
/// Every state change a task goes through is one of these operations.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a queued task.
    async fn insert(&self, task: NewTask) -> AppResult<Task>;

    /// Atomically claim the oldest due task, or an expired lease, for
    /// `worker_id`. No two callers ever receive the same claim.
    async fn claim_next_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> AppResult<Option<Task>>;

    /// Mark a claimed task completed. `false` when the lease was lost.
    async fn mark_completed(&self, id: &str, worker_id: &str, now: DateTime<Utc>)
    -> AppResult<bool>;

    /// Record a failed run; `None` when the lease was lost.
    async fn mark_failed(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> AppResult<Option<Task>>;

    /// Look up a task.
    async fn get(&self, id: &str) -> AppResult<Option<Task>>;
}

/// `PostgreSQL` task store.
#[derive(Clone)]
pub struct PostgresTaskStore {
    repo: BackgroundTaskRepository,
}

impl PostgresTaskStore {
    /// Create a store over the task repository.
    #[must_use]
    pub const fn new(repo: BackgroundTaskRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn insert(&self, task: NewTask) -> AppResult<Task> {
        self.repo
            .insert(task.id, task.name, task.payload, task.run_at, task.created_at)
            .await
    }

    async fn claim_next_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> AppResult<Option<Task>> {
        self.repo.claim_next_due(now, worker_id, lease_expires_at).await
    }

    async fn mark_completed(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.repo.complete(id, worker_id, now).await
    }

    async fn mark_failed(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> AppResult<Option<Task>> {
        self.repo
            .fail(id, worker_id, error, now, next_run_at, max_attempts)
            .await
    }

    async fn get(&self, id: &str) -> AppResult<Option<Task>> {
        self.repo.find_by_id(id).await
    }
}
