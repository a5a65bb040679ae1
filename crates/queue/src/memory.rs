//! In-process task store.
//!
//! Mirrors the `PostgreSQL` claim semantics behind a mutex. Only suitable for
//! a single process: tests, local tooling and development without a
//! database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use atelier_common::AppResult;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::store::TaskStore;
use crate::task::{NewTask, Task, TaskStatus};

/// In-memory task store.
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    tasks: Arc<Mutex<HashMap<String, Task>>>,
}

impl MemoryTaskStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored task.
    pub async fn all(&self) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        all
    }
}

fn is_claimable(task: &Task, now: DateTime<Utc>) -> bool {
    match task.status {
        TaskStatus::Queued => task.run_at <= now,
        TaskStatus::Processing => task.lease_expires_at.is_some_and(|lease| lease <= now),
        TaskStatus::Completed | TaskStatus::Failed => false,
    }
}

fn holds_lease(task: &Task, worker_id: &str) -> bool {
    task.status == TaskStatus::Processing && task.locked_by.as_deref() == Some(worker_id)
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: NewTask) -> AppResult<Task> {
        let row = Task {
            id: task.id,
            name: task.name,
            payload: task.payload,
            run_at: task.run_at.fixed_offset(),
            status: TaskStatus::Queued,
            attempts: 0,
            last_error: None,
            locked_at: None,
            locked_by: None,
            lease_expires_at: None,
            created_at: task.created_at.fixed_offset(),
            updated_at: task.created_at.fixed_offset(),
        };
        self.tasks.lock().await.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn claim_next_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> AppResult<Option<Task>> {
        let mut tasks = self.tasks.lock().await;

        let next_id = tasks
            .values()
            .filter(|task| is_claimable(task, now))
            .min_by(|a, b| (a.run_at, a.created_at, &a.id).cmp(&(b.run_at, b.created_at, &b.id)))
            .map(|task| task.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };
        let Some(task) = tasks.get_mut(&id) else {
            return Ok(None);
        };

        task.status = TaskStatus::Processing;
        task.locked_at = Some(now.fixed_offset());
        task.locked_by = Some(worker_id.to_string());
        task.lease_expires_at = Some(lease_expires_at.fixed_offset());
        task.updated_at = now.fixed_offset();

        Ok(Some(task.clone()))
    }

    async fn mark_completed(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(id).filter(|task| holds_lease(task, worker_id)) else {
            return Ok(false);
        };

        task.status = TaskStatus::Completed;
        task.attempts += 1;
        task.last_error = None;
        task.locked_at = None;
        task.locked_by = None;
        task.lease_expires_at = None;
        task.updated_at = now.fixed_offset();
        Ok(true)
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
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(id).filter(|task| holds_lease(task, worker_id)) else {
            return Ok(None);
        };

        task.attempts += 1;
        if task.attempts >= max_attempts as i32 {
            task.status = TaskStatus::Failed;
        } else {
            task.status = TaskStatus::Queued;
            task.run_at = next_run_at.fixed_offset();
        }
        task.last_error = Some(error.to_string());
        task.locked_at = None;
        task.locked_by = None;
        task.lease_expires_at = None;
        task.updated_at = now.fixed_offset();
        Ok(Some(task.clone()))
    }

    async fn get(&self, id: &str) -> AppResult<Option<Task>> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }
}
