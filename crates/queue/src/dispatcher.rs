//! Task dispatcher.
//!
//! Claims due tasks one at a time, runs the registered handler and records
//! the outcome. Handler failures never escape [`Dispatcher::drain`]; they
//! become task state and log events.

use std::sync::Arc;

use atelier_common::{AppError, AppResult, IdGenerator, SharedClock};
use tracing::{debug, error, info, warn};

use crate::registry::{HandlerOutcome, HandlerRegistry};
use crate::retry::{RetryConfig, truncate_error};
use crate::store::TaskStore;
use crate::task::{DrainReport, Task, TaskStatus};

/// Runs due tasks against their handlers.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    registry: HandlerRegistry,
    retry: RetryConfig,
    clock: SharedClock,
    worker_id: String,
}

impl Dispatcher {
    /// Create a dispatcher with a fresh worker identity.
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: HandlerRegistry,
        retry: RetryConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            registry,
            retry,
            clock,
            worker_id: IdGenerator::new().generate_worker_id(),
        }
    }

    /// Use a fixed worker identity.
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Identity written to `locked_by` on claims.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Handler registry used to resolve task names.
    #[must_use]
    pub const fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Claim and run up to `limit` due tasks, stopping early when none is due.
    ///
    /// Only storage errors are returned.
    pub async fn drain(&self, limit: usize) -> AppResult<DrainReport> {
        let mut report = DrainReport::default();

        for _ in 0..limit {
            let now = self.clock.utc();
            let lease = self.retry.lease_until(now);
            let Some(task) = self
                .store
                .claim_next_due(now, &self.worker_id, lease)
                .await?
            else {
                break;
            };

            report.processed += 1;
            if !self.run(task).await? {
                report.failed += 1;
            }
        }

        if report.processed > 0 {
            info!(
                worker_id = %self.worker_id,
                processed = report.processed,
                failed = report.failed,
                "Drained background tasks"
            );
        }
        Ok(report)
    }

    /// [`Self::drain`] on a spawned task.
    ///
    /// Dropping the returned future (a request timeout, say) leaves the
    /// drain running, so a handler is never cut off between its side effect
    /// and the completion write.
    pub async fn drain_detached(&self, limit: usize) -> AppResult<DrainReport> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.drain(limit).await })
            .await
            .map_err(|e| AppError::Queue(format!("Drain task aborted: {e}")))?
    }

    /// Run one claimed task. Returns whether the run succeeded.
    async fn run(&self, task: Task) -> AppResult<bool> {
        let result = match self.registry.get(task.name).await {
            Some(handler) => handler.handle(&task).await,
            None => Err(AppError::Queue(format!(
                "No handler registered for task {}",
                task.name
            ))),
        };

        match result {
            Ok(outcome) => {
                self.complete(&task, &outcome).await?;
                Ok(true)
            }
            Err(e) => {
                self.fail(&task, &e).await?;
                Ok(false)
            }
        }
    }

    async fn complete(&self, task: &Task, outcome: &HandlerOutcome) -> AppResult<()> {
        let now = self.clock.utc();
        let owned = self
            .store
            .mark_completed(&task.id, &self.worker_id, now)
            .await?;

        if !owned {
            warn!(
                task_id = %task.id,
                task_name = %task.name,
                worker_id = %self.worker_id,
                "Lease lost before completion was recorded"
            );
            return Ok(());
        }

        match outcome {
            HandlerOutcome::Processed => {
                debug!(task_id = %task.id, task_name = %task.name, "Task completed");
            }
            HandlerOutcome::Skipped { reason } => {
                debug!(task_id = %task.id, task_name = %task.name, reason, "Task skipped");
            }
        }
        Ok(())
    }

    async fn fail(&self, task: &Task, err: &AppError) -> AppResult<()> {
        let now = self.clock.utc();
        let message = truncate_error(&err.to_string());
        let updated = self
            .store
            .mark_failed(
                &task.id,
                &self.worker_id,
                &message,
                now,
                self.retry.next_run_at(now),
                self.retry.max_attempts,
            )
            .await?;

        let Some(updated) = updated else {
            warn!(
                task_id = %task.id,
                task_name = %task.name,
                worker_id = %self.worker_id,
                "Lease lost before failure was recorded"
            );
            return Ok(());
        };

        if updated.status == TaskStatus::Failed {
            error!(
                task_id = %task.id,
                task_name = %task.name,
                attempts = updated.attempts,
                error = %message,
                "Background task failed permanently"
            );
        } else {
            error!(
                task_id = %task.id,
                task_name = %task.name,
                attempts = updated.attempts,
                run_at = %updated.run_at,
                error = %message,
                "Background task failed, will retry"
            );
        }
        Ok(())
    }
}
