//! Producer side of the task queue.

use std::sync::Arc;

use atelier_common::{AppResult, IdGenerator, SharedClock};
use atelier_common::config::QueueConfig;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::store::TaskStore;
use crate::task::{NewTask, Task, TaskName};

/// Enqueues tasks and, optionally, drains right away.
///
/// With inline draining on, an enqueue whose task is already due runs up to
/// `inline_drain_limit` tasks before returning, so the caller pays for the
/// handler work (an email provider call, say) in exchange for low latency on
/// a single node. The drain runs on its own tokio task, so a caller that is
/// dropped mid-drain does not interrupt a handler. With it off, enqueue
/// returns as soon as the row is stored and the poller picks the task up.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    dispatcher: Dispatcher,
    clock: SharedClock,
    id_gen: IdGenerator,
    inline_drain: bool,
    inline_drain_limit: usize,
}

impl TaskQueue {
    /// Create a queue. Inline draining follows `config`.
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        dispatcher: Dispatcher,
        clock: SharedClock,
        config: &QueueConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            id_gen: IdGenerator::new(),
            inline_drain: config.inline_drain,
            inline_drain_limit: config.inline_drain_limit,
        }
    }

    /// Dispatcher draining this queue.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Store a queued task, due at `run_at` or immediately.
    pub async fn enqueue(
        &self,
        name: TaskName,
        payload: serde_json::Value,
        run_at: Option<DateTime<Utc>>,
    ) -> AppResult<Task> {
        let now = self.clock.utc();
        let run_at = run_at.unwrap_or(now);

        let task = self
            .store
            .insert(NewTask {
                id: self.id_gen.generate(),
                name,
                payload,
                run_at,
                created_at: now,
            })
            .await?;
        debug!(task_id = %task.id, task_name = %name, run_at = %run_at, "Enqueued task");

        if self.inline_drain && run_at <= now {
            // The task is stored; a failed drain only delays it until the next poll.
            if let Err(e) = self.dispatcher.drain_detached(self.inline_drain_limit).await {
                warn!(task_id = %task.id, error = %e, "Inline drain failed");
            }
        }

        Ok(task)
    }

    /// Drain up to `limit` due tasks. The drain outlives a dropped caller.
    pub async fn drain(&self, limit: usize) -> AppResult<crate::task::DrainReport> {
        self.dispatcher.drain_detached(limit).await
    }

    /// Look up a task.
    pub async fn get(&self, id: &str) -> AppResult<Option<Task>> {
        self.store.get(id).await
    }
}
