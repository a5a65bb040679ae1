//! Task handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use atelier_common::AppResult;
use tokio::sync::RwLock;

use crate::task::{Task, TaskName};

/// What a handler did with a task it returned normally from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The work was done.
    Processed,
    /// Nothing to do; the task still counts as completed.
    Skipped {
        /// Why the task was skipped, e.g. `not-found`.
        reason: String,
    },
}

impl HandlerOutcome {
    /// Skipped with a reason.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// Runs tasks of one kind.
///
/// Returning an error marks the run failed and schedules a retry.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Handle one claimed task.
    async fn handle(&self, task: &Task) -> AppResult<HandlerOutcome>;
}

/// Mapping from task name to handler, filled once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<TaskName, Arc<dyn TaskHandler>>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering a name again replaces its handler.
    pub async fn register(&self, name: TaskName, handler: Arc<dyn TaskHandler>) {
        let replaced = self.handlers.write().await.insert(name, handler).is_some();
        tracing::debug!(task_name = %name, replaced, "Registered task handler");
    }

    /// Handler for a task name.
    pub async fn get(&self, name: TaskName) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(&name).cloned()
    }

    /// Registered task names.
    pub async fn names(&self) -> Vec<TaskName> {
        let mut names: Vec<TaskName> = self.handlers.read().await.keys().copied().collect();
        names.sort_by_key(|name| name.as_str());
        names
    }
}
