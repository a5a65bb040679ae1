//! Task types shared by stores, the dispatcher and producers.

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use atelier_db::entities::background_task::{Model as Task, TaskName, TaskStatus};

/// A task about to be inserted.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Generated identifier.
    pub id: String,
    /// Task kind.
    pub name: TaskName,
    /// Handler input.
    pub payload: serde_json::Value,
    /// Earliest time the task may run.
    pub run_at: DateTime<Utc>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
}

/// Result of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Tasks claimed and run, whatever the outcome.
    pub processed: usize,
    /// Runs that ended in a handler error.
    pub failed: usize,
}
