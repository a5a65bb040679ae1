//! Durable background task queue for atelier.
//!
//! - **Store**: [`TaskStore`] with `PostgreSQL` and in-memory backends
//! - **Registry**: task name to [`TaskHandler`] mapping, filled at startup
//! - **Dispatcher**: claim, run, record; leases make stuck claims reclaimable
//! - **Queue**: producer API with optional inline draining
//! - **Poller**: periodic drain loop with graceful shutdown

pub mod dispatcher;
pub mod memory;
pub mod poller;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod store;
pub mod task;

pub use dispatcher::Dispatcher;
pub use memory::MemoryTaskStore;
pub use poller::{PollerConfig, run_poller};
pub use queue::TaskQueue;
pub use registry::{HandlerOutcome, HandlerRegistry, TaskHandler};
pub use retry::{RetryConfig, truncate_error};
pub use store::{PostgresTaskStore, TaskStore};
pub use task::{DrainReport, NewTask, Task, TaskName, TaskStatus};
