//! Periodic drain loop.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

use crate::dispatcher::Dispatcher;

/// Poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between drains.
    pub interval: Duration,
    /// Tasks drained per tick.
    pub batch: usize,
}

impl From<&atelier_common::config::QueueConfig> for PollerConfig {
    fn from(config: &atelier_common::config::QueueConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            batch: config.poll_batch,
        }
    }
}

/// Drain due tasks every `config.interval` until `shutdown` turns `true`.
pub async fn run_poller(dispatcher: Dispatcher, config: PollerConfig, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        worker_id = %dispatcher.worker_id(),
        interval_secs = config.interval.as_secs(),
        batch = config.batch,
        "Task poller started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = dispatcher.drain(config.batch).await {
                    tracing::error!(error = %e, "Task poller drain failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!(worker_id = %dispatcher.worker_id(), "Task poller stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use atelier_common::{AppResult, system_clock};
    use chrono::Utc;

    use super::*;
    use crate::memory::MemoryTaskStore;
    use crate::registry::{HandlerOutcome, HandlerRegistry, TaskHandler};
    use crate::retry::RetryConfig;
    use crate::store::TaskStore;
    use crate::task::{NewTask, Task, TaskName, TaskStatus};

    struct Done;

    #[async_trait]
    impl TaskHandler for Done {
        async fn handle(&self, _task: &Task) -> AppResult<HandlerOutcome> {
            Ok(HandlerOutcome::Processed)
        }
    }

    #[tokio::test]
    async fn test_poller_drains_until_shutdown() {
        let store = MemoryTaskStore::new();
        let registry = HandlerRegistry::new();
        registry.register(TaskName::EmailSend, Arc::new(Done)).await;
        let dispatcher = Dispatcher::new(
            Arc::new(store.clone()),
            registry,
            RetryConfig::default(),
            system_clock(),
        );

        let now = Utc::now();
        store
            .insert(NewTask {
                id: "t1".to_string(),
                name: TaskName::EmailSend,
                payload: serde_json::json!({}),
                run_at: now,
                created_at: now,
            })
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let config = PollerConfig {
            interval: Duration::from_millis(10),
            batch: 10,
        };
        let handle = tokio::spawn(run_poller(dispatcher, config, rx));

        let mut status = TaskStatus::Queued;
        for _ in 0..200 {
            status = store.get("t1").await.unwrap().unwrap().status;
            if status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, TaskStatus::Completed);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
