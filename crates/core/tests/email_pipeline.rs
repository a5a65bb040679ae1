//! Email pipeline integration tests.
//!
//! Producer, task queue, send handler and webhook reconciliation wired
//! together over the in-memory stores.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use atelier_common::config::{EmailConfig, EmailProviderKind, QueueConfig};
use atelier_common::{AppError, AppResult, Clock, Environment, ManualClock, SharedClock};
use atelier_core::email_webhook::sign_payload;
use atelier_core::{
    BuiltinTemplates, BulkQueueEmailInput, BulkRecipient, EmailProvider, EmailSendHandler,
    EmailService, EmailStore, MemoryEmailStore, OutgoingEmail, QueueEmailInput, SendReceipt,
    WebhookError, WebhookHeaders, WebhookReconciler, register_handlers,
};
use atelier_db::entities::email_message::EmailStatus;
use atelier_queue::{
    Dispatcher, HandlerRegistry, MemoryTaskStore, NewTask, RetryConfig, Task, TaskName, TaskQueue,
    TaskStatus, TaskStore,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::Mutex;

/// Records sends; fails while `failing` is set.
#[derive(Default)]
struct RecordingProvider {
    sent: Mutex<Vec<OutgoingEmail>>,
    failing: AtomicBool,
}

#[async_trait]
impl EmailProvider for RecordingProvider {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, email: &OutgoingEmail) -> AppResult<SendReceipt> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::ExternalService("mailbox unavailable".to_string()));
        }
        let mut sent = self.sent.lock().await;
        sent.push(email.clone());
        Ok(SendReceipt {
            provider_message_id: format!("re_{}", sent.len()),
        })
    }
}

/// Task store whose first `insert_failures` inserts fail. Tracks how many
/// inserts overlap.
struct FlakyTaskStore {
    inner: MemoryTaskStore,
    insert_failures: AtomicU32,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

#[async_trait]
impl TaskStore for FlakyTaskStore {
    async fn insert(&self, task: NewTask) -> AppResult<Task> {
        let remaining = self.insert_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.insert_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::Database("connection reset".to_string()));
        }
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        let result = self.inner.insert(task).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn claim_next_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> AppResult<Option<Task>> {
        self.inner.claim_next_due(now, worker_id, lease_expires_at).await
    }

    async fn mark_completed(&self, id: &str, worker_id: &str, now: DateTime<Utc>) -> AppResult<bool> {
        self.inner.mark_completed(id, worker_id, now).await
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
        self.inner
            .mark_failed(id, worker_id, error, now, next_run_at, max_attempts)
            .await
    }

    async fn get(&self, id: &str) -> AppResult<Option<Task>> {
        self.inner.get(id).await
    }
}

struct Pipeline {
    clock: ManualClock,
    emails: MemoryEmailStore,
    tasks: MemoryTaskStore,
    provider: Arc<RecordingProvider>,
    task_store: Arc<FlakyTaskStore>,
    service: EmailService,
    queue: TaskQueue,
}

fn email_config() -> EmailConfig {
    EmailConfig {
        provider: EmailProviderKind::Log,
        api_key: None,
        api_base_url: "https://api.resend.com".to_string(),
        from_address: "hello@atelier.example".to_string(),
        from_name: "Atelier".to_string(),
        reply_to: None,
        webhook_secret: None,
        site_name: "Atelier".to_string(),
        site_url: "https://atelier.example".to_string(),
    }
}

async fn pipeline(inline_drain: bool) -> Pipeline {
    pipeline_with_insert_failures(inline_drain, 0).await
}

async fn pipeline_with_insert_failures(inline_drain: bool, insert_failures: u32) -> Pipeline {
    let clock = ManualClock::new(chrono::Utc::now());
    let shared: SharedClock = Arc::new(clock.clone());
    let emails = MemoryEmailStore::new();
    let tasks = MemoryTaskStore::new();
    let provider = Arc::new(RecordingProvider::default());

    let registry = HandlerRegistry::new();
    let store: Arc<dyn EmailStore> = Arc::new(emails.clone());
    register_handlers(
        &registry,
        EmailSendHandler::new(store.clone(), provider.clone(), shared.clone()),
    )
    .await;

    let flaky = Arc::new(FlakyTaskStore {
        inner: tasks.clone(),
        insert_failures: AtomicU32::new(insert_failures),
        in_flight: AtomicU32::new(0),
        peak_in_flight: AtomicU32::new(0),
    });
    let task_store: Arc<dyn TaskStore> = flaky.clone();
    let dispatcher = Dispatcher::new(
        task_store.clone(),
        registry,
        RetryConfig::default(),
        shared.clone(),
    );
    let queue_config = QueueConfig {
        inline_drain,
        ..QueueConfig::default()
    };
    let queue = TaskQueue::new(task_store, dispatcher, shared.clone(), &queue_config);

    let service = EmailService::new(
        store,
        Arc::new(BuiltinTemplates::new("Atelier", "https://atelier.example")),
        queue.clone(),
        shared,
        provider.name(),
        &email_config(),
    );

    Pipeline {
        clock,
        emails,
        tasks,
        provider,
        task_store: flaky,
        service,
        queue,
    }
}

fn welcome(to: &str, key: Option<&str>) -> QueueEmailInput {
    QueueEmailInput {
        to_email: to.to_string(),
        template_key: "auth-welcome".to_string(),
        payload: json!({ "name": "Ada" }),
        idempotency_key: key.map(str::to_string),
        ..QueueEmailInput::default()
    }
}

async fn send_task_count(tasks: &MemoryTaskStore) -> usize {
    tasks
        .all()
        .await
        .iter()
        .filter(|t| t.name == TaskName::EmailSend)
        .count()
}

#[tokio::test]
async fn test_same_idempotency_key_queues_once() {
    let p = pipeline(true).await;

    let first = p
        .service
        .queue_templated_email(welcome("a@b.com", Some("user:1:welcome")))
        .await
        .unwrap();
    let second = p
        .service
        .queue_templated_email(welcome("a@b.com", Some("user:1:welcome")))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(p.emails.message_count().await, 1);
    assert_eq!(send_task_count(&p.tasks).await, 1);
    assert_eq!(p.provider.sent.lock().await.len(), 1);
}

#[tokio::test]
async fn test_drain_sends_and_records_one_event() {
    let p = pipeline(false).await;
    let message = p
        .service
        .queue_templated_email(welcome("a@b.com", None))
        .await
        .unwrap();
    assert_eq!(message.status, EmailStatus::Queued);

    let report = p.queue.drain(10).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);

    let stored = p.emails.find_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EmailStatus::Sent);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.provider_message_id.as_deref(), Some("re_1"));

    let events = p.emails.events_for_message(&message.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "email.sent");
    assert_eq!(events[0].payload["providerMessageId"], "re_1");

    let sent = p.provider.sent.lock().await;
    assert_eq!(sent[0].subject, "Welcome to Atelier");
    assert_eq!(sent[0].from, "Atelier <hello@atelier.example>");
    assert!(sent[0].tags.iter().any(|t| t.name == "topic" && t.value == "auth"));
}

#[tokio::test]
async fn test_provider_failure_completes_task_and_fails_message() {
    let p = pipeline(false).await;
    p.provider.failing.store(true, Ordering::SeqCst);

    let message = p
        .service
        .queue_templated_email(welcome("a@b.com", Some("user:2:welcome")))
        .await
        .unwrap();
    let report = p.queue.drain(10).await.unwrap();
    assert_eq!(report.failed, 0);

    let stored = p.emails.find_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EmailStatus::Failed);
    assert!(stored.last_error.unwrap().contains("mailbox unavailable"));

    let tasks = p.tasks.all().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Completed);

    let events = p.emails.events_for_message(&message.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "email.failed");

    // Operator retry once the provider recovers.
    p.provider.failing.store(false, Ordering::SeqCst);
    p.service.retry_email_message(&message.id).await.unwrap();
    p.queue.drain(10).await.unwrap();

    let stored = p.emails.find_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EmailStatus::Sent);
    assert_eq!(stored.attempts, 2);
}

#[tokio::test]
async fn test_retry_requires_failed_message() {
    let p = pipeline(true).await;
    let message = p
        .service
        .queue_templated_email(welcome("a@b.com", None))
        .await
        .unwrap();

    let err = p.service.retry_email_message(&message.id).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let err = p.service.retry_email_message("missing").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_duplicate_send_tasks_deliver_once() {
    let p = pipeline(false).await;
    let message = p
        .service
        .queue_templated_email(welcome("a@b.com", None))
        .await
        .unwrap();
    p.queue
        .enqueue(TaskName::EmailSend, json!({ "messageId": message.id }), None)
        .await
        .unwrap();
    p.queue
        .enqueue(TaskName::EmailSend, json!({ "messageId": "gone" }), None)
        .await
        .unwrap();

    let report = p.queue.drain(10).await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(p.provider.sent.lock().await.len(), 1);
    assert!(
        p.tasks
            .all()
            .await
            .iter()
            .all(|t| t.status == TaskStatus::Completed)
    );
}

#[tokio::test]
async fn test_unknown_template_queues_nothing() {
    let p = pipeline(true).await;
    let mut input = welcome("a@b.com", None);
    input.template_key = "auth-farewell".to_string();

    let err = p.service.queue_templated_email(input).await.unwrap_err();
    assert!(matches!(err, AppError::Template(_)));
    assert_eq!(p.emails.message_count().await, 0);
    assert!(p.tasks.all().await.is_empty());
}

#[tokio::test]
async fn test_bulk_tolerates_partial_failure() {
    let p = pipeline(false).await;
    let input = BulkQueueEmailInput {
        recipients: vec![
            BulkRecipient {
                to_email: "one@b.com".to_string(),
                ..BulkRecipient::default()
            },
            BulkRecipient {
                to_email: "not-an-email".to_string(),
                ..BulkRecipient::default()
            },
            BulkRecipient {
                to_email: "three@b.com".to_string(),
                payload: Some(json!({ "excerpt": "Just for you" })),
                ..BulkRecipient::default()
            },
        ],
        template_key: "blog-published".to_string(),
        payload: json!({ "title": "Spring show", "url": "https://atelier.example/blog/spring" }),
        correlation_key: Some("post-42".to_string()),
        ..BulkQueueEmailInput::default()
    };

    let report = p.service.queue_bulk_templated_email(input.clone()).await;
    assert_eq!(report.queued, 2);
    assert_eq!(report.failed, 1);

    let again = p.service.queue_bulk_templated_email(input).await;
    assert_eq!(again.queued, 2);
    assert_eq!(p.emails.message_count().await, 2);
    assert_eq!(send_task_count(&p.tasks).await, 2);

    let existing = p
        .emails
        .find_by_idempotency_key("blog:blog-published:one@b.com:post-42")
        .await
        .unwrap();
    assert!(existing.is_some());
}

#[tokio::test]
async fn test_bulk_bounds_concurrent_recipients() {
    let p = pipeline(false).await;
    let input = BulkQueueEmailInput {
        recipients: (0..30)
            .map(|i| BulkRecipient {
                to_email: format!("reader{i}@b.com"),
                ..BulkRecipient::default()
            })
            .collect(),
        template_key: "auth-welcome".to_string(),
        ..BulkQueueEmailInput::default()
    };

    let report = p.service.queue_bulk_templated_email(input).await;
    assert_eq!(report.queued, 30);
    assert_eq!(send_task_count(&p.tasks).await, 30);

    let peak = p.task_store.peak_in_flight.load(Ordering::SeqCst);
    assert!((1..=8).contains(&peak), "peak in-flight inserts: {peak}");
}

#[tokio::test]
async fn test_bulk_keys_fall_back_to_index() {
    let p = pipeline(false).await;
    let input = BulkQueueEmailInput {
        recipients: vec![BulkRecipient {
            to_email: "one@b.com".to_string(),
            ..BulkRecipient::default()
        }],
        template_key: "auth-welcome".to_string(),
        ..BulkQueueEmailInput::default()
    };

    assert_eq!(p.service.queue_bulk_templated_email(input).await.queued, 1);
    assert!(
        p.emails
            .find_by_idempotency_key("auth:auth-welcome:one@b.com:0")
            .await
            .unwrap()
            .is_some()
    );
}

fn reconciler(p: &Pipeline, secret: Option<&str>, environment: Environment) -> WebhookReconciler {
    WebhookReconciler::new(
        Arc::new(p.emails.clone()),
        secret,
        environment,
        Arc::new(p.clock.clone()),
    )
    .unwrap()
}

async fn sent_message(p: &Pipeline) -> String {
    let message = p
        .service
        .queue_templated_email(welcome("a@b.com", None))
        .await
        .unwrap();
    message.id
}

#[tokio::test]
async fn test_bounce_webhook_updates_status() {
    let p = pipeline(true).await;
    let id = sent_message(&p).await;
    let webhooks = reconciler(&p, None, Environment::Development);

    let body = json!({
        "type": "email.bounced",
        "created_at": p.clock.utc().to_rfc3339(),
        "data": { "email_id": "re_1", "to": ["a@b.com"] }
    })
    .to_string();
    let outcome = webhooks
        .handle(body.as_bytes(), &WebhookHeaders::default())
        .await
        .unwrap();

    assert!(outcome.supported);
    assert!(outcome.status_updated);
    assert_eq!(outcome.message_id.as_deref(), Some(id.as_str()));

    let stored = p.emails.find_message(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, EmailStatus::Bounced);
    let events = p.emails.events_for_message(&id).await.unwrap();
    assert_eq!(events.last().unwrap().event_type, "email.bounced");
}

#[tokio::test]
async fn test_unsupported_webhook_only_appends_event() {
    let p = pipeline(true).await;
    let id = sent_message(&p).await;
    let webhooks = reconciler(&p, None, Environment::Development);
    let before = p.emails.all_events().await.len();

    let body = json!({ "type": "contact.created", "data": { "email_id": "re_1" } }).to_string();
    let outcome = webhooks
        .handle(body.as_bytes(), &WebhookHeaders::default())
        .await
        .unwrap();

    assert!(!outcome.supported);
    assert!(!outcome.status_updated);
    assert_eq!(p.emails.all_events().await.len(), before + 1);
    let stored = p.emails.find_message(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, EmailStatus::Sent);
}

#[tokio::test]
async fn test_stale_webhook_does_not_overwrite_newer_status() {
    let p = pipeline(true).await;
    let id = sent_message(&p).await;
    let webhooks = reconciler(&p, None, Environment::Development);
    let now = p.clock.utc();

    let bounced = json!({
        "type": "email.bounced",
        "created_at": (now + Duration::seconds(10)).to_rfc3339(),
        "data": { "email_id": "re_1" }
    })
    .to_string();
    let delivered = json!({
        "type": "email.delivered",
        "created_at": (now + Duration::seconds(5)).to_rfc3339(),
        "data": { "email_id": "re_1" }
    })
    .to_string();

    webhooks
        .handle(bounced.as_bytes(), &WebhookHeaders::default())
        .await
        .unwrap();
    let outcome = webhooks
        .handle(delivered.as_bytes(), &WebhookHeaders::default())
        .await
        .unwrap();

    assert!(!outcome.status_updated);
    let stored = p.emails.find_message(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, EmailStatus::Bounced);
    // Both events are kept.
    assert_eq!(p.emails.events_for_message(&id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_oversized_webhook_never_touches_store() {
    let p = pipeline(true).await;
    let webhooks = reconciler(&p, None, Environment::Development);
    let body = vec![b' '; 300 * 1024];

    let err = webhooks
        .handle(&body, &WebhookHeaders::default())
        .await
        .unwrap_err();

    assert!(matches!(err, WebhookError::PayloadTooLarge(_)));
    assert!(p.emails.all_events().await.is_empty());
}

#[tokio::test]
async fn test_production_requires_secret() {
    let p = pipeline(true).await;
    let webhooks = reconciler(&p, None, Environment::Production);

    let err = webhooks
        .handle(br#"{"type":"email.delivered"}"#, &WebhookHeaders::default())
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::VerificationRequired));
}

#[tokio::test]
async fn test_signed_webhook_round_trip() {
    use base64::Engine;

    let p = pipeline(true).await;
    let raw_secret = b"0123456789abcdef0123456789abcdef";
    let secret = format!(
        "whsec_{}",
        base64::engine::general_purpose::STANDARD.encode(raw_secret)
    );
    let webhooks = reconciler(&p, Some(&secret), Environment::Production);

    let body = br#"{"type":"email.delivery_delayed","data":{"email_id":"re_404"}}"#;
    let ts = p.clock.utc().timestamp();
    let headers = WebhookHeaders {
        id: Some("msg_1".to_string()),
        timestamp: Some(ts.to_string()),
        signature: Some(sign_payload(raw_secret, "msg_1", ts, body)),
    };

    let outcome = webhooks.handle(body, &headers).await.unwrap();
    assert!(outcome.supported);
    assert!(!outcome.status_updated);
    assert!(outcome.message_id.is_none());

    let events = p.emails.all_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].provider_event_id.as_deref(), Some("msg_1"));

    let unsigned = webhooks.handle(body, &WebhookHeaders::default()).await;
    assert!(matches!(unsigned, Err(WebhookError::MissingHeaders)));
}

#[tokio::test]
async fn test_failed_enqueue_leaves_message_sendable() {
    let p = pipeline_with_insert_failures(true, 1).await;

    let err = p
        .service
        .queue_templated_email(welcome("a@b.com", Some("user:1:welcome")))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Database(_)));
    assert_eq!(send_task_count(&p.tasks).await, 0);

    let stored = p.emails.find_by_idempotency_key("user:1:welcome").await.unwrap().unwrap();
    assert_eq!(stored.status, EmailStatus::Failed);
    assert!(stored.last_error.unwrap().contains("connection reset"));

    // The same key picks the stranded message back up and sends it once.
    let again = p
        .service
        .queue_templated_email(welcome("a@b.com", Some("user:1:welcome")))
        .await
        .unwrap();
    assert_eq!(again.id, stored.id);
    assert_eq!(send_task_count(&p.tasks).await, 1);

    let sent = p.emails.find_message(&stored.id).await.unwrap().unwrap();
    assert_eq!(sent.status, EmailStatus::Sent);
    assert_eq!(p.provider.sent.lock().await.len(), 1);

    // Once attempted, the key is settled and nothing more is queued.
    p.service
        .queue_templated_email(welcome("a@b.com", Some("user:1:welcome")))
        .await
        .unwrap();
    assert_eq!(send_task_count(&p.tasks).await, 1);
    assert_eq!(p.provider.sent.lock().await.len(), 1);
}

#[tokio::test]
async fn test_failed_enqueue_can_be_retried() {
    let p = pipeline_with_insert_failures(false, 1).await;

    assert!(
        p.service
            .queue_templated_email(welcome("a@b.com", Some("user:2:welcome")))
            .await
            .is_err()
    );
    let stranded = p.emails.find_by_idempotency_key("user:2:welcome").await.unwrap().unwrap();
    assert_eq!(stranded.status, EmailStatus::Failed);

    p.service.retry_email_message(&stranded.id).await.unwrap();
    assert_eq!(p.queue.drain(10).await.unwrap().processed, 1);

    let sent = p.emails.find_message(&stranded.id).await.unwrap().unwrap();
    assert_eq!(sent.status, EmailStatus::Sent);
}
