//! Atelier server entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use atelier_api::{AppState, router as api_router};
use atelier_common::{Config, system_clock};
use atelier_core::{
    BuiltinTemplates, EmailSendHandler, EmailService, EmailStore, PostgresRateLimitBackend,
    RateLimitRule, RateLimiter, SeaOrmEmailStore, WebhookReconciler, provider_from_config,
    register_handlers,
};
use atelier_db::repositories::{
    BackgroundTaskRepository, EmailEventRepository, EmailMessageRepository,
    RateLimitBucketRepository,
};
use atelier_queue::{
    Dispatcher, HandlerRegistry, PollerConfig, PostgresTaskStore, RetryConfig, TaskQueue,
    TaskStore, run_poller,
};
use axum::Router;
use tokio::signal;
use tokio::sync::watch;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Interval between sweeps of expired rate limit buckets.
const RATE_LIMIT_SWEEP: Duration = Duration::from_secs(600);

/// Largest request body accepted by any route.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "atelier=debug,tower_http=debug".into());
    let json = std::env::var("ATELIER_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Periodically drop expired rate limit buckets until shutdown.
async fn sweep_rate_limits(limiter: RateLimiter, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(RATE_LIMIT_SWEEP);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let purged = limiter.purge_expired().await;
                if purged > 0 {
                    info!(purged, "Purged expired rate limit buckets");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is normal outside development.
    let _ = dotenvy::dotenv();
    init_tracing();

    info!("Starting atelier server...");

    // Load configuration
    let config = Config::load()?;
    info!(environment = config.environment.as_str(), "Configuration loaded");

    // Connect to database
    let db = Arc::new(atelier_db::init(&config).await?);
    info!("Connected to database");

    // Run migrations
    info!("Running database migrations...");
    atelier_db::migrate(&db).await?;
    info!("Migrations completed");

    let clock = system_clock();

    // Task queue
    let task_repo = BackgroundTaskRepository::new(Arc::clone(&db));
    task_repo.ensure_schema().await?;
    let task_store: Arc<dyn TaskStore> = Arc::new(PostgresTaskStore::new(task_repo));

    // Email pipeline
    let email_store: Arc<dyn EmailStore> = Arc::new(SeaOrmEmailStore::new(
        EmailMessageRepository::new(Arc::clone(&db)),
        EmailEventRepository::new(Arc::clone(&db)),
    ));
    let provider = provider_from_config(&config.email)?;
    info!(provider = provider.name(), "Email provider configured");

    // Handlers are registered before anything can drain the queue.
    let registry = HandlerRegistry::new();
    register_handlers(
        &registry,
        EmailSendHandler::new(email_store.clone(), provider.clone(), clock.clone()),
    )
    .await;
    info!(handlers = ?registry.names().await, "Registered task handlers");

    let dispatcher = Dispatcher::new(
        task_store.clone(),
        registry,
        RetryConfig::from(&config.queue),
        clock.clone(),
    );
    let task_queue = TaskQueue::new(task_store, dispatcher.clone(), clock.clone(), &config.queue);

    let email_service = EmailService::new(
        email_store.clone(),
        Arc::new(BuiltinTemplates::new(
            config.email.site_name.clone(),
            config.email.site_url.clone(),
        )),
        task_queue.clone(),
        clock.clone(),
        provider.name(),
        &config.email,
    );

    if config.email.webhook_secret.is_none() {
        if config.environment.is_production() {
            warn!("No email webhook secret configured; provider webhooks will be rejected");
        } else {
            warn!("No email webhook secret configured; signatures are not checked");
        }
    }
    let reconciler = WebhookReconciler::new(
        email_store.clone(),
        config.email.webhook_secret.as_deref(),
        config.environment,
        clock.clone(),
    )?;

    let rate_limiter = RateLimiter::new(
        Arc::new(PostgresRateLimitBackend::new(RateLimitBucketRepository::new(
            Arc::clone(&db),
        ))),
        clock,
    );

    let ops_token: Option<Arc<str>> = config
        .server
        .ops_token
        .clone()
        .filter(|t| !t.is_empty())
        .map(Arc::from);
    if ops_token.is_none() {
        warn!("No ops token configured; ops endpoints are disabled");
    }

    let state = AppState {
        email_service,
        email_store,
        task_queue,
        reconciler,
        rate_limiter: rate_limiter.clone(),
        webhook_rule: RateLimitRule::new(
            config.rate_limit.webhook_limit,
            config.rate_limit.webhook_window_ms,
        ),
        ops_token,
        trusted_proxies: config.rate_limit.trusted_proxies.clone().into(),
    };

    // Background workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = tokio::spawn(run_poller(
        dispatcher,
        PollerConfig::from(&config.queue),
        shutdown_rx.clone(),
    ));
    let sweeper = tokio::spawn(sweep_rate_limits(rate_limiter, shutdown_rx));

    // Build router
    let app = Router::new()
        .nest("/api", api_router(&state))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server with graceful shutdown
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop background workers; an in-flight drain finishes first.
    let _ = shutdown_tx.send(true);
    for (name, handle) in [("poller", poller), ("rate limit sweeper", sweeper)] {
        if let Err(e) = handle.await {
            error!(worker = name, error = %e, "Background worker did not stop cleanly");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
