//! Application configuration.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Deployment environment, taken from `ATELIER_ENV` when loading.
    #[serde(default)]
    pub environment: Environment,
    /// Server configuration.
    pub server: ServerConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Email delivery configuration.
    pub email: EmailConfig,
    /// Background task queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development.
    #[default]
    Development,
    /// Automated tests.
    Test,
    /// Production deployment.
    Production,
}

impl Environment {
    /// Parse an environment name, defaulting to development.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "test" => Self::Test,
            _ => Self::Development,
        }
    }

    /// Whether this is a production deployment.
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of the site.
    pub url: String,
    /// Bearer token guarding the operator endpoints (drain, retry).
    #[serde(default)]
    pub ops_token: Option<String>,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Which email provider delivers messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailProviderKind {
    /// Resend HTTP API.
    Resend,
    /// Log messages instead of sending them.
    #[default]
    Log,
}

/// Email delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    /// Provider used for outgoing mail.
    #[serde(default)]
    pub provider: EmailProviderKind,
    /// Provider API key.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Provider API base URL.
    #[serde(default = "default_email_api_base")]
    pub api_base_url: String,
    /// From address.
    pub from_address: String,
    /// From display name.
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// Default reply-to address.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Signing secret for inbound provider webhooks.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Site name used by templates.
    #[serde(default = "default_site_name")]
    pub site_name: String,
    /// Site URL used by templates.
    #[serde(default = "default_site_url")]
    pub site_url: String,
}

impl EmailConfig {
    /// Formatted `Name <address>` sender.
    #[must_use]
    pub fn from_header(&self) -> String {
        format!("{} <{}>", self.from_name, self.from_address)
    }
}

/// Background task queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Drain due tasks right after an immediately-due enqueue.
    #[serde(default = "default_true")]
    pub inline_drain: bool,
    /// Maximum tasks processed by an inline drain.
    #[serde(default = "default_inline_drain_limit")]
    pub inline_drain_limit: usize,
    /// Attempts before a task becomes terminally failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before a failed task becomes claimable again.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// How long a claim is owned before another worker may reclaim it.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Interval of the background poller.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Tasks processed per poller tick.
    #[serde(default = "default_poll_batch")]
    pub poll_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            inline_drain: true,
            inline_drain_limit: default_inline_drain_limit(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            lease_secs: default_lease_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_batch: default_poll_batch(),
        }
    }
}

impl QueueConfig {
    /// Backoff as a duration.
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    /// Lease as a duration.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Webhook requests allowed per window and client.
    #[serde(default = "default_webhook_limit")]
    pub webhook_limit: u32,
    /// Webhook window length in milliseconds.
    #[serde(default = "default_webhook_window_ms")]
    pub webhook_window_ms: u64,
    /// Reverse proxies allowed to report the client address in forwarding
    /// headers. Requests from any other peer are keyed by the peer address.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            webhook_limit: default_webhook_limit(),
            webhook_window_ms: default_webhook_window_ms(),
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

const fn default_max_connections() -> u32 {
    20
}

const fn default_min_connections() -> u32 {
    2
}

fn default_email_api_base() -> String {
    "https://api.resend.com".to_string()
}

fn default_from_name() -> String {
    "Atelier".to_string()
}

fn default_site_name() -> String {
    "Atelier".to_string()
}

fn default_site_url() -> String {
    "http://localhost:3000".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_inline_drain_limit() -> usize {
    10
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_backoff_secs() -> u64 {
    30
}

const fn default_lease_secs() -> u64 {
    300
}

const fn default_poll_interval_secs() -> u64 {
    60
}

const fn default_poll_batch() -> usize {
    50
}

const fn default_webhook_limit() -> u32 {
    120
}

const fn default_webhook_window_ms() -> u64 {
    60_000
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `ATELIER_ENV`)
    /// 3. Environment variables with `ATELIER__` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("ATELIER_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("ATELIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override("environment", Environment::from_name(&env).as_str())?
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("ATELIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

impl Environment {
    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Production => "production",
        }
    }
}
