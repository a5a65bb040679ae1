//! Retry policy for failed task runs.

use std::time::Duration;

use atelier_common::config::QueueConfig;
use chrono::{DateTime, Utc};

/// Longest `last_error` kept on a task row, in bytes.
pub const MAX_ERROR_LEN: usize = 1000;

/// Retry configuration with a fixed backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before a task becomes terminally failed.
    pub max_attempts: u32,
    /// Delay before a failed task becomes claimable again.
    pub backoff: Duration,
    /// How long a claim is owned before it may be reclaimed.
    pub lease: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(30),
            lease: Duration::from_secs(300),
        }
    }
}

impl From<&QueueConfig> for RetryConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: config.backoff(),
            lease: config.lease(),
        }
    }
}

impl RetryConfig {
    /// When a run failing at `now` becomes claimable again.
    #[must_use]
    pub fn next_run_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.backoff)
    }

    /// When a claim taken at `now` expires.
    #[must_use]
    pub fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.lease)
    }

    /// Whether a task with `attempts` finished runs may not run again.
    #[must_use]
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Cut an error message to [`MAX_ERROR_LEN`] bytes on a char boundary.
#[must_use]
pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let config = RetryConfig::default();
        let now = Utc::now();

        assert_eq!(config.next_run_at(now), now + chrono::Duration::seconds(30));
        assert_eq!(config.lease_until(now), now + chrono::Duration::seconds(300));
    }

    #[test]
    fn test_is_exhausted() {
        let config = RetryConfig {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(!config.is_exhausted(2));
        assert!(config.is_exhausted(3));
        assert!(config.is_exhausted(4));
    }

    #[test]
    fn test_truncate_error_respects_char_boundary() {
        let long = "é".repeat(MAX_ERROR_LEN);
        let cut = truncate_error(&long);

        assert!(cut.len() <= MAX_ERROR_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(truncate_error("short"), "short");
    }
}
