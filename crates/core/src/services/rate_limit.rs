//! Fixed-window rate limiting.
//!
//! Counters live in `PostgreSQL` so every instance shares them. When the
//! database is unavailable the limiter degrades to an in-process map with the
//! same window rules; callers always get a decision, never an error. The
//! in-process map is best-effort and single-instance only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atelier_common::{AppResult, SharedClock};
use atelier_db::entities::rate_limit_bucket;
use atelier_db::repositories::RateLimitBucketRepository;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// A limit over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Hits allowed per window.
    pub limit: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimitRule {
    /// Create a rule from a window length in milliseconds.
    #[must_use]
    pub const fn new(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window: Duration::from_millis(window_ms),
        }
    }
}

/// Result of counting one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the hit is allowed.
    pub allowed: bool,
    /// Configured limit.
    pub limit: u32,
    /// Hits left in the current window.
    pub remaining: u32,
    /// End of the current window.
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, at least 1.
    #[must_use]
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

/// Stored window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Hits counted in the window.
    pub count: u32,
    /// End of the window.
    pub reset_at: DateTime<Utc>,
}

/// Count one hit against `bucket`.
///
/// An expired or missing bucket starts a new window at `now`. The count never
/// passes `rule.limit`; denied hits leave the bucket unchanged.
#[must_use]
pub fn apply_hit(bucket: Option<Bucket>, rule: RateLimitRule, now: DateTime<Utc>) -> (Bucket, RateLimitDecision) {
    let window = chrono::Duration::from_std(rule.window).unwrap_or(chrono::Duration::MAX);

    let current = match bucket {
        Some(bucket) if now < bucket.reset_at => bucket,
        _ => Bucket {
            count: 0,
            reset_at: now + window,
        },
    };

    if current.count < rule.limit {
        let next = Bucket {
            count: current.count + 1,
            reset_at: current.reset_at,
        };
        let decision = RateLimitDecision {
            allowed: true,
            limit: rule.limit,
            remaining: rule.limit - next.count,
            reset_at: next.reset_at,
        };
        (next, decision)
    } else {
        let decision = RateLimitDecision {
            allowed: false,
            limit: rule.limit,
            remaining: 0,
            reset_at: current.reset_at,
        };
        (current, decision)
    }
}

/// Where counters are kept.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Count one hit for `key`.
    async fn hit(&self, key: &str, rule: RateLimitRule, now: DateTime<Utc>)
    -> AppResult<RateLimitDecision>;

    /// Drop buckets whose window ended before `now`; returns how many.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> AppResult<u64> {
        Ok(0)
    }
}

/// Shared counters in the `rate_limit_bucket` table.
#[derive(Clone)]
pub struct PostgresRateLimitBackend {
    repo: RateLimitBucketRepository,
}

impl PostgresRateLimitBackend {
    /// Create a backend over the bucket repository.
    #[must_use]
    pub const fn new(repo: RateLimitBucketRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl RateLimitBackend for PostgresRateLimitBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn hit(
        &self,
        key: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitDecision> {
        self.repo
            .update_locked(key, now, |row| {
                let stored = Bucket {
                    count: row.count.max(0) as u32,
                    reset_at: row.reset_at.with_timezone(&Utc),
                };
                let (next, decision) = apply_hit(Some(stored), rule, now);
                let row = rate_limit_bucket::Model {
                    key: row.key,
                    count: next.count as i32,
                    reset_at: next.reset_at.fixed_offset(),
                };
                (row, decision)
            })
            .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        self.repo.delete_expired(now).await
    }
}

/// Process-local counters.
#[derive(Clone, Default)]
pub struct MemoryRateLimitBackend {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl MemoryRateLimitBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked keys.
    pub async fn key_count(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

#[async_trait]
impl RateLimitBackend for MemoryRateLimitBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn hit(
        &self,
        key: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitDecision> {
        let mut buckets = self.buckets.lock().await;
        let (next, decision) = apply_hit(buckets.get(key).copied(), rule, now);
        buckets.insert(key.to_string(), next);
        Ok(decision)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, b| b.reset_at >= now);
        Ok((before - buckets.len()) as u64)
    }
}

/// Rate limiter with an in-process fallback.
#[derive(Clone)]
pub struct RateLimiter {
    primary: Option<Arc<dyn RateLimitBackend>>,
    fallback: MemoryRateLimitBackend,
    clock: SharedClock,
}

impl RateLimiter {
    /// Limiter backed by `primary`, falling back to memory on errors.
    #[must_use]
    pub fn new(primary: Arc<dyn RateLimitBackend>, clock: SharedClock) -> Self {
        Self {
            primary: Some(primary),
            fallback: MemoryRateLimitBackend::new(),
            clock,
        }
    }

    /// Limiter that only counts in process.
    #[must_use]
    pub fn in_memory(clock: SharedClock) -> Self {
        Self {
            primary: None,
            fallback: MemoryRateLimitBackend::new(),
            clock,
        }
    }

    /// Current time on the limiter's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.utc()
    }

    /// Drop expired buckets from the primary store and the fallback.
    pub async fn purge_expired(&self) -> u64 {
        let now = self.clock.utc();
        let mut purged = self.fallback.purge_expired(now).await.unwrap_or(0);
        if let Some(primary) = &self.primary {
            match primary.purge_expired(now).await {
                Ok(n) => purged += n,
                Err(e) => tracing::warn!(
                    backend = primary.name(),
                    error = %e,
                    "Failed to purge expired rate limit buckets"
                ),
            }
        }
        purged
    }

    /// Count one hit for `key` under `rule`.
    pub async fn check(&self, key: &str, rule: RateLimitRule) -> RateLimitDecision {
        let now = self.clock.utc();

        if let Some(primary) = &self.primary {
            match primary.hit(key, rule, now).await {
                Ok(decision) => return decision,
                Err(e) => {
                    tracing::warn!(
                        backend = primary.name(),
                        key,
                        error = %e,
                        "Rate limit store unavailable, using in-memory fallback"
                    );
                }
            }
        }

        match self.fallback.hit(key, rule, now).await {
            Ok(decision) => decision,
            // The memory backend has no failure path; allow rather than block.
            Err(_) => RateLimitDecision {
                allowed: true,
                limit: rule.limit,
                remaining: rule.limit,
                reset_at: now,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use atelier_common::{AppError, ManualClock};

    struct Broken;

    #[async_trait]
    impl RateLimitBackend for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn hit(
            &self,
            _key: &str,
            _rule: RateLimitRule,
            _now: DateTime<Utc>,
        ) -> AppResult<RateLimitDecision> {
            Err(AppError::Database("connection refused".to_string()))
        }
    }

    #[test]
    fn test_apply_hit_counts_down_then_denies() {
        let rule = RateLimitRule::new(3, 60_000);
        let now = Utc::now();

        let mut bucket = None;
        let mut remaining = Vec::new();
        for _ in 0..3 {
            let (next, decision) = apply_hit(bucket, rule, now);
            assert!(decision.allowed);
            remaining.push(decision.remaining);
            bucket = Some(next);
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        let (after_deny, denied) = apply_hit(bucket, rule, now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(after_deny.count, 3);
    }

    #[test]
    fn test_zero_limit_always_denies() {
        let (bucket, decision) = apply_hit(None, RateLimitRule::new(0, 1000), Utc::now());
        assert!(!decision.allowed);
        assert_eq!(bucket.count, 0);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc::now();
        let decision = RateLimitDecision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_at: now + chrono::Duration::milliseconds(1500),
        };
        assert_eq!(decision.retry_after_secs(now), 2);
        assert_eq!(decision.retry_after_secs(now + chrono::Duration::seconds(5)), 1);
    }

    #[tokio::test]
    async fn test_window_resets_after_reset_at() {
        let clock = ManualClock::new(Utc::now());
        let limiter = RateLimiter::in_memory(Arc::new(clock.clone()));
        let rule = RateLimitRule::new(3, 60_000);

        for expected in [2, 1, 0] {
            let decision = limiter.check("contact:ip:203.0.113.7", rule).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }
        assert!(!limiter.check("contact:ip:203.0.113.7", rule).await.allowed);

        clock.advance(chrono::Duration::milliseconds(60_001));
        let decision = limiter.check("contact:ip:203.0.113.7", rule).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_store_outage_falls_back_to_memory() {
        let clock = ManualClock::new(Utc::now());
        let limiter = RateLimiter::new(Arc::new(Broken), Arc::new(clock));
        let rule = RateLimitRule::new(2, 60_000);

        assert!(limiter.check("k", rule).await.allowed);
        assert!(limiter.check("k", rule).await.allowed);
        assert!(!limiter.check("k", rule).await.allowed);
    }

    #[tokio::test]
    async fn test_limiter_purge_survives_store_outage() {
        let clock = ManualClock::new(Utc::now());
        let limiter = RateLimiter::new(Arc::new(Broken), Arc::new(clock.clone()));
        limiter.check("k", RateLimitRule::new(2, 60_000)).await;

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(limiter.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn test_memory_purge() {
        let backend = MemoryRateLimitBackend::new();
        let now = Utc::now();
        backend.hit("a", RateLimitRule::new(5, 1000), now).await.unwrap();
        backend.hit("b", RateLimitRule::new(5, 60_000), now).await.unwrap();

        let purged = backend
            .purge_expired(now + chrono::Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(backend.key_count().await, 1);
    }
}
