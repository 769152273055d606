//! Fixed-window rate limiter for message budgets and auth attempts.
//!
//! Each key owns one bucket `{window_start, count}`. A consumption increments
//! the bucket atomically and succeeds while the count stays within the limit;
//! the count only returns to zero when time crosses into a new window.
//! Buckets are keyed by user (or peer address), never by connection, so they
//! survive reconnects.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// State of one bucket after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub count: u32,
    pub window_start: Instant,
}

/// Backing store for rate-limit counters.
///
/// `increment` must be atomic per key: concurrent calls for the same key see
/// distinct counts.
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key`, starting a fresh window first if the
    /// current one ended before `now`.
    fn increment(&self, key: &str, window: Duration, now: Instant) -> Counter;

    /// Drop the counter for `key`.
    fn reset(&self, key: &str);

    /// Drop counters whose window ended before `now`. Returns how many.
    fn purge_expired(&self, window: Duration, now: Instant) -> usize;
}

/// In-memory counter store. Locking is per shard of keys, not global.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    buckets: DashMap<String, Counter>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl CounterStore for MemoryCounterStore {
    fn increment(&self, key: &str, window: Duration, now: Instant) -> Counter {
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Counter {
            count: 0,
            window_start: now,
        });
        let elapsed = now.saturating_duration_since(bucket.window_start);
        if elapsed >= window {
            // Align to the window grid so a late caller cannot stretch a window.
            let into_window = elapsed.as_nanos() % window.as_nanos().max(1);
            bucket.window_start = now - Duration::from_nanos(into_window as u64);
            bucket.count = 0;
        }
        bucket.count = bucket.count.saturating_add(1);
        *bucket
    }

    fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    fn purge_expired(&self, window: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.window_start) < window);
        before.saturating_sub(self.buckets.len())
    }
}

/// Result of a consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// A rate limiter with a per-key limit over a fixed window.
pub struct RateLimiter {
    /// Maximum consumptions allowed within the window.
    limit: u32,
    window: Duration,
    store: Box<dyn CounterStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create an in-memory limiter.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self::with_store(limit, window, Box::new(MemoryCounterStore::new()))
    }

    pub fn with_store(limit: u32, window: Duration, store: Box<dyn CounterStore>) -> Self {
        Self {
            limit,
            window,
            store,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Consume one unit of `key`'s budget if any is left.
    pub fn check_and_consume(&self, key: &str) -> RateDecision {
        self.check_and_consume_at(key, Instant::now())
    }

    pub fn check_and_consume_at(&self, key: &str, now: Instant) -> RateDecision {
        let counter = self.store.increment(key, self.window, now);
        if counter.count <= self.limit {
            RateDecision::Allowed {
                remaining: self.limit - counter.count,
            }
        } else {
            let window_end = counter.window_start + self.window;
            let retry_after = window_end.saturating_duration_since(now);
            debug!(key, count = counter.count, limit = self.limit, "rate limited");
            RateDecision::Denied { retry_after }
        }
    }

    /// Clear `key`'s bucket immediately.
    pub fn reset(&self, key: &str) {
        self.store.reset(key);
    }

    /// Garbage-collect buckets whose window has ended.
    pub fn gc(&self) -> usize {
        self.store.purge_expired(self.window, Instant::now())
    }
}

/// Pre-configured rate limiters for the gateway.
#[derive(Debug)]
pub struct ServerRateLimits {
    /// Inbound message budget per user.
    pub messages: RateLimiter,
    /// Auth attempts per peer address.
    pub auth: RateLimiter,
}

impl ServerRateLimits {
    pub fn new(config: &crate::config::GatewayConfig) -> Self {
        Self {
            messages: RateLimiter::new(config.rate_limit, config.rate_window),
            auth: RateLimiter::new(config.auth_attempts, config.auth_window),
        }
    }

    /// Run garbage collection on all limiters.
    pub fn gc(&self) -> usize {
        self.messages.gc() + self.auth.gc()
    }
}
