// SPDX-License-Identifier: MIT OR Apache-2.0
//! Redis-backed rate limiting and API-key lookup cache.
//!
//! Every request touches two Redis-backed concerns before it reaches a
//! handler: a fixed-window counter (tier rate limit, per-IP rate limit,
//! login brute-force limit — all the same primitive with a different key
//! and window) and a short-TTL cache that saves a database round trip when
//! resolving an API key to its owning tenant. Both are expressed against
//! the [`CounterStore`] trait so the decision logic can be unit tested
//! without a real Redis server; [`RedisStore`] is the production backend.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

/// Errors from the rate-limit/cache store.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The underlying store returned an error.
    #[error("store error: {0}")]
    Store(String),
}

impl From<redis::RedisError> for RateLimitError {
    fn from(e: redis::RedisError) -> Self {
        Self::Store(e.to_string())
    }
}

/// Minimal counter/cache primitive that both [`RateLimiter`] and
/// [`KeyCache`] are built on.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` and return the post-increment value. If
    /// this is the first increment (i.e. the key did not previously exist),
    /// the key is given a TTL of `ttl_secs`.
    async fn increment_with_expiry(&self, key: &str, ttl_secs: u64) -> Result<u64, RateLimitError>;

    /// Fetch a cached string value, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<String>, RateLimitError>;

    /// Store a string value with a TTL, overwriting any prior value.
    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), RateLimitError>;

    /// Remove a key immediately (used to invalidate a cached lookup after a
    /// key is revoked).
    async fn delete(&self, key: &str) -> Result<(), RateLimitError>;
}

/// Production [`CounterStore`] backed by a shared Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Wrap an existing Redis connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_with_expiry(&self, key: &str, ttl_secs: u64) -> Result<u64, RateLimitError> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.incr(key, 1_u64).await?;
        if count == 1 {
            let _: () = conn.expire(key, ttl_secs as i64).await?;
        }
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RateLimitError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request is allowed to proceed.
    pub allowed: bool,
    /// The configured ceiling for this window.
    pub limit: u64,
    /// Requests remaining in the current window, floored at zero.
    pub remaining: u64,
    /// Seconds the caller should wait before retrying. Zero while allowed;
    /// once a blockout has been triggered this is the blockout's actual
    /// remaining time, not just the bare window width.
    pub retry_after_secs: u64,
}

/// A fixed-window rate limiter over any [`CounterStore`], with an
/// escalating blockout layered on top.
///
/// One instance is reused for every rate-limited concern (tier limits, IP
/// limits, login attempt limits) — callers distinguish them purely by key
/// prefix, e.g. `ratelimit:tier:{tenant_id}` vs `ratelimit:ip:{addr}` vs
/// `ratelimit:login:{identifier}`. Each concern picks its own blockout
/// window (tier 60s, IP 300s, login 1800s); the counter window and the
/// blockout window are independent durations.
#[derive(Clone)]
pub struct RateLimiter<S: CounterStore> {
    store: S,
}

impl<S: CounterStore> RateLimiter<S> {
    /// Wrap a [`CounterStore`].
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Increment the counter for `key` and decide whether this request is
    /// within `max_requests` for the current `window_secs` window. No
    /// blockout is applied — once the window rolls over, the caller is
    /// immediately allowed again. Most callers want
    /// [`RateLimiter::check_with_blockout`] instead.
    pub async fn check(
        &self,
        key: &str,
        max_requests: u64,
        window_secs: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let count = self.store.increment_with_expiry(key, window_secs).await?;
        let allowed = count <= max_requests;
        Ok(RateLimitDecision {
            allowed,
            limit: max_requests,
            remaining: max_requests.saturating_sub(count),
            retry_after_secs: if allowed { 0 } else { window_secs },
        })
    }

    /// Like [`RateLimiter::check`], but once a caller exceeds
    /// `max_requests` within `window_secs` it is locked out for
    /// `blockout_secs` regardless of the counter window rolling over —
    /// every request during the blockout is denied without incrementing
    /// the counter again, and `retry_after_secs` reflects the blockout's
    /// actual remaining time.
    pub async fn check_with_blockout(
        &self,
        key: &str,
        max_requests: u64,
        window_secs: u64,
        blockout_secs: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let blockout_key = blockout_key(key);
        if let Some(until) = self
            .store
            .get(&blockout_key)
            .await?
            .and_then(|v| v.parse::<u64>().ok())
        {
            let now = now_unix();
            if until > now {
                return Ok(RateLimitDecision {
                    allowed: false,
                    limit: max_requests,
                    remaining: 0,
                    retry_after_secs: until - now,
                });
            }
        }

        let count = self.store.increment_with_expiry(key, window_secs).await?;
        if count <= max_requests {
            return Ok(RateLimitDecision {
                allowed: true,
                limit: max_requests,
                remaining: max_requests - count,
                retry_after_secs: 0,
            });
        }

        let until = now_unix() + blockout_secs;
        self.store
            .set_with_expiry(&blockout_key, &until.to_string(), blockout_secs)
            .await?;
        Ok(RateLimitDecision {
            allowed: false,
            limit: max_requests,
            remaining: 0,
            retry_after_secs: blockout_secs,
        })
    }
}

fn blockout_key(key: &str) -> String {
    format!("{key}:blockout")
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Short-TTL cache mapping an API key's hash to its owning tenant id,
/// avoiding a database round trip on every authenticated request.
#[derive(Clone)]
pub struct KeyCache<S: CounterStore> {
    store: S,
    ttl_secs: u64,
}

impl<S: CounterStore> KeyCache<S> {
    /// Wrap a [`CounterStore`] with the TTL applied to cached entries.
    pub fn new(store: S, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    /// Look up the tenant id cached for `key_hash`, if present.
    pub async fn get_tenant_id(&self, key_hash: &str) -> Result<Option<String>, RateLimitError> {
        self.store.get(&cache_key(key_hash)).await
    }

    /// Cache `tenant_id` for `key_hash`.
    pub async fn put_tenant_id(
        &self,
        key_hash: &str,
        tenant_id: &str,
    ) -> Result<(), RateLimitError> {
        self.store
            .set_with_expiry(&cache_key(key_hash), tenant_id, self.ttl_secs)
            .await
    }

    /// Evict a cached entry, e.g. immediately after the key is revoked so a
    /// stale cache hit cannot authenticate a revoked key until TTL expiry.
    pub async fn invalidate(&self, key_hash: &str) -> Result<(), RateLimitError> {
        self.store.delete(&cache_key(key_hash)).await
    }
}

fn cache_key(key_hash: &str) -> String {
    format!("keycache:{key_hash}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory [`CounterStore`] for unit tests. TTL is tracked but not
    /// actually expired — tests that care about expiry construct a fresh
    /// store instead of waiting.
    #[derive(Default)]
    struct MemStore {
        counters: Mutex<HashMap<String, u64>>,
        values: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl CounterStore for MemStore {
        async fn increment_with_expiry(
            &self,
            key: &str,
            _ttl_secs: u64,
        ) -> Result<u64, RateLimitError> {
            let mut guard = self.counters.lock().unwrap();
            let entry = guard.entry(key.to_string()).or_insert(0);
            *entry += 1;
            Ok(*entry)
        }

        async fn get(&self, key: &str) -> Result<Option<String>, RateLimitError> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }

        async fn set_with_expiry(
            &self,
            key: &str,
            value: &str,
            _ttl_secs: u64,
        ) -> Result<(), RateLimitError> {
            self.values
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), RateLimitError> {
            self.values.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn allows_requests_under_the_limit() {
        let limiter = RateLimiter::new(MemStore::default());
        for _ in 0..5 {
            let decision = limiter.check("tenant:a", 5, 60).await.unwrap();
            assert!(decision.allowed);
        }
    }

    #[tokio::test]
    async fn denies_the_request_that_exceeds_the_limit() {
        let limiter = RateLimiter::new(MemStore::default());
        for _ in 0..5 {
            limiter.check("tenant:a", 5, 60).await.unwrap();
        }
        let decision = limiter.check("tenant:a", 5, 60).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn remaining_counts_down() {
        let limiter = RateLimiter::new(MemStore::default());
        let first = limiter.check("tenant:a", 10, 60).await.unwrap();
        assert_eq!(first.remaining, 9);
        let second = limiter.check("tenant:a", 10, 60).await.unwrap();
        assert_eq!(second.remaining, 8);
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let limiter = RateLimiter::new(MemStore::default());
        for _ in 0..3 {
            limiter.check("tenant:a", 3, 60).await.unwrap();
        }
        let other = limiter.check("tenant:b", 3, 60).await.unwrap();
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn blockout_triggers_once_the_window_limit_is_exceeded() {
        let limiter = RateLimiter::new(MemStore::default());
        for _ in 0..3 {
            let decision = limiter
                .check_with_blockout("tenant:a", 3, 60, 300)
                .await
                .unwrap();
            assert!(decision.allowed);
        }
        let decision = limiter
            .check_with_blockout("tenant:a", 3, 60, 300)
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, 300);
    }

    #[tokio::test]
    async fn blockout_stays_active_without_incrementing_the_counter_again() {
        let store = MemStore::default();
        let limiter = RateLimiter::new(store);
        for _ in 0..3 {
            limiter
                .check_with_blockout("tenant:a", 2, 60, 300)
                .await
                .unwrap();
        }
        let first_denial = limiter
            .check_with_blockout("tenant:a", 2, 60, 300)
            .await
            .unwrap();
        let second_denial = limiter
            .check_with_blockout("tenant:a", 2, 60, 300)
            .await
            .unwrap();
        assert!(!first_denial.allowed);
        assert!(!second_denial.allowed);
        assert!(second_denial.retry_after_secs > 295 && second_denial.retry_after_secs <= 300);
    }

    #[tokio::test]
    async fn key_cache_roundtrip() {
        let cache = KeyCache::new(MemStore::default(), 300);
        assert_eq!(cache.get_tenant_id("hash1").await.unwrap(), None);
        cache.put_tenant_id("hash1", "tenant-123").await.unwrap();
        assert_eq!(
            cache.get_tenant_id("hash1").await.unwrap(),
            Some("tenant-123".to_string())
        );
    }

    #[tokio::test]
    async fn key_cache_invalidate_removes_entry() {
        let cache = KeyCache::new(MemStore::default(), 300);
        cache.put_tenant_id("hash1", "tenant-123").await.unwrap();
        cache.invalidate("hash1").await.unwrap();
        assert_eq!(cache.get_tenant_id("hash1").await.unwrap(), None);
    }
}
