//! Counter store backing the rate limiter
//!
//! Counters are created on first increment with a TTL equal to their rate
//! limit window and expire on their own; nothing ever deletes them.

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::time::{Duration, Instant};

/// Errors raised by the external key-value stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Stored value is corrupt: {0}")]
    Corrupt(String),
}

/// Windowed counters with store-side atomic increment
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value, `None` when the counter does not exist (or expired)
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Add `by` to the counter, creating it with `ttl` if absent, and return
    /// the new value. The TTL of an existing counter is not extended.
    async fn increment(&self, key: &str, by: u64, ttl: Duration) -> Result<u64, StoreError>;
}

#[derive(Clone, Copy, Debug)]
struct Counter {
    value: u64,
    ttl: Duration,
}

struct CounterExpiry;

impl Expiry<String, Counter> for CounterExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Counter,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Process-local counter store
///
/// Suitable for a single proxy instance and for tests. Horizontally scaled
/// deployments plug a shared store in behind [`CounterStore`].
pub struct InMemoryCounterStore {
    counters: Cache<String, Counter>,
}

impl InMemoryCounterStore {
    pub fn new(max_counters: u64) -> Self {
        let counters = Cache::builder()
            .max_capacity(max_counters)
            .expire_after(CounterExpiry)
            .build();
        Self { counters }
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.counters.get(key).await.map(|counter| counter.value))
    }

    async fn increment(&self, key: &str, by: u64, ttl: Duration) -> Result<u64, StoreError> {
        let entry = self
            .counters
            .entry(key.to_string())
            .and_upsert_with(|existing| {
                let next = match existing {
                    Some(entry) => Counter {
                        value: entry.value().value.saturating_add(by),
                        ttl: entry.value().ttl,
                    },
                    None => Counter { value: by, ttl },
                };
                std::future::ready(next)
            })
            .await;

        Ok(entry.into_value().value)
    }
}
