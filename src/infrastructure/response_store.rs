//! Response store backing the bucketed cache

use crate::infrastructure::kv_store::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use moka::Expiry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A complete upstream response as it was returned to the client
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Keyed response storage with per-entry lifetimes
#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, StoreError>;

    /// Store (or overwrite) `key`; the entry lives for `ttl`
    async fn put(&self, key: &str, response: CachedResponse, ttl: Duration)
        -> Result<(), StoreError>;
}

#[derive(Clone)]
struct StoredResponse {
    response: Arc<CachedResponse>,
    ttl: Duration,
}

struct StoredResponseExpiry;

impl Expiry<String, StoredResponse> for StoredResponseExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredResponse,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredResponse,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Process-local response store
pub struct InMemoryResponseStore {
    entries: Cache<String, StoredResponse>,
}

impl InMemoryResponseStore {
    pub fn new(max_entries: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(StoredResponseExpiry)
            .build();
        Self { entries }
    }
}

impl Default for InMemoryResponseStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl ResponseStore for InMemoryResponseStore {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, StoreError> {
        Ok(self
            .entries
            .get(key)
            .await
            .map(|stored| stored.response.as_ref().clone()))
    }

    async fn put(
        &self,
        key: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.entries
            .insert(
                key.to_string(),
                StoredResponse {
                    response: Arc::new(response),
                    ttl,
                },
            )
            .await;
        Ok(())
    }
}
