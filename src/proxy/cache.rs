//! Bucketed response cache
//!
//! A logical request maps to up to `max_size` cache slots ("buckets"). Writes
//! fill the lowest free slot. Reads only succeed once every slot is filled,
//! and then return one slot chosen uniformly at random, so clients see a
//! spread of responses for an identical request.

use crate::infrastructure::{CachedResponse, ResponseStore, StoreError};
use crate::proxy::headers::{
    response, Headers, AUTHORIZATION, CACHE_CONTROL, HELICONE_CACHE_BUCKET_MAX_SIZE,
    HELICONE_CACHE_ENABLED, HELICONE_CACHE_READ, HELICONE_CACHE_SAVE, HELICONE_PREFIX,
};
use futures_util::future::join_all;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Bucket count used when the request does not ask for one
pub const DEFAULT_BUCKET_MAX_SIZE: u8 = 1;

/// Largest bucket count a request may ask for
pub const MAX_BUCKET_MAX_SIZE: u8 = 20;

/// Lifetime of cached entries when the request sends no `Cache-Control`
pub const DEFAULT_CACHE_CONTROL: &str = "max-age=604800";

/// Cache behaviour requested through headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub should_save: bool,
    pub should_read: bool,
    pub bucket_max_size: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheSettingsError {
    #[error("Invalid Helicone-Cache-Bucket-Max-Size `{0}`: expected an integer between 1 and 20")]
    InvalidBucketSize(String),

    #[error("Caching is not supported for streamed requests")]
    StreamingNotSupported,
}

impl CacheSettings {
    pub fn from_headers(headers: &Headers) -> Result<Self, CacheSettingsError> {
        let enabled = headers.is_true(HELICONE_CACHE_ENABLED);
        let bucket_max_size = match headers.get(HELICONE_CACHE_BUCKET_MAX_SIZE) {
            None => DEFAULT_BUCKET_MAX_SIZE,
            Some(raw) => raw
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|size| (1..=MAX_BUCKET_MAX_SIZE).contains(size))
                .ok_or_else(|| CacheSettingsError::InvalidBucketSize(raw.to_string()))?,
        };

        Ok(Self {
            should_save: enabled || headers.is_true(HELICONE_CACHE_SAVE),
            should_read: enabled || headers.is_true(HELICONE_CACHE_READ),
            bucket_max_size,
        })
    }

    pub fn enabled(&self) -> bool {
        self.should_save || self.should_read
    }
}

/// Hex SHA-256 digest addressing one cache slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The parts of a request that identify it for caching
#[derive(Debug, Clone, Copy)]
pub struct CacheRequest<'a> {
    /// Resolved upstream URL
    pub url: &'a str,
    /// Body as received from the client
    pub body: &'a [u8],
    pub headers: &'a Headers,
}

/// Digest of the URL, body, proxy headers and credential, plus the bucket
/// index when it is 1 or more
///
/// Headers other than `helicone-*` and `authorization` do not take part, so
/// unrelated header churn does not fragment the cache.
pub fn derive_cache_key(request: &CacheRequest<'_>, bucket_index: u8) -> CacheKey {
    let mut keyed: Vec<[&str; 2]> = request
        .headers
        .iter()
        .filter(|(name, _)| name.starts_with(HELICONE_PREFIX) || *name == AUTHORIZATION)
        .map(|(name, value)| [name, value])
        .collect();
    keyed.sort();

    // Serializing a list of string pairs cannot fail
    let header_text = serde_json::to_string(&keyed).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(request.url.as_bytes());
    hasher.update(request.body);
    hasher.update(header_text.as_bytes());
    if bucket_index >= 1 {
        hasher.update(bucket_index.to_string().as_bytes());
    }
    CacheKey(hex::encode(hasher.finalize()))
}

/// Lifetime from a `Cache-Control: max-age=<n>` value
pub fn cache_ttl(cache_control: Option<&str>) -> Duration {
    let max_age = |value: &str| {
        value.split(',').find_map(|directive| {
            directive
                .trim()
                .strip_prefix("max-age=")
                .and_then(|seconds| seconds.trim().parse::<u64>().ok())
        })
    };

    cache_control
        .and_then(max_age)
        .or_else(|| max_age(DEFAULT_CACHE_CONTROL))
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(604_800))
}

/// The cache-control policy for a request
pub fn request_cache_control(headers: &Headers) -> Option<&str> {
    headers.get(CACHE_CONTROL)
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Every one of the {max_size} cache buckets is already populated")]
    Full { max_size: u8 },

    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),
}

/// Populated and free slots for one logical request
#[derive(Debug, Clone, Default)]
pub struct BucketSet {
    pub entries: Vec<(u8, CachedResponse)>,
    pub free_indexes: Vec<u8>,
}

/// A response served from the cache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub bucket_index: u8,
    /// Stored response with `Helicone-Cache` and the bucket index added
    pub response: CachedResponse,
}

/// Bucket manager over a [`ResponseStore`]
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn ResponseStore>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn ResponseStore>) -> Self {
        Self { store }
    }

    /// Probe every bucket index concurrently
    pub async fn lookup_bucket_set(
        &self,
        request: &CacheRequest<'_>,
        max_size: u8,
    ) -> Result<BucketSet, CacheError> {
        let probes = (0..max_size).map(|index| {
            let key = derive_cache_key(request, index);
            async move { (index, self.store.get(key.as_str()).await) }
        });

        let mut set = BucketSet::default();
        for (index, result) in join_all(probes).await {
            match result? {
                Some(entry) => set.entries.push((index, entry)),
                None => set.free_indexes.push(index),
            }
        }
        Ok(set)
    }

    /// A random entry once all `max_size` buckets are populated, else `None`
    pub async fn read(
        &self,
        request: &CacheRequest<'_>,
        max_size: u8,
    ) -> Result<Option<CacheHit>, CacheError> {
        let set = self.lookup_bucket_set(request, max_size).await?;
        if !set.free_indexes.is_empty() {
            debug!(
                populated = set.entries.len(),
                free = set.free_indexes.len(),
                "Cache bucket set not yet full"
            );
            return Ok(None);
        }

        let Some((bucket_index, mut entry)) = choose_entry(set.entries) else {
            return Ok(None);
        };
        entry.headers.retain(|(name, _)| {
            !name.eq_ignore_ascii_case(response::HELICONE_CACHE)
                && !name.eq_ignore_ascii_case(response::HELICONE_CACHE_BUCKET_IDX)
        });
        entry
            .headers
            .push((response::HELICONE_CACHE.to_string(), "HIT".to_string()));
        entry.headers.push((
            response::HELICONE_CACHE_BUCKET_IDX.to_string(),
            bucket_index.to_string(),
        ));

        Ok(Some(CacheHit {
            bucket_index,
            response: entry,
        }))
    }

    /// Store `response` in the lowest free bucket and return its index
    pub async fn write(
        &self,
        request: &CacheRequest<'_>,
        entry: CachedResponse,
        cache_control: Option<&str>,
        max_size: u8,
    ) -> Result<u8, CacheError> {
        let set = self.lookup_bucket_set(request, max_size).await?;
        let index = set
            .free_indexes
            .first()
            .copied()
            .ok_or(CacheError::Full { max_size })?;

        let key = derive_cache_key(request, index);
        self.store
            .put(key.as_str(), entry, cache_ttl(cache_control))
            .await?;
        debug!(bucket_index = index, cache_key = %key, "Cached response");
        Ok(index)
    }
}

fn choose_entry(mut entries: Vec<(u8, CachedResponse)>) -> Option<(u8, CachedResponse)> {
    if entries.is_empty() {
        return None;
    }
    let position = rand::thread_rng().gen_range(0..entries.len());
    Some(entries.swap_remove(position))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::InMemoryResponseStore;
    use bytes::Bytes;
    use rstest::rstest;
    use std::collections::HashMap;

    const URL: &str = "https://api.openai.com/v1/completions";

    fn headers() -> Headers {
        Headers::from_pairs([
            ("authorization", "Bearer sk-test"),
            ("helicone-cache-enabled", "true"),
            ("content-type", "application/json"),
        ])
    }

    fn cached(body: &str) -> CachedResponse {
        CachedResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    fn cache() -> ResponseCache {
        ResponseCache::new(Arc::new(InMemoryResponseStore::default()))
    }

    #[test]
    fn test_cache_key_is_deterministic_hex_digest() {
        let headers = headers();
        let request = CacheRequest {
            url: URL,
            body: b"{\"prompt\":\"hi\"}",
            headers: &headers,
        };

        let first = derive_cache_key(&request, 0);
        assert_eq!(first, derive_cache_key(&request, 0));
        assert_eq!(first.as_str().len(), 64);
        assert!(first.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, derive_cache_key(&request, 1));
        assert_ne!(derive_cache_key(&request, 1), derive_cache_key(&request, 2));
    }

    #[test]
    fn test_cache_key_ignores_unrelated_headers() {
        let base = headers();
        let noisy = base.with("user-agent", "curl/8").with("x-trace", "123");
        let request = |headers| CacheRequest {
            url: URL,
            body: b"{}",
            headers,
        };

        assert_eq!(
            derive_cache_key(&request(&base), 0),
            derive_cache_key(&request(&noisy), 0)
        );

        let other_credential = base.with("authorization", "Bearer sk-other");
        assert_ne!(
            derive_cache_key(&request(&base), 0),
            derive_cache_key(&request(&other_credential), 0)
        );
    }

    #[test]
    fn test_cache_key_does_not_depend_on_header_order() {
        let forward = Headers::from_pairs([("helicone-a", "1"), ("authorization", "k")]);
        let reverse = Headers::from_pairs([("authorization", "k"), ("helicone-a", "1")]);
        let request = |headers| CacheRequest {
            url: URL,
            body: b"",
            headers,
        };
        assert_eq!(
            derive_cache_key(&request(&forward), 0),
            derive_cache_key(&request(&reverse), 0)
        );
    }

    #[rstest]
    #[case(None, 604_800)]
    #[case(Some("max-age=60"), 60)]
    #[case(Some("public, max-age=3600"), 3600)]
    #[case(Some("no-store"), 604_800)]
    fn test_cache_ttl(#[case] header: Option<&str>, #[case] seconds: u64) {
        assert_eq!(cache_ttl(header), Duration::from_secs(seconds));
    }

    #[rstest]
    #[case(&[], false, false, 1)]
    #[case(&[("helicone-cache-enabled", "true")], true, true, 1)]
    #[case(&[("helicone-cache-save", "true")], true, false, 1)]
    #[case(&[("helicone-cache-read", "true")], false, true, 1)]
    #[case(&[("helicone-cache-enabled", "true"), ("helicone-cache-bucket-max-size", "5")], true, true, 5)]
    fn test_cache_settings(
        #[case] pairs: &[(&str, &str)],
        #[case] save: bool,
        #[case] read: bool,
        #[case] size: u8,
    ) {
        let settings = CacheSettings::from_headers(&Headers::from_pairs(pairs.iter().copied())).unwrap();
        assert_eq!(settings.should_save, save);
        assert_eq!(settings.should_read, read);
        assert_eq!(settings.bucket_max_size, size);
    }

    #[rstest]
    #[case("0")]
    #[case("21")]
    #[case("many")]
    fn test_invalid_bucket_size(#[case] raw: &str) {
        let headers = Headers::from_pairs([("helicone-cache-bucket-max-size", raw)]);
        assert_eq!(
            CacheSettings::from_headers(&headers),
            Err(CacheSettingsError::InvalidBucketSize(raw.to_string()))
        );
    }

    #[tokio::test]
    async fn test_writes_fill_lowest_free_index_then_report_full() {
        let cache = cache();
        let headers = headers();
        let request = CacheRequest {
            url: URL,
            body: b"{}",
            headers: &headers,
        };

        assert_eq!(cache.write(&request, cached("a"), None, 2).await.unwrap(), 0);
        assert_eq!(cache.write(&request, cached("b"), None, 2).await.unwrap(), 1);
        assert!(matches!(
            cache.write(&request, cached("c"), None, 2).await,
            Err(CacheError::Full { max_size: 2 })
        ));

        let set = cache.lookup_bucket_set(&request, 2).await.unwrap();
        assert_eq!(set.entries.len(), 2);
        assert!(set.free_indexes.is_empty());
    }

    #[tokio::test]
    async fn test_reads_miss_until_bucket_set_is_full() {
        let cache = cache();
        let headers = headers();
        let request = CacheRequest {
            url: URL,
            body: b"{\"n\":1}",
            headers: &headers,
        };

        for filled in 0..3 {
            assert!(
                cache.read(&request, 3).await.unwrap().is_none(),
                "read must miss with {filled} of 3 buckets filled"
            );
            cache
                .write(&request, cached(&format!("r{filled}")), None, 3)
                .await
                .unwrap();
        }

        let hit = cache.read(&request, 3).await.unwrap().unwrap();
        let headers = Headers::from_pairs(hit.response.headers.clone());
        assert_eq!(headers.get(response::HELICONE_CACHE), Some("HIT"));
        assert_eq!(
            headers.get(response::HELICONE_CACHE_BUCKET_IDX),
            Some(hit.bucket_index.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_full_bucket_set_is_read_uniformly() {
        let cache = cache();
        let headers = headers();
        let request = CacheRequest {
            url: URL,
            body: b"{\"prompt\":\"same\"}",
            headers: &headers,
        };
        let other = CacheRequest {
            url: URL,
            body: b"{\"prompt\":\"different\"}",
            headers: &headers,
        };

        for body in ["zero", "one", "two", "three"] {
            cache.write(&request, cached(body), None, 4).await.unwrap();
        }
        cache.write(&other, cached("foreign"), None, 4).await.unwrap();

        let trials = 4000;
        let mut counts: HashMap<Bytes, usize> = HashMap::new();
        for _ in 0..trials {
            let hit = cache.read(&request, 4).await.unwrap().unwrap();
            *counts.entry(hit.response.body).or_default() += 1;
        }

        assert_eq!(counts.len(), 4);
        assert!(!counts.contains_key(&Bytes::from_static(b"foreign")));
        for (body, count) in counts {
            assert!(
                (800..=1200).contains(&count),
                "{body:?} served {count} times out of {trials}"
            );
        }
    }
}
