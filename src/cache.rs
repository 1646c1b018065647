use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use serde_json::Value;

use crate::response::GatewayResponse;
use crate::target::CacheSettings;

pub fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

pub fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// What the request pipeline needs to consult the cache.
#[derive(Debug)]
pub struct CacheQuery<'a> {
    pub settings: Option<&'a CacheSettings>,
    pub provider: &'a str,
    pub url: &'a str,
    pub request_json: Option<&'a Value>,
}

/// Result of one cache consultation. `status` is reported even on a miss so
/// the log record always carries it.
#[derive(Clone, Debug, Default)]
pub struct CacheLookup {
    pub response: Option<GatewayResponse>,
    pub status: Option<String>,
    pub key: Option<String>,
    pub created_at: Option<u64>,
}

/// Response cache backing the pipeline's lookup phase. Writes are
/// fire-and-forget and only issued after a main-path success.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn lookup(&self, query: &CacheQuery<'_>) -> CacheLookup;

    async fn store(&self, key: &str, response: &GatewayResponse, settings: &CacheSettings);
}

/// Cache that never hits; the default collaborator.
#[derive(Debug, Default)]
pub struct NoopCache;

#[async_trait]
impl CacheStore for NoopCache {
    async fn lookup(&self, _query: &CacheQuery<'_>) -> CacheLookup {
        CacheLookup {
            status: Some("miss".to_string()),
            ..CacheLookup::default()
        }
    }

    async fn store(&self, _key: &str, _response: &GatewayResponse, _settings: &CacheSettings) {}
}

#[derive(Clone, Debug)]
pub struct MemoryCacheConfig {
    /// Applied when a target's cache settings carry no `maxAge`.
    pub default_ttl_seconds: u64,
    pub max_entries: u64,
    /// Responses with bodies past this size are served but never cached.
    pub max_body_bytes: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 120,
            max_entries: 2048,
            max_body_bytes: 512 * 1024,
        }
    }
}

#[derive(Clone, Debug)]
struct CachedEntry {
    response: GatewayResponse,
    created_at_ms: u64,
    ttl: Duration,
}

/// Each entry expires on its own deadline: targets pick their `maxAge`, so
/// a single cache-wide time-to-live would be wrong for mixed configs.
struct EntryTtl;

impl Expiry<String, Arc<CachedEntry>> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Arc<CachedEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-memory response cache on `moka`: per-entry TTLs from the target's
/// cache settings, size-bounded admission, and moka's own frequency-based
/// eviction once `max_entries` is reached.
pub struct MemoryCache {
    config: MemoryCacheConfig,
    entries: Cache<String, Arc<CachedEntry>>,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(EntryTtl)
            .build();
        Self { config, entries }
    }

    fn cache_key(query: &CacheQuery<'_>) -> String {
        let body = query
            .request_json
            .map(|value| value.to_string())
            .unwrap_or_default();
        format!("{}|{}|{}", query.provider, query.url, body)
    }

    fn cache_mode(settings: Option<&CacheSettings>) -> &str {
        settings
            .and_then(|settings| settings.mode.as_deref())
            .unwrap_or_default()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn lookup(&self, query: &CacheQuery<'_>) -> CacheLookup {
        if Self::cache_mode(query.settings).is_empty() {
            return CacheLookup {
                status: Some("miss".to_string()),
                ..CacheLookup::default()
            };
        }

        let key = Self::cache_key(query);
        match self.entries.get(&key).await {
            Some(entry) => CacheLookup {
                response: Some(entry.response.clone()),
                status: Some("hit".to_string()),
                key: Some(key),
                created_at: Some(entry.created_at_ms),
            },
            None => CacheLookup {
                response: None,
                status: Some("miss".to_string()),
                key: Some(key),
                created_at: None,
            },
        }
    }

    async fn store(&self, key: &str, response: &GatewayResponse, settings: &CacheSettings) {
        if Self::cache_mode(Some(settings)).is_empty() {
            return;
        }
        let ttl_seconds = settings
            .max_age
            .unwrap_or(self.config.default_ttl_seconds);
        if ttl_seconds == 0 || response.body.len() > self.config.max_body_bytes {
            return;
        }

        let entry = Arc::new(CachedEntry {
            response: response.clone(),
            created_at_ms: now_epoch_millis(),
            ttl: Duration::from_secs(ttl_seconds),
        });
        self.entries.insert(key.to_string(), entry).await;
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, StatusCode};
    use bytes::Bytes;
    use serde_json::json;

    use super::*;

    fn response(body: &'static [u8]) -> GatewayResponse {
        GatewayResponse::new(StatusCode::OK, HeaderMap::new(), Bytes::from_static(body))
    }

    fn simple_settings(max_age: Option<u64>) -> CacheSettings {
        CacheSettings {
            mode: Some("simple".to_string()),
            max_age,
        }
    }

    fn query<'a>(
        settings: Option<&'a CacheSettings>,
        body: &'a Value,
    ) -> CacheQuery<'a> {
        CacheQuery {
            settings,
            provider: "openai",
            url: "https://api.openai.com/v1/chat/completions",
            request_json: Some(body),
        }
    }

    #[tokio::test]
    async fn unconfigured_cache_reports_miss_without_key() {
        let cache = MemoryCache::default();
        let body = json!({"model": "gpt-4o"});
        let lookup = cache.lookup(&query(None, &body)).await;
        assert_eq!(lookup.status.as_deref(), Some("miss"));
        assert!(lookup.key.is_none());
        assert!(lookup.response.is_none());
    }

    #[tokio::test]
    async fn stored_responses_hit_for_the_same_request_only() {
        let cache = MemoryCache::default();
        let settings = simple_settings(Some(60));
        let body = json!({"model": "gpt-4o"});

        let miss = cache.lookup(&query(Some(&settings), &body)).await;
        assert_eq!(miss.status.as_deref(), Some("miss"));
        let key = miss.key.expect("key");

        cache
            .store(&key, &response(b"{\"ok\":true}"), &settings)
            .await;

        let hit = cache.lookup(&query(Some(&settings), &body)).await;
        assert_eq!(hit.status.as_deref(), Some("hit"));
        assert!(hit.created_at.is_some());
        assert_eq!(&hit.response.expect("response").body[..], b"{\"ok\":true}");

        let other_body = json!({"model": "gpt-4o-mini"});
        let other = cache.lookup(&query(Some(&settings), &other_body)).await;
        assert_eq!(other.status.as_deref(), Some("miss"));
    }

    #[tokio::test]
    async fn zero_max_age_disables_storage() {
        let cache = MemoryCache::default();
        let settings = simple_settings(Some(0));
        let body = json!({"model": "gpt-4o"});

        let key = cache
            .lookup(&query(Some(&settings), &body))
            .await
            .key
            .expect("key");
        cache.store(&key, &response(b"{}"), &settings).await;

        let lookup = cache.lookup(&query(Some(&settings), &body)).await;
        assert_eq!(lookup.status.as_deref(), Some("miss"));
    }

    #[tokio::test]
    async fn oversized_bodies_are_not_admitted() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            default_ttl_seconds: 60,
            max_entries: 16,
            max_body_bytes: 4,
        });
        let settings = simple_settings(None);
        let body = json!({"model": "gpt-4o"});

        let key = cache
            .lookup(&query(Some(&settings), &body))
            .await
            .key
            .expect("key");
        cache
            .store(&key, &response(b"way too big"), &settings)
            .await;

        let lookup = cache.lookup(&query(Some(&settings), &body)).await;
        assert_eq!(lookup.status.as_deref(), Some("miss"));
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            default_ttl_seconds: 60,
            max_entries: 1,
            max_body_bytes: 1024,
        });
        let settings = simple_settings(None);
        for key in ["a", "b", "c"] {
            cache.store(key, &response(b"ok"), &settings).await;
        }

        cache.entries.run_pending_tasks().await;
        assert!(cache.entries.entry_count() <= 1);
    }
}
