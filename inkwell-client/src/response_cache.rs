//! Short-lived response cache in front of the transport.
//!
//! Separate from the layered [`CacheManager`](inkwell_storage::CacheManager):
//! this one lives only in memory, keys on the full request identity, and is
//! consulted before a request is scheduled at all.

use std::time::Duration;

use dashmap::DashMap;
use inkwell_core::ConfigError;
use serde_json::Value;
use tokio::time::Instant;

pub const DEFAULT_RESPONSE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_RESPONSES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCacheConfig {
    /// Lifetime of an entry when the request names no TTL.
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_RESPONSE_TTL,
            max_entries: DEFAULT_MAX_RESPONSES,
        }
    }
}

impl ResponseCacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::invalid("request_cache.ttl_ms", "must be > 0"));
        }
        if self.max_entries == 0 {
            return Err(ConfigError::invalid("request_cache.max_entries", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CachedResponse {
    value: Value,
    stored_at: Instant,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct ResponseCache {
    config: ResponseCacheConfig,
    entries: DashMap<String, CachedResponse>,
}

impl ResponseCache {
    pub fn new(config: ResponseCacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    pub fn config(&self) -> ResponseCacheConfig {
        self.config
    }

    /// A live response, or `None`. Expired entries are dropped on the way.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let live = self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone());
        if live.is_none() {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        live
    }

    /// Store a response for `ttl`, or the configured default.
    ///
    /// When full, expired entries go first, then the oldest one.
    pub fn insert(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.filter(|ttl| !ttl.is_zero()).unwrap_or(self.config.ttl);

        if !self.entries.contains_key(key) && self.entries.len() >= self.config.max_entries {
            self.purge_expired();
            if self.entries.len() >= self.config.max_entries {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|entry| entry.stored_at)
                    .map(|entry| entry.key().clone());
                if let Some(oldest) = oldest {
                    self.entries.remove(&oldest);
                }
            }
        }

        self.entries.insert(
            key.to_string(),
            CachedResponse {
                value,
                stored_at: now,
                expires_at: now + ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every expired entry, returning how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
