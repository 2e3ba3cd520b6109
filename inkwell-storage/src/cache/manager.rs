//! The layered cache manager.
//!
//! [`CacheManager`] owns the authoritative in-memory map of live entries.
//! The durable store is a write-through/read-through backing layer and the
//! [`CacheBus`] relays mutations to other managers.
//!
//! Reads only ever return an entry whose `expires_at` is in the future and
//! whose version matches the manager's configured version; anything else is
//! purged and reported as a miss.
//!
//! The manager is a cheap `Clone` handle. Background work (the periodic
//! expiry sweep and the bus listener) is owned by a [`TaskGroup`] that is
//! cancelled by [`CacheManager::dispose`] or when the last handle drops.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use inkwell_core::{ConfigError, SharedClock, TaskGroup};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use super::bus::{BusEnvelope, BusMessage, CacheBus};
use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::memory_tier::MemoryTier;
use super::metrics::CacheMetrics;
use crate::durable::DurableStorage;

/// A cache hit with the metadata of the entry it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<T> {
    pub value: T,
    /// When the entry was written.
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> CachedValue<T> {
    /// How long ago the entry was written, relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.cached_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Handle to a cache manager instance.
#[derive(Debug, Clone)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
    tasks: Arc<TaskGroup>,
}

#[derive(Debug)]
struct CacheInner {
    id: Uuid,
    config: CacheConfig,
    storage: DurableStorage,
    clock: SharedClock,
    bus: Option<CacheBus>,
    tier: Mutex<MemoryTier>,
    metrics: Mutex<CacheMetrics>,
}

impl CacheManager {
    /// Build a manager and start its background tasks.
    ///
    /// `storage` is ignored when persistence is disabled, `bus` when
    /// cross-tab sync is disabled or the bus is named differently from
    /// `config.channel_name`. Must be called inside a Tokio runtime.
    pub fn create(
        config: CacheConfig,
        storage: DurableStorage,
        clock: SharedClock,
        bus: Option<CacheBus>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let storage = if config.persistence {
            storage
        } else {
            DurableStorage::memory_only()
        };

        let bus = match bus {
            Some(bus) if config.cross_tab && bus.name() == config.channel_name => Some(bus),
            Some(bus) if config.cross_tab => {
                tracing::warn!(
                    bus = bus.name(),
                    expected = %config.channel_name,
                    "Cache bus name does not match configured channel, cross-tab sync disabled"
                );
                None
            }
            _ => None,
        };

        let inner = Arc::new(CacheInner {
            id: Uuid::now_v7(),
            config,
            storage,
            clock,
            bus,
            tier: Mutex::new(MemoryTier::default()),
            metrics: Mutex::new(CacheMetrics::default()),
        });

        let tasks = Arc::new(TaskGroup::new());
        tasks.spawn(
            "cache-cleanup",
            run_cleanup(Arc::downgrade(&inner), inner.config.cleanup_interval),
        );
        if let Some(bus) = inner.bus.as_ref() {
            // Subscribe before returning so nothing published afterwards is missed.
            let rx = bus.subscribe();
            tasks.spawn("cache-bus-listener", run_listener(Arc::downgrade(&inner), rx));
        }

        tracing::debug!(
            id = %inner.id,
            strategy = ?inner.config.strategy,
            partition = %inner.config.partition,
            store = ?inner.storage.kind(),
            "Cache manager created"
        );

        Ok(Self { inner, tasks })
    }

    /// Stop background tasks. The cache stays usable from the caller's side.
    pub fn dispose(&self) {
        self.tasks.shutdown();
    }

    pub fn is_disposed(&self) -> bool {
        self.tasks.is_shutdown()
    }

    /// Identifier used as the origin of bus messages.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Current time on the manager's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_with_metadata(key).await.map(|cached| cached.value)
    }

    pub async fn get_with_metadata<T: DeserializeOwned>(&self, key: &str) -> Option<CachedValue<T>> {
        let full = self.inner.config.partition.key(key);
        let entry = self.inner.lookup(full.as_str()).await?;
        match serde_json::from_value::<T>(entry.data) {
            Ok(value) => Some(CachedValue {
                value,
                cached_at: entry.timestamp,
                expires_at: entry.expires_at,
            }),
            Err(e) => {
                tracing::warn!(key, error = %e, "Cached value has an unexpected shape");
                None
            }
        }
    }

    /// Store `data` under `key`. `None` or a zero TTL means the default.
    ///
    /// Returns whether the entry made it into memory.
    pub async fn set<T: Serialize>(&self, key: &str, data: &T, ttl: Option<Duration>) -> bool {
        self.set_with_dependencies(key, data, ttl, Vec::<String>::new())
            .await
    }

    /// Store `data` and record keys that must be invalidated with it.
    ///
    /// Keys that would land in another partition are refused.
    pub async fn set_with_dependencies<T, I, S>(
        &self,
        key: &str,
        data: &T,
        ttl: Option<Duration>,
        dependencies: I,
    ) -> bool
    where
        T: Serialize,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let partition = &self.inner.config.partition;
        let full = partition.key(key);
        let dependencies: Vec<String> = dependencies
            .into_iter()
            .map(|dep| partition.key(dep.as_ref()).into_string())
            .collect();
        if !partition.admits(key) || !dependencies.iter().all(|dep| partition.owns(dep)) {
            tracing::warn!(key, partition = %partition, "Refusing key outside the manager's partition");
            return false;
        }

        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "Refusing to cache unserializable value");
                return false;
            }
        };

        let entry = CacheEntry::new(
            value,
            self.inner.clock.now(),
            self.inner.config.effective_ttl(ttl),
            self.inner.config.version.clone(),
            partition.kind(),
        )
        .with_dependencies(dependencies);

        self.inner.store(full.into_string(), entry).await
    }

    /// Remove `key` and, transitively, every key it depends on.
    ///
    /// Returns how many entries were actually removed.
    pub async fn invalidate(&self, key: &str) -> usize {
        let full = self.inner.config.partition.key(key);
        self.inner.invalidate_cascade(full.as_str()).await
    }

    /// Remove every entry belonging to this manager's partition.
    pub async fn invalidate_partition(&self) -> usize {
        self.inner.invalidate_partition().await
    }

    /// Wipe memory and durable storage and reset metrics.
    pub async fn clear(&self) {
        self.inner.clear().await
    }

    /// Remove expired entries now instead of waiting for the sweep.
    pub async fn cleanup_expired(&self) -> usize {
        self.inner.cleanup_expired().await
    }

    /// Whether a live entry for `key` is in memory.
    pub fn contains(&self, key: &str) -> bool {
        let full = self.inner.config.partition.key(key);
        let now = self.inner.clock.now();
        self.inner
            .tier()
            .peek(full.as_str())
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Keys held in memory, partition prefix stripped, sorted.
    pub fn keys(&self) -> Vec<String> {
        let prefix = self.inner.config.partition.prefix();
        let mut keys: Vec<String> = self
            .inner
            .tier()
            .keys()
            .filter(|key| self.inner.config.partition.owns(key))
            .map(|key| key[prefix.len()..].to_string())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.tier().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes accounted in memory.
    pub fn size(&self) -> u64 {
        self.inner.tier().total_size()
    }

    pub fn metrics(&self) -> CacheMetrics {
        let (entry_count, total_size) = {
            let tier = self.inner.tier();
            (tier.len() as u64, tier.total_size())
        };
        let mut snapshot = self
            .inner
            .metrics
            .lock()
            .map(|metrics| metrics.clone())
            .unwrap_or_default();
        snapshot.entry_count = entry_count;
        snapshot.total_size = total_size;
        snapshot
    }
}

impl CacheInner {
    fn tier(&self) -> MutexGuard<'_, MemoryTier> {
        self.tier.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_metrics(&self, update: impl FnOnce(&mut CacheMetrics)) {
        if let Ok(mut metrics) = self.metrics.lock() {
            update(&mut metrics);
        }
    }

    fn publish(&self, message: BusMessage) {
        if let Some(bus) = self.bus.as_ref() {
            bus.publish(self.id, message);
        }
    }

    /// Memory first, then durable. Purges expired or foreign-version entries.
    async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let started = Instant::now();
        let now = self.clock.now();

        let cached = self.tier().peek(key).cloned();
        let (entry, in_memory) = match cached {
            Some(entry) => (entry, true),
            None => match self.storage.get(key).await {
                Some(entry) => (entry, false),
                None => {
                    self.update_metrics(|m| m.misses += 1);
                    return None;
                }
            },
        };

        if entry.is_expired(now) {
            tracing::debug!(key, "Cache entry expired");
            if in_memory {
                self.tier().remove(key);
            }
            self.storage.delete(key).await;
            self.update_metrics(|m| {
                m.misses += 1;
                m.expirations += 1;
            });
            return None;
        }

        if entry.version != self.config.version {
            tracing::debug!(
                key,
                stored = %entry.version,
                current = %self.config.version,
                "Cache entry version mismatch"
            );
            self.invalidate_cascade(key).await;
            self.update_metrics(|m| m.misses += 1);
            return None;
        }

        let (touched, evicted) = {
            let mut tier = self.tier();
            let mut evicted = Vec::new();
            // Another task may have filled or removed the slot while we awaited.
            if !tier.contains(key) && entry.size <= self.config.max_cache_size {
                evicted = evict(&mut tier, &self.config, entry.size, now);
                tier.insert(key.to_string(), entry.clone());
            }
            let touched = tier.touch(key, now).cloned().unwrap_or_else(|| {
                let mut entry = entry;
                entry.touch(now);
                entry
            });
            (touched, evicted)
        };

        self.forget_evicted(&evicted).await;
        self.update_metrics(|m| m.record_hit(started.elapsed()));
        Some(touched)
    }

    async fn store(&self, key: String, entry: CacheEntry) -> bool {
        if entry.size > self.config.max_cache_size {
            tracing::warn!(
                key = %key,
                size = entry.size,
                max = self.config.max_cache_size,
                "Entry larger than the whole cache, not storing"
            );
            return false;
        }

        let now = self.clock.now();
        let evicted = {
            let mut tier = self.tier();
            tier.remove(&key);
            let evicted = evict(&mut tier, &self.config, entry.size, now);
            tier.insert(key.clone(), entry.clone());
            evicted
        };

        self.update_metrics(|m| m.sets += 1);
        self.forget_evicted(&evicted).await;
        self.storage.set(&key, &entry).await;
        self.publish(BusMessage::Update { key, entry });
        true
    }

    /// Durable cleanup and accounting for entries already evicted from memory.
    async fn forget_evicted(&self, evicted: &[String]) {
        if evicted.is_empty() {
            return;
        }
        tracing::debug!(count = evicted.len(), strategy = ?self.config.strategy, "Evicted cache entries");
        self.update_metrics(|m| m.evictions += evicted.len() as u64);
        for key in evicted {
            self.storage.delete(key).await;
        }
    }

    /// Visited-set traversal of the dependency graph; cycles end the walk.
    async fn invalidate_cascade(&self, root: &str) -> usize {
        let mut visited: HashSet<String> = HashSet::new();
        let mut pending = vec![root.to_string()];
        let mut removed = 0usize;

        while let Some(key) = pending.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }

            let from_memory = self.tier().remove(&key);
            let dependencies = match from_memory.as_ref() {
                Some(entry) => Some(entry.dependencies.clone()),
                None => self.storage.get(&key).await.map(|entry| entry.dependencies),
            };
            let from_durable = self.storage.delete(&key).await;

            if from_memory.is_some() || from_durable {
                removed += 1;
            }
            pending.extend(
                dependencies
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|dep| !visited.contains(dep)),
            );
            self.publish(BusMessage::Invalidate { key });
        }

        if removed > 0 {
            tracing::debug!(key = root, removed, "Invalidated cache entries");
        }
        self.update_metrics(|m| m.invalidations += removed as u64);
        removed
    }

    async fn invalidate_partition(&self) -> usize {
        let partition = &self.config.partition;
        let mut keys: HashSet<String> = self
            .tier()
            .keys()
            .filter(|key| partition.owns(key))
            .cloned()
            .collect();
        keys.extend(
            self.storage
                .get_all_keys()
                .await
                .into_iter()
                .filter(|key| partition.owns(key)),
        );

        let mut removed = 0usize;
        for key in keys {
            let from_memory = self.tier().remove(&key).is_some();
            let from_durable = self.storage.delete(&key).await;
            if from_memory || from_durable {
                removed += 1;
            }
            self.publish(BusMessage::Invalidate { key });
        }

        tracing::debug!(partition = %partition, removed, "Invalidated partition");
        self.update_metrics(|m| m.invalidations += removed as u64);
        removed
    }

    async fn clear(&self) {
        *self.tier() = MemoryTier::default();
        let removed = self.storage.clear().await;
        if let Ok(mut metrics) = self.metrics.lock() {
            *metrics = CacheMetrics::default();
        }
        tracing::debug!(durable_removed = removed, "Cache cleared");
    }

    async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let expired = {
            let mut tier = self.tier();
            let expired = tier.expired_keys(now);
            for key in &expired {
                tier.remove(key);
            }
            expired
        };
        if expired.is_empty() {
            return 0;
        }

        for key in &expired {
            self.storage.delete(key).await;
        }
        tracing::debug!(count = expired.len(), "Swept expired cache entries");
        self.update_metrics(|m| m.expirations += expired.len() as u64);
        expired.len()
    }

    /// Apply a mutation relayed by another manager. Memory only: no durable
    /// write and no re-broadcast.
    fn apply_remote(&self, envelope: BusEnvelope) {
        if envelope.origin == self.id {
            return;
        }
        match envelope.message {
            BusMessage::Invalidate { key } => {
                self.tier().remove(&key);
            }
            BusMessage::Update { key, entry } => {
                let now = self.clock.now();
                if !self.config.partition.owns(&key)
                    || entry.version != self.config.version
                    || entry.is_expired(now)
                    || entry.size > self.config.max_cache_size
                {
                    tracing::debug!(key = %key, "Ignoring remote cache update");
                    return;
                }
                let evicted = {
                    let mut tier = self.tier();
                    tier.remove(&key);
                    let evicted = evict(&mut tier, &self.config, entry.size, now);
                    tier.insert(key, entry);
                    evicted
                };
                if !evicted.is_empty() {
                    self.update_metrics(|m| m.evictions += evicted.len() as u64);
                }
            }
        }
    }
}

/// Drop entries from memory until `incoming` bytes fit. Returns the keys.
fn evict(tier: &mut MemoryTier, config: &CacheConfig, incoming: u64, now: DateTime<Utc>) -> Vec<String> {
    let victims = tier.select_victims(config.strategy, incoming, config.max_cache_size, now);
    for key in &victims {
        tier.remove(key);
    }
    victims
}

async fn run_cleanup(inner: Weak<CacheInner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.cleanup_expired().await;
    }
}

async fn run_listener(inner: Weak<CacheInner>, mut rx: broadcast::Receiver<BusEnvelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.apply_remote(envelope);
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Cache bus listener lagged, messages lost");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
