//! Cache manager configuration.

use std::time::Duration;

use inkwell_core::ConfigError;
use serde::{Deserialize, Serialize};

use super::partition_key::Partition;

/// Default entry lifetime when a caller passes no TTL (24 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default interval of the expired-entry sweep.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Default memory budget (50 MiB).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 50 * 1024 * 1024;

/// Which entries to drop when the memory budget would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Expired entries first, then oldest by creation time.
    #[default]
    Ttl,
    /// Least recently used first.
    Lru,
    /// Least frequently used first.
    Lfu,
    /// Oldest insertion first.
    Fifo,
}

/// Case-insensitive; unknown values fall back to `Ttl`.
impl From<&str> for EvictionStrategy {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "lru" => EvictionStrategy::Lru,
            "lfu" => EvictionStrategy::Lfu,
            "fifo" => EvictionStrategy::Fifo,
            _ => EvictionStrategy::Ttl,
        }
    }
}

/// Process-wide cache configuration, fixed at manager construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub strategy: EvictionStrategy,
    /// Memory budget in bytes.
    pub max_cache_size: u64,
    /// Entries written under another version are discarded on read.
    pub version: String,
    pub partition: Partition,
    /// Write entries through to the durable store.
    pub persistence: bool,
    /// Relay updates and invalidations to other managers on the same bus.
    pub cross_tab: bool,
    /// Serve entries past their stale time while refreshing them.
    pub stale_while_revalidate: bool,
    pub default_ttl: Duration,
    pub cleanup_interval: Duration,
    /// Name of the cross-tab channel.
    pub channel_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: EvictionStrategy::Ttl,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            version: "1".to_string(),
            partition: Partition::Global,
            persistence: true,
            cross_tab: true,
            stale_while_revalidate: true,
            default_ttl: DEFAULT_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            channel_name: "inkwell-cache".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.persistence = enabled;
        self
    }

    pub fn with_cross_tab(mut self, enabled: bool) -> Self {
        self.cross_tab = enabled;
        self
    }

    pub fn with_stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    /// Resolve a caller TTL: absent or zero means the default.
    pub fn effective_ttl(&self, ttl: Option<Duration>) -> Duration {
        match ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => self.default_ttl,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_size == 0 {
            return Err(ConfigError::invalid("cache.max_cache_size", "must be > 0"));
        }
        if self.version.trim().is_empty() {
            return Err(ConfigError::invalid("cache.version", "must not be empty"));
        }
        if self.default_ttl.is_zero() {
            return Err(ConfigError::invalid("cache.default_ttl", "must be > 0"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::invalid("cache.cleanup_interval", "must be > 0"));
        }
        if self.channel_name.trim().is_empty() {
            return Err(ConfigError::invalid("cache.channel_name", "must not be empty"));
        }
        Ok(())
    }
}
