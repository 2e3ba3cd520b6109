//! Layered cache: an in-memory map in front of a durable store.
//!
//! # Guarantees
//!
//! - A read never returns an entry whose `expires_at` has passed or whose
//!   version differs from the manager's; such entries are purged on sight.
//! - `set` evicts before inserting, so the accounted size stays within
//!   `max_cache_size`. Entries larger than the whole budget are refused.
//! - Invalidation follows `dependencies` transitively and is cycle-safe.
//! - Durable-store failures are logged and absorbed; memory keeps working.
//!
//! # Example
//!
//! ```ignore
//! let cache = CacheManager::create(
//!     CacheConfig::new().with_strategy(EvictionStrategy::Lru),
//!     DurableStorage::init(&StorageOptions::at("/var/lib/inkwell")),
//!     SystemClock::shared(),
//!     Some(CacheBus::new("inkwell-cache")),
//! )?;
//!
//! cache.set("quota:acme", &quota, Some(Duration::from_secs(300))).await;
//! let quota: Option<Quota> = cache.get("quota:acme").await;
//! ```

pub mod bus;
pub mod config;
pub mod entry;
pub mod manager;
mod memory_tier;
pub mod metrics;
pub mod partition_key;

pub use bus::{BusEnvelope, BusMessage, CacheBus, DEFAULT_BUS_CAPACITY};
pub use config::{
    CacheConfig, EvictionStrategy, DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_CACHE_SIZE, DEFAULT_TTL,
};
pub use entry::{approximate_size, CacheEntry};
pub use manager::{CacheManager, CachedValue};
pub use metrics::CacheMetrics;
pub use partition_key::{join_segments, Partition, PartitionKind, PartitionedKey, SEGMENT_SEPARATOR};
