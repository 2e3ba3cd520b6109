//! Inkwell Storage - durable key-value storage and the layered cache manager.
//!
//! The [`durable`] module wraps the best available on-disk store (LMDB,
//! then a JSON file, then nothing) behind an error-absorbing façade. The
//! [`cache`] module builds the memory tier, eviction strategies, partitioned
//! keys and cross-tab bus on top of it.

pub mod cache;
pub mod durable;

pub use cache::{
    join_segments, BusEnvelope, BusMessage, CacheBus, CacheConfig, CacheEntry, CacheManager,
    CacheMetrics, CachedValue, EvictionStrategy, Partition, PartitionKind, PartitionedKey,
};
pub use durable::{
    DurableStorage, DurableStore, FileStore, LmdbStore, MemoryStore, NullStore, StorageError,
    StorageOptions, StoreKind, StoredRecord, KEY_PREFIX,
};
