//! Durable key-value storage behind the cache manager.
//!
//! Persistence is best-effort. A [`DurableStore`] back-end reports its
//! failures as [`StorageError`], but the [`DurableStorage`] façade the cache
//! manager talks to absorbs every one of them: reads degrade to `None`,
//! writes to `false`, listings to an empty `Vec`, and the failure is logged.
//! A broken disk must never stop the in-memory cache from working.
//!
//! # Back-end selection
//!
//! [`DurableStorage::init`] opens, in order of preference:
//!
//! 1. [`LmdbStore`], a memory-mapped LMDB database;
//! 2. [`FileStore`], a single JSON file rewritten on every mutation;
//! 3. [`NullStore`], which stores nothing (memory-only mode).
//!
//! All keys are namespaced with [`KEY_PREFIX`] so the cache can share a
//! database or directory with unrelated data.

pub mod file_backend;
pub mod lmdb_backend;
pub mod memory_backend;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::entry::CacheEntry;

pub use file_backend::FileStore;
pub use lmdb_backend::LmdbStore;
pub use memory_backend::MemoryStore;

/// Namespace prepended to every durable key.
pub const KEY_PREFIX: &str = "inkwell-cache:";

/// Default LMDB map size in megabytes.
pub const DEFAULT_MAP_SIZE_MB: usize = 256;

/// Error type for durable storage back-ends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation attempted on a store that is not available.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Which back-end is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Lmdb,
    File,
    Memory,
    Null,
}

/// One persisted record: `{ key, value }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub value: CacheEntry,
}

/// A durable key-value back-end.
///
/// Keys passed to a back-end are already namespaced.
#[async_trait]
pub trait DurableStore: Send + Sync + fmt::Debug {
    fn kind(&self) -> StoreKind;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), StorageError>;

    /// Returns whether a record was removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Remove every record under [`KEY_PREFIX`]. Returns how many.
    async fn clear(&self) -> Result<u64, StorageError>;

    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// A store that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl DurableStore for NullStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Null
    }

    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, StorageError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _entry: &CacheEntry) -> Result<(), StorageError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        Ok(0)
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }
}

/// Where [`DurableStorage::init`] should put its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOptions {
    /// Directory for the durable database. `None` means memory-only.
    pub path: Option<PathBuf>,
    pub map_size_mb: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            path: None,
            map_size_mb: DEFAULT_MAP_SIZE_MB,
        }
    }
}

impl StorageOptions {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }
}

/// Error-absorbing façade over a [`DurableStore`].
#[derive(Debug, Clone)]
pub struct DurableStorage {
    store: Arc<dyn DurableStore>,
}

impl DurableStorage {
    /// Open the best available back-end, degrading to memory-only.
    pub fn init(options: &StorageOptions) -> Self {
        let Some(root) = options.path.as_ref() else {
            tracing::debug!("No persistence path configured, cache is memory-only");
            return Self::memory_only();
        };

        match LmdbStore::open(root.join("lmdb"), options.map_size_mb) {
            Ok(store) => return Self::from_store(Arc::new(store)),
            Err(e) => {
                tracing::warn!(error = %e, path = %root.display(), "LMDB unavailable, falling back to file store");
            }
        }

        match FileStore::open(root.join("cache.json")) {
            Ok(store) => Self::from_store(Arc::new(store)),
            Err(e) => {
                tracing::warn!(error = %e, path = %root.display(), "File store unavailable, cache is memory-only");
                Self::memory_only()
            }
        }
    }

    pub fn memory_only() -> Self {
        Self::from_store(Arc::new(NullStore))
    }

    pub fn from_store(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub fn kind(&self) -> StoreKind {
        self.store.kind()
    }

    pub fn is_persistent(&self) -> bool {
        self.kind() != StoreKind::Null
    }

    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        match self.store.get(&namespaced(key)).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key, error = %e, "Durable read failed");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, entry: &CacheEntry) -> bool {
        match self.store.set(&namespaced(key), entry).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key, error = %e, "Durable write failed");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self.store.delete(&namespaced(key)).await {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::warn!(key, error = %e, "Durable delete failed");
                false
            }
        }
    }

    pub async fn clear(&self) -> u64 {
        match self.store.clear().await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Durable clear failed");
                0
            }
        }
    }

    /// Every cache key in the store, namespace stripped.
    pub async fn get_all_keys(&self) -> Vec<String> {
        match self.store.keys().await {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(str::to_string))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Durable key listing failed");
                Vec::new()
            }
        }
    }
}

fn namespaced(key: &str) -> String {
    format!("{}{}", KEY_PREFIX, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::partition_key::PartitionKind;
    use chrono::Utc;
    use std::time::Duration;

    fn sample_entry() -> CacheEntry {
        CacheEntry::new(
            serde_json::json!({"shop": "acme"}),
            Utc::now(),
            Duration::from_secs(60),
            "1",
            PartitionKind::Global,
        )
    }

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl DurableStore for BrokenStore {
        fn kind(&self) -> StoreKind {
            StoreKind::File
        }
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
        async fn set(&self, _key: &str, _entry: &CacheEntry) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
        async fn delete(&self, _key: &str) -> Result<bool, StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
        async fn clear(&self) -> Result<u64, StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
        async fn keys(&self) -> Result<Vec<String>, StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
    }

    #[tokio::test]
    async fn test_failures_are_absorbed() {
        let storage = DurableStorage::from_store(Arc::new(BrokenStore));
        assert!(storage.get("k").await.is_none());
        assert!(!storage.set("k", &sample_entry()).await);
        assert!(!storage.delete("k").await);
        assert_eq!(storage.clear().await, 0);
        assert!(storage.get_all_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let backend = Arc::new(MemoryStore::new());
        let storage = DurableStorage::from_store(backend.clone());
        assert!(storage.set("store-info:acme", &sample_entry()).await);

        let raw = backend.keys().await.unwrap();
        assert_eq!(raw, vec!["inkwell-cache:store-info:acme".to_string()]);
        assert_eq!(storage.get_all_keys().await, vec!["store-info:acme".to_string()]);
    }

    #[tokio::test]
    async fn test_init_without_path_is_memory_only() {
        let storage = DurableStorage::init(&StorageOptions::default());
        assert_eq!(storage.kind(), StoreKind::Null);
        assert!(!storage.is_persistent());
        assert!(storage.set("k", &sample_entry()).await);
        assert!(storage.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_init_with_path_is_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DurableStorage::init(&StorageOptions::at(dir.path()));
        assert!(storage.is_persistent());
        let entry = sample_entry();
        assert!(storage.set("k", &entry).await);
        assert_eq!(storage.get("k").await, Some(entry));
    }

    #[tokio::test]
    async fn test_init_on_unusable_path_degrades() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is expected breaks both back-ends.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let storage = DurableStorage::init(&StorageOptions::at(&blocker));
        assert_eq!(storage.kind(), StoreKind::Null);
    }
}
