//! LMDB-backed durable store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! key-value store that survives restarts.
//!
//! # Record Format
//!
//! Each key maps to the JSON encoding of a [`StoredRecord`]
//! (`{ "key": ..., "value": CacheEntry }`).
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The store uses:
//! - Read transactions for `get` and `keys`
//! - Write transactions for `set`, `delete` and `clear`

use std::path::Path;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use super::{DurableStore, StorageError, StoreKind, StoredRecord, KEY_PREFIX};
use crate::cache::entry::CacheEntry;

/// LMDB-backed durable store.
///
/// # Example
///
/// ```ignore
/// use inkwell_storage::durable::LmdbStore;
///
/// let store = LmdbStore::open("/tmp/inkwell/lmdb", 64)?;
/// store.set("inkwell-cache:quota:acme", &entry).await?;
/// let cached = store.get("inkwell-cache:quota:acme").await?;
/// ```
pub struct LmdbStore {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
}

impl std::fmt::Debug for LmdbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbStore")
            .field("path", &self.env.path())
            .finish_non_exhaustive()
    }
}

impl LmdbStore {
    /// Open (or create) an LMDB environment in `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, StorageError> {
        // Ensure directory exists
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb.max(1) * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| StorageError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| StorageError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        Ok(Self { env, db })
    }

    /// Collect every key under the cache namespace.
    fn collect_keys(&self) -> Result<Vec<String>, StorageError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let mut keys = Vec::new();
        for result in iter {
            match result {
                Ok((key, _)) => {
                    if let Ok(key) = std::str::from_utf8(key) {
                        if key.starts_with(KEY_PREFIX) {
                            keys.push(key.to_string());
                        }
                    }
                }
                Err(_) => continue,
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl DurableStore for LmdbStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Lmdb
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        match self.db.get(&rtxn, key.as_bytes()) {
            Ok(Some(bytes)) => {
                let record: StoredRecord = serde_json::from_slice(bytes)?;
                Ok(Some(record.value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StorageError::Transaction(e.to_string())),
        }
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), StorageError> {
        let record = StoredRecord {
            key: key.to_string(),
            value: entry.clone(),
        };
        let bytes = serde_json::to_vec(&record)?;

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let deleted = self
            .db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        Ok(deleted)
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        let keys = self.collect_keys()?;

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let mut deleted = 0u64;
        for key in &keys {
            if self.db.delete(&mut wtxn, key.as_bytes()).unwrap_or(false) {
                deleted += 1;
            }
        }

        wtxn.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        Ok(deleted)
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.collect_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::partition_key::PartitionKind;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LmdbStore::open(temp_dir.path(), 10).expect("Failed to create store");
        (store, temp_dir)
    }

    fn make_entry(title: &str) -> CacheEntry {
        CacheEntry::new(
            serde_json::json!({ "title": title }),
            Utc::now(),
            Duration::from_secs(3600),
            "1",
            PartitionKind::Global,
        )
        .with_dependencies(["inkwell-cache:posts:acme"])
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _temp_dir) = create_test_store();
        let entry = make_entry("Summer lookbook");

        store
            .set("inkwell-cache:post:1", &entry)
            .await
            .expect("set should succeed");

        let cached = store
            .get("inkwell-cache:post:1")
            .await
            .expect("get should succeed");
        assert_eq!(cached, Some(entry));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let (store, _temp_dir) = create_test_store();
        let cached = store
            .get("inkwell-cache:nope")
            .await
            .expect("get should succeed");
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _temp_dir) = create_test_store();
        store
            .set("inkwell-cache:post:1", &make_entry("a"))
            .await
            .expect("set should succeed");

        assert!(store.delete("inkwell-cache:post:1").await.expect("delete should succeed"));
        assert!(!store.delete("inkwell-cache:post:1").await.expect("delete should succeed"));
        assert!(store
            .get("inkwell-cache:post:1")
            .await
            .expect("get should succeed")
            .is_none());
    }

    #[tokio::test]
    async fn test_clear_only_touches_namespace() {
        let (store, _temp_dir) = create_test_store();
        for i in 0..3 {
            store
                .set(&format!("inkwell-cache:post:{}", i), &make_entry("x"))
                .await
                .expect("set should succeed");
        }
        store
            .set("other-app:setting", &make_entry("foreign"))
            .await
            .expect("set should succeed");

        let deleted = store.clear().await.expect("clear should succeed");
        assert_eq!(deleted, 3);
        assert!(store.keys().await.expect("keys should succeed").is_empty());
        assert!(store
            .get("other-app:setting")
            .await
            .expect("get should succeed")
            .is_some());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let entry = make_entry("persisted");
        {
            let store = LmdbStore::open(temp_dir.path(), 10).expect("open");
            store
                .set("inkwell-cache:post:9", &entry)
                .await
                .expect("set should succeed");
        }
        let store = LmdbStore::open(temp_dir.path(), 10).expect("reopen");
        let cached = store.get("inkwell-cache:post:9").await.expect("get");
        assert_eq!(cached, Some(entry));
    }

    #[tokio::test]
    async fn test_overwrite() {
        let (store, _temp_dir) = create_test_store();
        store
            .set("inkwell-cache:post:1", &make_entry("Draft"))
            .await
            .expect("set should succeed");
        let updated = make_entry("Published");
        store
            .set("inkwell-cache:post:1", &updated)
            .await
            .expect("set should succeed");

        let cached = store.get("inkwell-cache:post:1").await.expect("get");
        assert_eq!(cached.expect("cached should be Some").data["title"], "Published");
    }
}
