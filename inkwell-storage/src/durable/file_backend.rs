//! Single-file JSON store, the fallback when LMDB cannot be opened.
//!
//! The whole record set is held in memory and rewritten to disk after every
//! mutation. Fine for the few hundred entries a dashboard caches; not meant
//! for anything larger.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{DurableStore, StorageError, StoreKind, StoredRecord, KEY_PREFIX};
use crate::cache::entry::CacheEntry;

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, CacheEntry>>,
}

impl FileStore {
    /// Open `path`, loading any records already there.
    ///
    /// Fails if the parent directory cannot be created or the file cannot
    /// be written.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let records = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str::<Vec<StoredRecord>>(&contents)?
                .into_iter()
                .map(|record| (record.key, record.value))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let store = Self {
            path,
            records: Mutex::new(records),
        };
        // Prove the file is writable now rather than on the first `set`.
        store.flush(&store.lock())?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, CacheEntry>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self, records: &BTreeMap<String, CacheEntry>) -> Result<(), StorageError> {
        let on_disk: Vec<StoredRecord> = records
            .iter()
            .map(|(key, value)| StoredRecord {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        let contents = serde_json::to_string(&on_disk)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FileStore {
    fn kind(&self) -> StoreKind {
        StoreKind::File
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), StorageError> {
        let mut records = self.lock();
        records.insert(key.to_string(), entry.clone());
        self.flush(&records)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut records = self.lock();
        if records.remove(key).is_none() {
            return Ok(false);
        }
        self.flush(&records)?;
        Ok(true)
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|key, _| !key.starts_with(KEY_PREFIX));
        let removed = (before - records.len()) as u64;
        if removed > 0 {
            self.flush(&records)?;
        }
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .lock()
            .keys()
            .filter(|key| key.starts_with(KEY_PREFIX))
            .cloned()
            .collect())
    }
}
