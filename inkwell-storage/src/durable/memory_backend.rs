//! In-process durable store.
//!
//! Survives a cache manager being dropped and recreated, which is what tests
//! need to model a page reload. Can be switched into a failing mode to
//! simulate a broken disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{DurableStore, StorageError, StoreKind, KEY_PREFIX};
use crate::cache::entry::CacheEntry;

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, CacheEntry>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of stored records, regardless of namespace.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw lookup by full (namespaced) key, bypassing the failure switch.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        self.check()?;
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), StorageError> {
        self.check()?;
        self.lock().insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.check()?;
        Ok(self.lock().remove(key).is_some())
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        self.check()?;
        let mut records = self.lock();
        let before = records.len();
        records.retain(|key, _| !key.starts_with(KEY_PREFIX));
        Ok((before - records.len()) as u64)
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.check()?;
        let mut keys: Vec<String> = self
            .lock()
            .keys()
            .filter(|key| key.starts_with(KEY_PREFIX))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
