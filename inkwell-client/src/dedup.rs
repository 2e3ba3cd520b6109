//! In-flight request deduplication.
//!
//! Callers with the same key share one execution. The first caller starts
//! the work; later callers get a clone of the same [`Shared`] future and so
//! observe the identical outcome, success or failure. A registration is
//! kept for a short grace period after the work settles so immediate
//! re-issues are absorbed too.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};

/// Default time a settled outcome stays joinable.
pub const DEFAULT_DEDUP_GRACE: Duration = Duration::from_millis(100);

pub type SharedOutcome<T> = Shared<BoxFuture<'static, T>>;

struct Inflight<T: Clone> {
    generation: u64,
    future: SharedOutcome<T>,
}

pub struct Deduplicator<T: Clone> {
    inflight: Arc<DashMap<String, Inflight<T>>>,
    generations: Arc<AtomicU64>,
    grace: Duration,
}

impl<T: Clone> Clone for Deduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
            generations: Arc::clone(&self.generations),
            grace: self.grace,
        }
    }
}

impl<T: Clone> fmt::Debug for Deduplicator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deduplicator")
            .field("inflight", &self.inflight.len())
            .field("grace", &self.grace)
            .finish()
    }
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(grace: Duration) -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            generations: Arc::new(AtomicU64::new(0)),
            grace,
        }
    }

    /// Join the execution registered under `key`, or start one with `start`.
    ///
    /// Returns the shared outcome and whether an existing execution was
    /// joined. A started execution is driven by its own task, so it runs to
    /// completion even if every caller stops waiting.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn join_or_start<F>(&self, key: &str, start: F) -> (SharedOutcome<T>, bool)
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        let entry = self.inflight.entry(key.to_string());
        if let Entry::Occupied(existing) = &entry {
            // With no grace period a settled outcome is never joined, even
            // before its driver gets around to deregistering it.
            let settled = existing.get().future.peek().is_some();
            if !(settled && self.grace.is_zero()) {
                return (existing.get().future.clone(), true);
            }
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let future = start().shared();
        entry.insert(Inflight {
            generation,
            future: future.clone(),
        });

        let inflight = Arc::clone(&self.inflight);
        let driver = future.clone();
        let key = key.to_string();
        let grace = self.grace;
        tokio::spawn(async move {
            driver.await;
            tokio::time::sleep(grace).await;
            inflight.remove_if(&key, |_, entry| entry.generation == generation);
        });
        (future, false)
    }

    /// Keys with a registered execution.
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    /// Forget every registration. Running executions are not stopped.
    pub fn clear(&self) {
        self.inflight.clear();
    }
}
