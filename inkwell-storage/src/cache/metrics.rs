//! Cache usage statistics.

use std::time::Duration;

/// Snapshot of cache activity since construction or the last `clear`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    /// Entries dropped to stay within the memory budget.
    pub evictions: u64,
    /// Entries removed by `invalidate`, including dependency cascades.
    pub invalidations: u64,
    /// Entries removed because they expired.
    pub expirations: u64,
    pub entry_count: u64,
    /// Bytes currently accounted in memory.
    pub total_size: u64,
    /// Running average of hit latency.
    pub average_access_time: Duration,
}

impl CacheMetrics {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub(crate) fn record_hit(&mut self, elapsed: Duration) {
        self.hits += 1;
        // running mean: avg += (x - avg) / n
        let n = self.hits as f64;
        let avg = self.average_access_time.as_secs_f64();
        let next = avg + (elapsed.as_secs_f64() - avg) / n;
        self.average_access_time = Duration::from_secs_f64(next.max(0.0));
    }
}
