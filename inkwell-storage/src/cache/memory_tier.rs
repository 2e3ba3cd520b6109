//! The in-memory tier: live entries plus the bookkeeping each eviction
//! strategy needs.
//!
//! All operations here are synchronous. The manager holds the tier behind
//! a mutex and never keeps the guard across an `.await`.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use super::config::EvictionStrategy;
use super::entry::CacheEntry;

#[derive(Debug, Default)]
pub(crate) struct MemoryTier {
    entries: HashMap<String, CacheEntry>,
    /// Least recently used at the front.
    access_order: VecDeque<String>,
    /// LFU hit counters.
    frequencies: HashMap<String, u64>,
    /// Insertion sequence, tie-breaker when timestamps collide.
    sequence: HashMap<String, u64>,
    next_sequence: u64,
    total_size: u64,
}

impl MemoryTier {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Insert or replace. Replacing resets the key's position and counters.
    pub fn insert(&mut self, key: String, entry: CacheEntry) {
        self.remove(&key);
        self.total_size += entry.size;
        self.access_order.push_back(key.clone());
        self.frequencies.insert(key.clone(), 0);
        self.sequence.insert(key.clone(), self.next_sequence);
        self.next_sequence += 1;
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_size = self.total_size.saturating_sub(entry.size);
        if let Some(pos) = self.access_order.iter().position(|k| k == key) {
            self.access_order.remove(pos);
        }
        self.frequencies.remove(key);
        self.sequence.remove(key);
        Some(entry)
    }

    /// Record a hit: bump stats, move to the back of the LRU order, bump the
    /// LFU counter. Returns the updated entry.
    pub fn touch(&mut self, key: &str, now: DateTime<Utc>) -> Option<&CacheEntry> {
        let entry = self.entries.get_mut(key)?;
        entry.touch(now);
        if let Some(pos) = self.access_order.iter().position(|k| k == key) {
            if let Some(k) = self.access_order.remove(pos) {
                self.access_order.push_back(k);
            }
        }
        *self.frequencies.entry(key.to_string()).or_insert(0) += 1;
        self.entries.get(key)
    }

    pub fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys whose removal brings `total_size + incoming` within `max_size`.
    ///
    /// Returns an empty list when nothing needs to go. May return every key
    /// when `incoming` alone does not fit.
    pub fn select_victims(
        &self,
        strategy: EvictionStrategy,
        incoming: u64,
        max_size: u64,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        if self.total_size.saturating_add(incoming) <= max_size {
            return Vec::new();
        }

        let candidates = match strategy {
            EvictionStrategy::Lru => self.access_order.iter().cloned().collect(),
            EvictionStrategy::Lfu => self.ordered_by(|key, _| {
                (self.frequencies.get(key).copied().unwrap_or(0), 0)
            }),
            EvictionStrategy::Fifo => self.ordered_by(|_, entry| (0, entry.timestamp.timestamp_millis())),
            EvictionStrategy::Ttl => {
                let mut expired: Vec<&String> = self
                    .entries
                    .iter()
                    .filter(|(_, entry)| entry.is_expired(now))
                    .map(|(key, _)| key)
                    .collect();
                expired.sort_by_key(|key| (self.entries[*key].expires_at, self.seq(key)));
                let mut order: Vec<String> = expired.into_iter().cloned().collect();
                let live = self.ordered_by(|_, entry| (0, entry.timestamp.timestamp_millis()));
                order.extend(live.into_iter().filter(|key| !self.entries[key].is_expired(now)));
                order
            }
        };

        let mut victims = Vec::new();
        let mut projected = self.total_size.saturating_add(incoming);
        for key in candidates {
            if projected <= max_size {
                break;
            }
            if let Some(entry) = self.entries.get(&key) {
                projected = projected.saturating_sub(entry.size);
                victims.push(key);
            }
        }
        victims
    }

    fn seq(&self, key: &str) -> u64 {
        self.sequence.get(key).copied().unwrap_or(u64::MAX)
    }

    /// Keys sorted ascending by `rank`, ties broken by insertion sequence.
    fn ordered_by<F>(&self, rank: F) -> Vec<String>
    where
        F: Fn(&str, &CacheEntry) -> (u64, i64),
    {
        let mut keys: Vec<(&String, (u64, i64), u64)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key, rank(key, entry), self.seq(key)))
            .collect();
        keys.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
        keys.into_iter().map(|(key, _, _)| key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::partition_key::PartitionKind;
    use serde_json::json;
    use std::time::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    /// An entry whose serialized payload is exactly `size` bytes.
    fn entry(size: usize, created: DateTime<Utc>, ttl_secs: u64) -> CacheEntry {
        // A JSON string of n chars serializes to n + 2 bytes.
        let payload = "x".repeat(size.saturating_sub(2));
        CacheEntry::new(
            json!(payload),
            created,
            Duration::from_secs(ttl_secs),
            "1",
            PartitionKind::Global,
        )
    }

    fn tier_with(keys: &[&str]) -> MemoryTier {
        let mut tier = MemoryTier::default();
        for (i, key) in keys.iter().enumerate() {
            tier.insert(key.to_string(), entry(10, t(i as i64), 3600));
        }
        tier
    }

    #[test]
    fn test_size_accounting() {
        let mut tier = tier_with(&["a", "b"]);
        assert_eq!(tier.total_size(), 20);
        tier.insert("a".into(), entry(30, t(5), 60));
        assert_eq!(tier.total_size(), 40);
        tier.remove("b");
        assert_eq!(tier.total_size(), 30);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_no_victims_when_fits() {
        let tier = tier_with(&["a", "b"]);
        assert!(tier
            .select_victims(EvictionStrategy::Lru, 10, 30, t(0))
            .is_empty());
    }

    #[test]
    fn test_lru_evicts_least_recently_touched() {
        let mut tier = tier_with(&["a", "b", "c"]);
        tier.touch("a", t(10));
        let victims = tier.select_victims(EvictionStrategy::Lru, 10, 30, t(10));
        assert_eq!(victims, vec!["b".to_string()]);
    }

    #[test]
    fn test_lfu_evicts_least_frequent() {
        let mut tier = tier_with(&["a", "b", "c"]);
        tier.touch("a", t(10));
        tier.touch("a", t(11));
        tier.touch("b", t(12));
        let victims = tier.select_victims(EvictionStrategy::Lfu, 20, 30, t(12));
        assert_eq!(victims, vec!["c".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_fifo_ignores_access() {
        let mut tier = tier_with(&["a", "b", "c"]);
        tier.touch("a", t(10));
        let victims = tier.select_victims(EvictionStrategy::Fifo, 10, 30, t(10));
        assert_eq!(victims, vec!["a".to_string()]);
    }

    #[test]
    fn test_ttl_prefers_expired_then_oldest() {
        let mut tier = MemoryTier::default();
        tier.insert("old".into(), entry(10, t(0), 3600));
        tier.insert("short".into(), entry(10, t(1), 5));
        tier.insert("new".into(), entry(10, t(2), 3600));
        let victims = tier.select_victims(EvictionStrategy::Ttl, 20, 30, t(100));
        assert_eq!(victims, vec!["short".to_string(), "old".to_string()]);
    }

    #[test]
    fn test_oversized_incoming_selects_everything() {
        let tier = tier_with(&["a", "b"]);
        let victims = tier.select_victims(EvictionStrategy::Lru, 100, 50, t(0));
        assert_eq!(victims.len(), 2);
    }

    #[test]
    fn test_touch_moves_to_back() {
        let mut tier = tier_with(&["a", "b"]);
        let touched = tier.touch("a", t(3)).cloned().unwrap();
        assert_eq!(touched.access_count, 1);
        assert_eq!(tier.access_order.back().map(String::as_str), Some("a"));
        assert!(tier.touch("missing", t(3)).is_none());
    }

    #[test]
    fn test_expired_keys() {
        let mut tier = MemoryTier::default();
        tier.insert("a".into(), entry(10, t(0), 5));
        tier.insert("b".into(), entry(10, t(0), 500));
        assert_eq!(tier.expired_keys(t(10)), vec!["a".to_string()]);
    }
}
