//! Cache entries and the metadata that drives expiry and eviction.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::partition_key::PartitionKind;

/// One cached value.
///
/// Entries are owned by the cache manager. Callers only ever see the
/// deserialized `data`; access statistics are mutated on every hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Opaque payload.
    pub data: serde_json::Value,
    /// When the entry was created.
    pub timestamp: DateTime<Utc>,
    /// The entry is unusable at or after this instant.
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    /// Serialized byte length of `data`.
    pub size: u64,
    /// Cache-wide version the entry was written under.
    pub version: String,
    pub partition: PartitionKind,
    /// Keys invalidated together with this one.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
}

impl CacheEntry {
    pub fn new(
        data: serde_json::Value,
        now: DateTime<Utc>,
        ttl: Duration,
        version: impl Into<String>,
        partition: PartitionKind,
    ) -> Self {
        let size = approximate_size(&data);
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            data,
            timestamp: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            access_count: 0,
            last_accessed: now,
            size,
            version: version.into(),
            partition,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Expired once `expires_at` is no longer in the future.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// How long ago the entry was written.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Record a read.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed = now;
    }
}

/// Approximate serialized size used for capacity accounting.
pub fn approximate_size(data: &serde_json::Value) -> u64 {
    serde_json::to_vec(data).map(|bytes| bytes.len() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_entry_expiry_boundary() {
        let entry = CacheEntry::new(
            json!({"title": "Spring drop"}),
            epoch(),
            Duration::from_secs(60),
            "1",
            PartitionKind::Global,
        );
        assert!(!entry.is_expired(epoch() + chrono::Duration::seconds(59)));
        assert!(entry.is_expired(epoch() + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_entry_size_matches_serialized_length() {
        let data = json!({"posts": [1, 2, 3]});
        let entry = CacheEntry::new(
            data.clone(),
            epoch(),
            Duration::from_secs(1),
            "1",
            PartitionKind::Global,
        );
        assert_eq!(entry.size, serde_json::to_vec(&data).unwrap().len() as u64);
    }

    #[test]
    fn test_touch_updates_stats() {
        let mut entry = CacheEntry::new(
            json!(1),
            epoch(),
            Duration::from_secs(1),
            "1",
            PartitionKind::Global,
        );
        let later = epoch() + chrono::Duration::seconds(5);
        entry.touch(later);
        entry.touch(later);
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.last_accessed, later);
        assert_eq!(entry.age(later), Duration::from_secs(5));
    }

    #[test]
    fn test_entry_json_layout_is_camel_case() {
        let entry = CacheEntry::new(
            json!("x"),
            epoch(),
            Duration::from_secs(1),
            "v2",
            PartitionKind::User,
        )
        .with_dependencies(["quota:shop-1"]);
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("expiresAt").is_some());
        assert!(value.get("accessCount").is_some());
        assert_eq!(value["partition"], json!("user"));
        assert_eq!(value["dependencies"], json!(["quota:shop-1"]));
    }
}
