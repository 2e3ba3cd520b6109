//! Partition-scoped cache keys.
//!
//! Several logical tenants can share one cache manager. Each manager is
//! bound to a [`Partition`]; every key it touches is rewritten into a
//! [`PartitionedKey`] carrying the partition prefix, so two partitions can
//! never read each other's entries. `PartitionedKey` has no public field
//! constructor: the only way to get one is through a `Partition`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use inkwell_core::ConfigError;

/// Separator between key segments.
pub const SEGMENT_SEPARATOR: char = ':';

/// The logical namespace an entry belongs to, without its identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    #[default]
    Global,
    User,
    Session,
    Tenant,
}

impl PartitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionKind::Global => "global",
            PartitionKind::User => "user",
            PartitionKind::Session => "session",
            PartitionKind::Tenant => "tenant",
        }
    }
}

/// The partition a cache manager is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Partition {
    /// No prefix.
    #[default]
    Global,
    User(String),
    Session(String),
    Tenant(String),
}

impl Partition {
    pub fn kind(&self) -> PartitionKind {
        match self {
            Partition::Global => PartitionKind::Global,
            Partition::User(_) => PartitionKind::User,
            Partition::Session(_) => PartitionKind::Session,
            Partition::Tenant(_) => PartitionKind::Tenant,
        }
    }

    /// Key prefix for this partition, e.g. `user:42:`. Empty for global.
    pub fn prefix(&self) -> String {
        match self {
            Partition::Global => String::new(),
            Partition::User(id) | Partition::Session(id) | Partition::Tenant(id) => {
                format!("{}:{}:", self.kind().as_str(), id)
            }
        }
    }

    /// Scope a caller key to this partition.
    pub fn key(&self, key: &str) -> PartitionedKey {
        PartitionedKey::new(self, key)
    }

    /// Whether a stored key belongs to this partition.
    ///
    /// The global partition owns only keys that carry no other partition's
    /// prefix.
    pub fn owns(&self, stored: &str) -> bool {
        match self {
            Partition::Global => !has_partition_prefix(stored),
            _ => stored.starts_with(&self.prefix()),
        }
    }

    /// Whether `key` stays inside this partition once scoped.
    ///
    /// Global keys must not start with another partition's prefix, or they
    /// would be read and invalidated as that partition's entries.
    pub fn admits(&self, key: &str) -> bool {
        self.owns(self.key(key).as_str())
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Global => f.write_str("global"),
            Partition::User(id) | Partition::Session(id) | Partition::Tenant(id) => {
                write!(f, "{}:{}", self.kind().as_str(), id)
            }
        }
    }
}

/// Parses `global`, `user:<id>`, `session:<id>` or `tenant:<id>`.
impl FromStr for Partition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("global") {
            return Ok(Partition::Global);
        }
        let (kind, id) = s
            .split_once(SEGMENT_SEPARATOR)
            .ok_or_else(|| ConfigError::invalid("partition", format!("malformed partition '{}'", s)))?;
        if id.is_empty() || id.contains(SEGMENT_SEPARATOR) {
            return Err(ConfigError::invalid(
                "partition",
                "partition id must be non-empty and must not contain ':'",
            ));
        }
        match kind.to_ascii_lowercase().as_str() {
            "user" => Ok(Partition::User(id.to_string())),
            "session" => Ok(Partition::Session(id.to_string())),
            "tenant" => Ok(Partition::Tenant(id.to_string())),
            other => Err(ConfigError::invalid(
                "partition",
                format!("unknown partition kind '{}'", other),
            )),
        }
    }
}

fn has_partition_prefix(stored: &str) -> bool {
    ["user:", "session:", "tenant:"]
        .iter()
        .any(|prefix| stored.starts_with(prefix))
}

/// A cache key bound to a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionedKey {
    inner: PartitionedKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PartitionedKeyInner {
    full: String,
    prefix_len: usize,
}

impl PartitionedKey {
    fn new(partition: &Partition, key: &str) -> Self {
        let prefix = partition.prefix();
        let prefix_len = prefix.len();
        Self {
            inner: PartitionedKeyInner {
                full: format!("{}{}", prefix, key),
                prefix_len,
            },
        }
    }

    /// The stored form, prefix included.
    pub fn as_str(&self) -> &str {
        &self.inner.full
    }

    /// The caller-facing key, prefix stripped.
    pub fn local(&self) -> &str {
        &self.inner.full[self.inner.prefix_len..]
    }

    pub fn into_string(self) -> String {
        self.inner.full
    }
}

impl fmt::Display for PartitionedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Join query-identifier segments into a cache key.
pub fn join_segments<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key = String::new();
    for (i, segment) in segments.into_iter().enumerate() {
        if i > 0 {
            key.push(SEGMENT_SEPARATOR);
        }
        key.push_str(segment.as_ref());
    }
    key
}
