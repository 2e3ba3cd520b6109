//! Cross-tab invalidation bus.
//!
//! Cache managers that share a [`CacheBus`] relay their `update` and
//! `invalidate` mutations to each other, so every instance converges on the
//! same state without re-fetching from the network.
//!
//! Delivery is fire-and-forget over a `tokio::sync::broadcast` channel:
//!
//! - There is no acknowledgement. A publish with no subscribers is dropped.
//! - A subscriber that falls behind by more than the channel capacity misses
//!   messages and logs the lag.
//! - Messages are applied in receipt order per subscriber; there is no global
//!   ordering across publishers.
//!
//! Convergence is eventual and best-effort, not a consistency guarantee.
//! Both message kinds are idempotent, so replays and reordering between
//! different keys are harmless.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::entry::CacheEntry;

/// Default number of buffered messages per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// A cache mutation relayed between managers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusMessage {
    Invalidate { key: String },
    Update { key: String, entry: CacheEntry },
}

impl BusMessage {
    pub fn key(&self) -> &str {
        match self {
            BusMessage::Invalidate { key } | BusMessage::Update { key, .. } => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::Invalidate { .. } => "invalidate",
            BusMessage::Update { .. } => "update",
        }
    }
}

/// A message plus the id of the manager that published it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub origin: Uuid,
    pub message: BusMessage,
}

/// A named broadcast channel shared by cooperating cache managers.
#[derive(Debug, Clone)]
pub struct CacheBus {
    name: String,
    tx: broadcast::Sender<BusEnvelope>,
}

impl CacheBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a mutation. Returns the number of subscribers reached.
    pub fn publish(&self, origin: Uuid, message: BusMessage) -> usize {
        let kind = message.kind();
        match self.tx.send(BusEnvelope { origin, message }) {
            Ok(receivers) => {
                tracing::debug!(channel = %self.name, kind, receivers, "Published cache message");
                receivers
            }
            Err(_) => {
                tracing::debug!(channel = %self.name, kind, "No subscribers for cache message");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
