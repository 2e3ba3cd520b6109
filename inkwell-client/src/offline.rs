//! Connectivity tracking and the offline resend queue.
//!
//! The host application reports connectivity through a [`NetworkMonitor`].
//! While it reads offline, the pipeline rejects requests with a network
//! error and parks them in an [`OfflineQueue`]; when it flips back online
//! the queue is replayed in order and each outcome is published as a
//! [`ReplayOutcome`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use inkwell_core::{ApiResult, HttpMethod};
use serde_json::Value;
use tokio::sync::watch;

use crate::request::RequestOptions;

/// Shared online/offline flag with change notification.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
        }
    }

    /// Record a connectivity change. Repeating the current state is a no-op.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::debug!(online, "Network state changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

/// A request parked while offline.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request_id: String,
    pub options: RequestOptions,
    pub queued_at: DateTime<Utc>,
}

/// Published once per replayed request after reconnecting.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub request_id: String,
    pub method: HttpMethod,
    pub url: String,
    pub result: ApiResult<Value>,
}

/// FIFO of requests waiting for connectivity.
#[derive(Debug, Default)]
pub struct OfflineQueue {
    items: Mutex<VecDeque<QueuedRequest>>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<QueuedRequest>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, request_id: impl Into<String>, options: RequestOptions) {
        let request_id = request_id.into();
        let mut items = self.items();
        items.push_back(QueuedRequest {
            request_id: request_id.clone(),
            options,
            queued_at: Utc::now(),
        });
        tracing::debug!(request_id = %request_id, queued = items.len(), "Request queued while offline");
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&self) -> Vec<QueuedRequest> {
        self.items().drain(..).collect()
    }

    /// Put requests back at the head of the queue, keeping their order.
    pub fn requeue_front(&self, requests: Vec<QueuedRequest>) {
        let mut items = self.items();
        for request in requests.into_iter().rev() {
            items.push_front(request);
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn clear(&self) {
        self.items().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monitor_notifies_on_change_only() {
        let monitor = NetworkMonitor::new(true);
        let mut rx = monitor.subscribe();

        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());

        monitor.set_online(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_queue_is_fifo() {
        let queue = OfflineQueue::new();
        queue.enqueue("r1", RequestOptions::get("/a"));
        queue.enqueue("r2", RequestOptions::get("/b"));

        let drained = queue.drain();
        let ids: Vec<_> = drained.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let queue = OfflineQueue::new();
        queue.enqueue("r3", RequestOptions::get("/c"));

        let earlier = vec![
            QueuedRequest {
                request_id: "r1".into(),
                options: RequestOptions::get("/a"),
                queued_at: Utc::now(),
            },
            QueuedRequest {
                request_id: "r2".into(),
                options: RequestOptions::get("/b"),
                queued_at: Utc::now(),
            },
        ];
        queue.requeue_front(earlier);

        let ids: Vec<_> = queue.drain().into_iter().map(|r| r.request_id).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }
}
