//! Scripted transport for tests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{HttpRequest, HttpResponse, Transport, TransportError, TransportErrorKind};

/// One scripted outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    Response(HttpResponse),
    Error(TransportError),
}

impl MockReply {
    pub fn json(status: u16, value: serde_json::Value) -> Self {
        MockReply::Response(HttpResponse::json(status, &value))
    }

    /// A 200 with the value wrapped in the `{ data, correlationId }` envelope.
    pub fn enveloped(value: serde_json::Value) -> Self {
        Self::json(
            200,
            serde_json::json!({ "data": value, "correlationId": "mock-correlation" }),
        )
    }

    pub fn error(kind: TransportErrorKind, message: &str) -> Self {
        MockReply::Error(TransportError::new(kind, message))
    }
}

/// A request the mock received, with the (Tokio) instant it arrived.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub request: HttpRequest,
    pub at: Instant,
}

/// Replays scripted replies in order, then falls back to a default reply.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockReply>>,
    fallback: Mutex<Option<MockReply>>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Mutex<Duration>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next unanswered call.
    pub fn push(&self, reply: MockReply) -> &Self {
        locked(&self.script).push_back(reply);
        self
    }

    /// Reply used once the script is exhausted.
    pub fn set_fallback(&self, reply: MockReply) -> &Self {
        *locked(&self.fallback) = Some(reply);
        self
    }

    /// Simulated network latency applied to every call.
    pub fn set_latency(&self, latency: Duration) -> &Self {
        *locked(&self.latency) = latency;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        locked(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        locked(&self.calls).len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        locked(&self.calls).push(RecordedCall {
            request,
            at: Instant::now(),
        });

        let latency = *locked(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let reply = locked(&self.script).pop_front();
        let reply = match reply {
            Some(reply) => reply,
            None => locked(&self.fallback).clone().unwrap_or_else(|| {
                MockReply::error(TransportErrorKind::Other, "no scripted reply")
            }),
        };

        match reply {
            MockReply::Response(response) => Ok(response),
            MockReply::Error(err) => Err(err),
        }
    }
}
