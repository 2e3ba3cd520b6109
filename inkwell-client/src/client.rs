//! The request pipeline.
//!
//! One logical request moves through:
//!
//! 1. cancellation check;
//! 2. response cache lookup (opt-in per request);
//! 3. offline check: rejected with a network error and parked for replay;
//! 4. deduplication: identical in-flight requests share one execution;
//! 5. execution: rate-limit admission, send, classify, and retry with
//!    backoff until success, a final error, or cancellation.
//!
//! Every logical request gets a UUID v7 id, one row in the request log and
//! a contribution to the global and per-endpoint metrics.
//!
//! A shared execution is never cancelled by one of its callers: a caller
//! whose token fires stops waiting and gets a cancelled error, while the
//! execution keeps running for everyone else.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::FutureExt;
use inkwell_core::{ApiError, ApiResult, ConfigError, ErrorCategory, TaskGroup};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::batch::{BatchPush, BatchQueue};
use crate::classify::{classify_status, classify_transport};
use crate::config::PipelineConfig;
use crate::dedup::Deduplicator;
use crate::envelope::{self, EnvelopeMode};
use crate::metrics::{MetricsRecorder, PipelineMetrics, RequestLogEntry, RequestOutcome};
use crate::offline::{NetworkMonitor, OfflineQueue, QueuedRequest, ReplayOutcome};
use crate::rate_limit::RateLimiter;
use crate::request::RequestOptions;
use crate::response_cache::ResponseCache;
use crate::transport::{HttpRequest, Transport, TransportError};

/// Replay outcomes buffered per subscriber before the oldest are dropped.
pub const REPLAY_CHANNEL_CAPACITY: usize = 256;

/// Handle to a request pipeline. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct BatchItem {
    options: RequestOptions,
    reply: oneshot::Sender<ApiResult<Value>>,
}

#[derive(Debug)]
struct ClientInner {
    config: PipelineConfig,
    base_url: Url,
    transport: Arc<dyn Transport>,
    network: NetworkMonitor,
    limiter: RateLimiter,
    dedup: Deduplicator<Execution>,
    responses: ResponseCache,
    offline: OfflineQueue,
    replays: broadcast::Sender<ReplayOutcome>,
    batch: Mutex<BatchQueue<BatchItem>>,
    metrics: MetricsRecorder,
    tasks: TaskGroup,
}

/// Result of running one request through the retry loop.
#[derive(Debug, Clone)]
struct Execution {
    result: ApiResult<Value>,
    attempts: u32,
    status: Option<u16>,
    /// Lost connectivity mid-request and parked for replay.
    offline_queued: bool,
}

impl Execution {
    fn failed(error: ApiError, attempts: u32) -> Self {
        Self {
            result: Err(error),
            attempts,
            status: None,
            offline_queued: false,
        }
    }
}

/// How a logical request settled, for the log.
struct Settled {
    execution: Execution,
    cached: bool,
    deduplicated: bool,
}

impl Settled {
    fn executed(execution: Execution, deduplicated: bool) -> Self {
        Self {
            execution,
            cached: false,
            deduplicated,
        }
    }
}

fn offline_error() -> ApiError {
    ApiError::network("Network unavailable, request queued for replay")
}

impl ApiClient {
    /// Build a pipeline and start its network watcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create(
        config: PipelineConfig,
        transport: Arc<dyn Transport>,
        network: NetworkMonitor,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ConfigError::invalid("api_base_url", e.to_string()))?;
        let (replays, _) = broadcast::channel(REPLAY_CHANNEL_CAPACITY);
        let tasks = TaskGroup::new();

        let inner = Arc::new(ClientInner {
            base_url,
            transport,
            limiter: RateLimiter::with_shutdown(config.rate_limit, tasks.token()),
            dedup: Deduplicator::new(config.dedup_grace),
            responses: ResponseCache::new(config.response_cache),
            offline: OfflineQueue::new(),
            replays,
            batch: Mutex::new(BatchQueue::new(config.batch.max_batch_size)),
            metrics: MetricsRecorder::new(config.log_capacity),
            tasks,
            network: network.clone(),
            config,
        });

        inner.tasks.spawn(
            "offline-replay",
            watch_network(Arc::downgrade(&inner), network.subscribe()),
        );

        Ok(Self { inner })
    }

    /// Stop background work. Later requests fail as cancelled, and requests
    /// still queued, backing off or in flight stop with a cancelled error.
    pub fn dispose(&self) {
        self.inner.tasks.shutdown();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.tasks.is_shutdown()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    /// Run a request and decode its payload.
    pub async fn request<T: DeserializeOwned>(&self, options: RequestOptions) -> ApiResult<T> {
        let value = self.request_value(options).await?;
        decode_payload(value)
    }

    /// Run a request and return the unwrapped JSON payload.
    pub async fn request_value(&self, options: RequestOptions) -> ApiResult<Value> {
        self.inner.dispatch(options).await
    }

    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> ApiResult<T> {
        self.request(RequestOptions::get(url)).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, url: &str, body: &B) -> ApiResult<T> {
        self.request(RequestOptions::post(url, encode_body(body)?)).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, url: &str, body: &B) -> ApiResult<T> {
        self.request(RequestOptions::put(url, encode_body(body)?)).await
    }

    pub async fn patch<B: Serialize, T: DeserializeOwned>(&self, url: &str, body: &B) -> ApiResult<T> {
        self.request(RequestOptions::patch(url, encode_body(body)?)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, url: &str) -> ApiResult<T> {
        self.request(RequestOptions::delete(url)).await
    }

    /// Queue a request into the current batch.
    ///
    /// The batch runs when it reaches `max_batch_size` or when the batch
    /// window after its first request elapses, whichever comes first.
    pub async fn batched<T: DeserializeOwned>(&self, options: RequestOptions) -> ApiResult<T> {
        let (reply, settled) = oneshot::channel();
        let push = self.inner.batch().push(BatchItem { options, reply });

        match push {
            BatchPush::Flush => {
                let items = self.inner.batch().take();
                let inner = Arc::clone(&self.inner);
                self.inner
                    .tasks
                    .spawn("batch-flush", async move { inner.run_batch(items).await });
            }
            BatchPush::StartTimer { epoch } => {
                let inner = Arc::downgrade(&self.inner);
                let window = self.inner.config.batch.window;
                self.inner.tasks.spawn("batch-timer", async move {
                    tokio::time::sleep(window).await;
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    let items = inner.batch().take_epoch(epoch);
                    if let Some(items) = items {
                        inner.run_batch(items).await;
                    }
                });
            }
            BatchPush::Queued => {}
        }

        let value = settled.await.map_err(|_| ApiError::cancelled())??;
        decode_payload(value)
    }

    /// Run several requests concurrently, results in input order.
    pub async fn batch(&self, requests: Vec<RequestOptions>) -> Vec<ApiResult<Value>> {
        join_all(requests.into_iter().map(|options| self.inner.dispatch(options))).await
    }

    /// Outcomes of requests replayed after reconnecting.
    pub fn subscribe_replays(&self) -> broadcast::Receiver<ReplayOutcome> {
        self.inner.replays.subscribe()
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.inner.metrics.snapshot()
    }

    /// Most recent requests, oldest first.
    pub fn request_log(&self) -> Vec<RequestLogEntry> {
        self.inner.metrics.log()
    }

    pub fn clear_metrics(&self) {
        self.inner.metrics.clear();
    }

    pub fn clear_response_cache(&self) {
        self.inner.responses.clear();
    }

    pub fn offline_queue_len(&self) -> usize {
        self.inner.offline.len()
    }

    /// Distinct request identities currently registered for deduplication.
    pub fn in_flight(&self) -> usize {
        self.inner.dedup.len()
    }
}

fn encode_body<B: Serialize>(body: &B) -> ApiResult<Value> {
    serde_json::to_value(body).map_err(|e| {
        ApiError::new(
            ErrorCategory::Validation,
            format!("Failed to encode request body: {}", e),
        )
    })
}

fn decode_payload<T: DeserializeOwned>(value: Value) -> ApiResult<T> {
    serde_json::from_value(value)
        .map_err(|e| ApiError::unknown(format!("Failed to decode response payload: {}", e)))
}

impl ClientInner {
    fn batch(&self) -> MutexGuard<'_, BatchQueue<BatchItem>> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(self: &Arc<Self>, options: RequestOptions) -> ApiResult<Value> {
        let request_id = Uuid::now_v7().to_string();
        let started = Instant::now();
        let settled = self.settle(&request_id, &options).await;
        let execution = settled.execution;

        let outcome = match &execution.result {
            Ok(_) => RequestOutcome::Success,
            Err(_) if execution.offline_queued => RequestOutcome::OfflineQueued,
            Err(err) if err.is_cancelled() => RequestOutcome::Cancelled,
            Err(_) => RequestOutcome::Failure,
        };
        self.metrics.record(RequestLogEntry {
            request_id: request_id.clone(),
            method: options.method,
            url: options.url.clone(),
            status: execution.status,
            outcome,
            error: execution.result.as_ref().err().map(|err| err.category),
            attempts: execution.attempts,
            cached: settled.cached,
            deduplicated: settled.deduplicated,
            duration: started.elapsed(),
            timestamp: Utc::now(),
        });

        execution
            .result
            .map_err(|err| err.with_endpoint(options.endpoint()).with_request_id(request_id))
    }

    async fn settle(self: &Arc<Self>, request_id: &str, options: &RequestOptions) -> Settled {
        if options.is_cancelled() || self.tasks.is_shutdown() {
            return Settled::executed(Execution::failed(ApiError::cancelled(), 0), false);
        }

        if options.cache.enabled {
            if let Some(value) = self.responses.get(&options.cache_key()) {
                tracing::debug!(request_id, url = %options.url, "Response cache hit");
                return Settled {
                    execution: Execution {
                        result: Ok(value),
                        attempts: 0,
                        status: None,
                        offline_queued: false,
                    },
                    cached: true,
                    deduplicated: false,
                };
            }
        }

        if !self.network.is_online() {
            self.offline.enqueue(request_id, options.clone());
            return Settled::executed(
                Execution {
                    offline_queued: true,
                    ..Execution::failed(offline_error(), 0)
                },
                false,
            );
        }

        if !options.deduplicate {
            let execution = Arc::clone(self)
                .execute(request_id.to_string(), options.clone(), true)
                .await;
            return Settled::executed(execution, false);
        }

        let (shared, joined) = self.dedup.join_or_start(&options.dedup_key(), || {
            let inner = Arc::clone(self);
            let request_id = request_id.to_string();
            let mut options = options.clone();
            options.cancel = None;
            inner.execute(request_id, options, true).boxed()
        });
        if joined {
            tracing::debug!(request_id, url = %options.url, "Joined in-flight request");
        }

        let execution = match options.cancel.clone() {
            Some(cancel) => tokio::select! {
                execution = shared => execution,
                _ = cancel.cancelled() => Execution::failed(ApiError::cancelled(), 0),
            },
            None => shared.await,
        };
        Settled::executed(execution, joined)
    }

    /// The retry loop.
    ///
    /// With `park_when_offline`, a network failure while the monitor reads
    /// offline parks the request for replay instead of retrying it.
    async fn execute(
        self: Arc<Self>,
        request_id: String,
        options: RequestOptions,
        park_when_offline: bool,
    ) -> Execution {
        let policy = options
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        let cancel = options.cancel.clone().unwrap_or_default();
        let lifecycle = self.tasks.token();
        let stopped = || cancel.is_cancelled() || lifecycle.is_cancelled();
        let envelope = options.envelope.unwrap_or(self.config.envelope);
        let mut last_delay = Duration::ZERO;
        let mut attempt = 0u32;

        loop {
            if stopped() {
                return Execution::failed(ApiError::cancelled(), attempt);
            }
            match self.limiter.acquire(options.priority, &cancel).await {
                Ok(admission) if admission.was_queued() => self.metrics.record_rate_limited(),
                Ok(_) => {}
                Err(err) => return Execution::failed(err, attempt),
            }
            if stopped() {
                return Execution::failed(ApiError::cancelled(), attempt);
            }

            attempt += 1;
            let request = match self.build_request(&request_id, &options) {
                Ok(request) => request,
                Err(err) => return Execution::failed(err, attempt),
            };
            tracing::debug!(
                request_id = %request_id,
                method = %options.method,
                url = %request.url,
                attempt,
                "Sending request"
            );

            let (result, status) = tokio::select! {
                sent = self.send(request, envelope) => sent,
                _ = lifecycle.cancelled() => return Execution::failed(ApiError::cancelled(), attempt),
            };
            let err = match result {
                Ok(value) => {
                    if options.cache.enabled {
                        self.responses
                            .insert(&options.cache_key(), value.clone(), options.cache.ttl);
                    }
                    return Execution {
                        result: Ok(value),
                        attempts: attempt,
                        status,
                        offline_queued: false,
                    };
                }
                Err(err) => err,
            };

            if park_when_offline
                && err.category == ErrorCategory::Network
                && !self.network.is_online()
            {
                tracing::warn!(request_id = %request_id, error = %err, "Connectivity lost, request queued for replay");
                self.offline.enqueue(request_id.clone(), options.clone());
                return Execution {
                    result: Err(err),
                    attempts: attempt,
                    status,
                    offline_queued: true,
                };
            }

            if attempt >= policy.max_attempts || !policy.should_retry(&err) {
                tracing::warn!(
                    request_id = %request_id,
                    url = %options.url,
                    attempt,
                    error = %err,
                    "Request failed"
                );
                return Execution {
                    result: Err(err),
                    attempts: attempt,
                    status,
                    offline_queued: false,
                };
            }

            // Delays never shrink, even when jitter rolls low.
            let delay = policy.delay_for(attempt).max(last_delay);
            last_delay = delay;
            tracing::debug!(
                request_id = %request_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying request"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Execution::failed(ApiError::cancelled(), attempt),
                _ = lifecycle.cancelled() => return Execution::failed(ApiError::cancelled(), attempt),
            }
        }
    }

    fn build_request(&self, request_id: &str, options: &RequestOptions) -> ApiResult<HttpRequest> {
        let mut url = self.base_url.join(&options.url).map_err(|e| {
            ApiError::new(
                ErrorCategory::Validation,
                format!("Invalid request URL '{}': {}", options.url, e),
            )
        })?;
        if !options.params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (name, value) in &options.params {
                query.append_pair(name, value);
            }
        }

        let body = options
            .body
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| {
                ApiError::new(
                    ErrorCategory::Validation,
                    format!("Failed to encode request body: {}", e),
                )
            })?;

        let mut headers = vec![
            ("Accept".to_string(), "application/json".to_string()),
            ("X-Request-ID".to_string(), request_id.to_string()),
            ("X-Client-Version".to_string(), self.config.client_version.clone()),
        ];
        if let Some(token) = &self.config.bearer_token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        if body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        headers.extend(options.headers.iter().cloned());

        Ok(HttpRequest {
            method: options.method,
            url: url.to_string(),
            headers,
            body,
            timeout: options.timeout.unwrap_or(self.config.timeout),
        })
    }

    /// One transport round trip, classified and unwrapped.
    async fn send(
        &self,
        request: HttpRequest,
        envelope: EnvelopeMode,
    ) -> (ApiResult<Value>, Option<u16>) {
        let timeout = request.timeout;
        let response = match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Err(_) => return (Err(classify_transport(&TransportError::timeout(timeout))), None),
            Ok(Err(err)) => return (Err(classify_transport(&err)), None),
            Ok(Ok(response)) => response,
        };

        let status = response.status;
        if !response.is_success() {
            return (Err(classify_status(status, &response.body)), Some(status));
        }
        match envelope::decode(envelope, &response.body) {
            Ok(decoded) => {
                if let Some(correlation_id) = decoded.correlation_id {
                    tracing::trace!(correlation_id = %correlation_id, "Response received");
                }
                (Ok(decoded.data), Some(status))
            }
            Err(err) => (Err(err.with_status(status)), Some(status)),
        }
    }

    async fn run_batch(self: &Arc<Self>, items: Vec<BatchItem>) {
        tracing::debug!(size = items.len(), "Flushing request batch");
        join_all(items.into_iter().map(|item| async move {
            let result = self.dispatch(item.options).await;
            // The caller may have stopped waiting.
            let _ = item.reply.send(result);
        }))
        .await;
    }

    /// Resend parked requests in order while the network stays up.
    async fn replay_offline(self: &Arc<Self>) {
        let mut pending: VecDeque<QueuedRequest> = self.offline.drain().into();
        if pending.is_empty() {
            return;
        }
        tracing::debug!(count = pending.len(), "Replaying offline queue");

        while let Some(queued) = pending.pop_front() {
            if !self.network.is_online() {
                pending.push_front(queued);
                break;
            }

            let started = Instant::now();
            let execution = Arc::clone(self)
                .execute(queued.request_id.clone(), queued.options.clone(), false)
                .await;

            if let Err(err) = &execution.result {
                if err.category == ErrorCategory::Network && !self.network.is_online() {
                    tracing::warn!(request_id = %queued.request_id, "Still offline, replay paused");
                    pending.push_front(queued);
                    break;
                }
                tracing::warn!(request_id = %queued.request_id, error = %err, "Offline replay failed");
            }

            self.metrics.record(RequestLogEntry {
                request_id: queued.request_id.clone(),
                method: queued.options.method,
                url: queued.options.url.clone(),
                status: execution.status,
                outcome: match &execution.result {
                    Ok(_) => RequestOutcome::Success,
                    Err(err) if err.is_cancelled() => RequestOutcome::Cancelled,
                    Err(_) => RequestOutcome::Failure,
                },
                error: execution.result.as_ref().err().map(|err| err.category),
                attempts: execution.attempts,
                cached: false,
                deduplicated: false,
                duration: started.elapsed(),
                timestamp: Utc::now(),
            });

            // No subscribers is fine.
            let _ = self.replays.send(ReplayOutcome {
                request_id: queued.request_id,
                method: queued.options.method,
                url: queued.options.url,
                result: execution.result,
            });
        }

        if !pending.is_empty() {
            self.offline.requeue_front(pending.into());
        }
    }
}

/// Replay the offline queue on every offline-to-online transition.
async fn watch_network(client: Weak<ClientInner>, mut online: watch::Receiver<bool>) {
    let mut was_online = *online.borrow_and_update();
    while online.changed().await.is_ok() {
        let now_online = *online.borrow_and_update();
        if now_online && !was_online {
            let Some(inner) = client.upgrade() else {
                break;
            };
            inner.replay_offline().await;
        }
        was_online = now_online;
    }
}
