//! Pipeline counters and the bounded request log.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use inkwell_core::{ErrorCategory, HttpMethod};
use serde::Serialize;

/// Entries kept by the request log before the oldest are dropped.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// How a logical request settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Success,
    Failure,
    Cancelled,
    /// Rejected while offline and parked for replay.
    OfflineQueued,
}

/// One row of the request log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestLogEntry {
    pub request_id: String,
    pub method: HttpMethod,
    pub url: String,
    pub status: Option<u16>,
    pub outcome: RequestOutcome,
    pub error: Option<ErrorCategory>,
    /// Transport attempts made. Zero for cache hits and offline rejections.
    pub attempts: u32,
    pub cached: bool,
    pub deduplicated: bool,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl RequestLogEntry {
    /// `METHOD url`, the per-endpoint metrics key.
    pub fn endpoint(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EndpointMetrics {
    pub count: u64,
    pub success: u64,
    pub failure: u64,
    /// Running mean over every request to the endpoint.
    pub average_latency: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// Served from the response cache.
    pub cached: u64,
    /// Joined another caller's in-flight execution.
    pub deduplicated: u64,
    /// Extra attempts after a first failure.
    pub retried: u64,
    /// Admissions that had to wait for the rate limiter.
    pub rate_limited: u64,
    pub offline_queued: u64,
    pub average_latency: Duration,
    pub endpoints: BTreeMap<String, EndpointMetrics>,
}

impl PipelineMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successful as f64 / self.total as f64
        }
    }
}

fn running_mean(mean: Duration, sample: Duration, count: u64) -> Duration {
    if count == 0 {
        return sample;
    }
    let mean = mean.as_nanos() as i128;
    let next = mean + (sample.as_nanos() as i128 - mean) / i128::from(count);
    Duration::from_nanos(next.clamp(0, i128::from(u64::MAX)) as u64)
}

/// Ring buffer of the most recent requests.
#[derive(Debug, Clone)]
pub struct RequestLog {
    entries: VecDeque<RequestLogEntry>,
    capacity: usize,
}

impl Default for RequestLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl RequestLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: RequestLogEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<RequestLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Thread-safe owner of the metrics and the log.
#[derive(Debug)]
pub struct MetricsRecorder {
    metrics: Mutex<PipelineMetrics>,
    log: Mutex<RequestLog>,
}

impl MetricsRecorder {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            metrics: Mutex::new(PipelineMetrics::default()),
            log: Mutex::new(RequestLog::with_capacity(log_capacity)),
        }
    }

    fn metrics_mut(&self) -> MutexGuard<'_, PipelineMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_mut(&self) -> MutexGuard<'_, RequestLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold a settled request into the counters and append it to the log.
    pub fn record(&self, entry: RequestLogEntry) {
        {
            let mut metrics = self.metrics_mut();
            metrics.total += 1;
            match entry.outcome {
                RequestOutcome::Success => metrics.successful += 1,
                RequestOutcome::Failure | RequestOutcome::Cancelled => metrics.failed += 1,
                RequestOutcome::OfflineQueued => {
                    metrics.failed += 1;
                    metrics.offline_queued += 1;
                }
            }
            if entry.cached {
                metrics.cached += 1;
            }
            if entry.deduplicated {
                metrics.deduplicated += 1;
            }
            // Joiners share the starter's attempts; count them once.
            if !entry.deduplicated {
                metrics.retried += u64::from(entry.attempts.saturating_sub(1));
            }
            metrics.average_latency =
                running_mean(metrics.average_latency, entry.duration, metrics.total);

            let endpoint = metrics.endpoints.entry(entry.endpoint()).or_default();
            endpoint.count += 1;
            if entry.outcome == RequestOutcome::Success {
                endpoint.success += 1;
            } else {
                endpoint.failure += 1;
            }
            endpoint.average_latency =
                running_mean(endpoint.average_latency, entry.duration, endpoint.count);
        }
        self.log_mut().push(entry);
    }

    pub fn record_rate_limited(&self) {
        self.metrics_mut().rate_limited += 1;
    }

    pub fn snapshot(&self) -> PipelineMetrics {
        self.metrics_mut().clone()
    }

    pub fn log(&self) -> Vec<RequestLogEntry> {
        self.log_mut().entries()
    }

    pub fn clear(&self) {
        *self.metrics_mut() = PipelineMetrics::default();
        self.log_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, outcome: RequestOutcome, millis: u64) -> RequestLogEntry {
        RequestLogEntry {
            request_id: format!("req-{}", millis),
            method: HttpMethod::Get,
            url: url.to_string(),
            status: Some(200),
            outcome,
            error: None,
            attempts: 1,
            cached: false,
            deduplicated: false,
            duration: Duration::from_millis(millis),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_counters_and_average() {
        let recorder = MetricsRecorder::new(10);
        recorder.record(entry("/a", RequestOutcome::Success, 100));
        recorder.record(entry("/a", RequestOutcome::Failure, 300));
        recorder.record(RequestLogEntry {
            attempts: 3,
            ..entry("/b", RequestOutcome::Success, 200)
        });

        let metrics = recorder.snapshot();
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.successful, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.retried, 2);
        assert_eq!(metrics.average_latency, Duration::from_millis(200));

        let a = &metrics.endpoints["GET /a"];
        assert_eq!((a.count, a.success, a.failure), (2, 1, 1));
        assert_eq!(a.average_latency, Duration::from_millis(200));
    }

    #[test]
    fn test_shared_execution_retries_counted_once() {
        let recorder = MetricsRecorder::new(10);
        recorder.record(RequestLogEntry {
            attempts: 3,
            ..entry("/a", RequestOutcome::Success, 100)
        });
        recorder.record(RequestLogEntry {
            attempts: 3,
            deduplicated: true,
            ..entry("/a", RequestOutcome::Success, 100)
        });

        let metrics = recorder.snapshot();
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.deduplicated, 1);
        assert_eq!(metrics.retried, 2);
    }

    #[test]
    fn test_offline_counts_as_failure() {
        let recorder = MetricsRecorder::new(10);
        recorder.record(RequestLogEntry {
            attempts: 0,
            ..entry("/a", RequestOutcome::OfflineQueued, 0)
        });
        let metrics = recorder.snapshot();
        assert_eq!(metrics.offline_queued, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.retried, 0);
    }

    #[test]
    fn test_log_is_bounded() {
        let recorder = MetricsRecorder::new(DEFAULT_LOG_CAPACITY);
        for i in 0..(DEFAULT_LOG_CAPACITY as u64 + 5) {
            recorder.record(entry("/a", RequestOutcome::Success, i));
        }
        let log = recorder.log();
        assert_eq!(log.len(), DEFAULT_LOG_CAPACITY);
        assert_eq!(log[0].request_id, "req-5");
    }

    #[test]
    fn test_clear() {
        let recorder = MetricsRecorder::new(10);
        recorder.record(entry("/a", RequestOutcome::Success, 10));
        recorder.record_rate_limited();
        recorder.clear();
        assert_eq!(recorder.snapshot(), PipelineMetrics::default());
        assert!(recorder.log().is_empty());
    }
}
