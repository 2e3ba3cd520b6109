//! Per-call request options.

use std::collections::BTreeMap;
use std::time::Duration;

use inkwell_core::{HttpMethod, Priority};
use reqwest::Url;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::envelope::EnvelopeMode;
use crate::retry::RetryPolicy;

/// Scratch base for form-encoding parameters.
const QUERY_ENCODING_BASE: &str = "http://localhost/";

/// Response-cache behavior for one request. Off unless enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCachePolicy {
    pub enabled: bool,
    /// `None` uses the pipeline's default TTL.
    pub ttl: Option<Duration>,
    /// Explicit cache key instead of the derived request identity.
    pub key: Option<String>,
}

/// Everything the pipeline needs to run one logical request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: HttpMethod,
    /// Path relative to the base URL, or an absolute URL.
    pub url: String,
    /// Query parameters, kept sorted so identical requests share a key.
    pub params: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub priority: Priority,
    /// Overrides the pipeline's retry policy.
    pub retry: Option<RetryPolicy>,
    pub cache: RequestCachePolicy,
    pub deduplicate: bool,
    pub cancel: Option<CancellationToken>,
    /// Overrides the pipeline's envelope mode.
    pub envelope: Option<EnvelopeMode>,
    /// Overrides the pipeline's timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: BTreeMap::new(),
            body: None,
            headers: Vec::new(),
            priority: Priority::default(),
            retry: None,
            cache: RequestCachePolicy::default(),
            deduplicate: true,
            cancel: None,
            envelope: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, url).with_body(body)
    }

    pub fn put(url: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Put, url).with_body(body)
    }

    pub fn patch(url: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Patch, url).with_body(body)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Serve from and fill the response cache. `None` keeps the default TTL.
    pub fn with_cache(mut self, ttl: Option<Duration>) -> Self {
        self.cache.enabled = true;
        self.cache.ttl = ttl;
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache.enabled = true;
        self.cache.key = Some(key.into());
        self
    }

    pub fn without_dedup(mut self) -> Self {
        self.deduplicate = false;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_envelope(mut self, mode: EnvelopeMode) -> Self {
        self.envelope = Some(mode);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// The URL with its query string, as given (not yet joined to a base).
    pub fn path_and_query(&self) -> String {
        if self.params.is_empty() {
            return self.url.clone();
        }
        // Encoded exactly as the query is sent, so distinct params never collide.
        let query = Url::parse_with_params(QUERY_ENCODING_BASE, &self.params)
            .ok()
            .and_then(|url| url.query().map(str::to_string))
            .unwrap_or_default();
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, separator, query)
    }

    /// `METHOD url`, used for per-endpoint metrics and error context.
    pub fn endpoint(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    /// Identity of the request: method, URL with parameters, and body hash.
    pub fn dedup_key(&self) -> String {
        format!(
            "{} {}#{}",
            self.method,
            self.path_and_query(),
            self.body_digest()
        )
    }

    /// Response-cache key: the explicit key if one was set, else the identity.
    pub fn cache_key(&self) -> String {
        self.cache.key.clone().unwrap_or_else(|| self.dedup_key())
    }

    fn body_digest(&self) -> String {
        match &self.body {
            None => "-".to_string(),
            Some(body) => {
                let mut hasher = Sha256::new();
                hasher.update(body.to_string().as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    }
}
