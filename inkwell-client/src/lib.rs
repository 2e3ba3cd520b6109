//! Inkwell Client - the request pipeline and cached queries.
//!
//! [`ApiClient`] wraps every outbound call with request identity headers,
//! response envelope decoding, error classification, retry with backoff,
//! deduplication, priority scheduling under a rate limit, batching and an
//! offline resend queue. [`CachedQuery`] puts the layered
//! [`CacheManager`](inkwell_storage::CacheManager) in front of any fetcher,
//! with stale-while-revalidate refresh.
//!
//! ```ignore
//! let network = NetworkMonitor::new(true);
//! let transport = Arc::new(ReqwestTransport::new(config.timeout)?);
//! let client = ApiClient::create(config, transport, network.clone())?;
//!
//! let posts: Vec<Post> = client
//!     .request(RequestOptions::get("/posts-api/articles").with_param("page", 1))
//!     .await?;
//! ```

pub mod batch;
pub mod classify;
pub mod client;
pub mod config;
pub mod dedup;
pub mod envelope;
pub mod metrics;
pub mod offline;
pub mod query;
pub mod rate_limit;
pub mod request;
pub mod response_cache;
pub mod retry;
pub mod transport;

pub use batch::BatchConfig;
pub use classify::{classify_status, classify_transport};
pub use client::ApiClient;
pub use config::{ClientConfig, ConfigLoadError, PipelineConfig};
pub use envelope::{Envelope, EnvelopeMode};
pub use metrics::{EndpointMetrics, PipelineMetrics, RequestLogEntry, RequestOutcome};
pub use offline::{NetworkMonitor, ReplayOutcome};
pub use query::{CachedQuery, QueryKey, QueryOptions};
pub use rate_limit::{Admission, RateLimitConfig, RateLimiter};
pub use request::{RequestCachePolicy, RequestOptions};
pub use response_cache::ResponseCacheConfig;
pub use retry::RetryPolicy;
pub use transport::{
    HttpRequest, HttpResponse, MockReply, MockTransport, ReqwestTransport, Transport,
    TransportError, TransportErrorKind,
};
