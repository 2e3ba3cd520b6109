//! Inkwell Test Utilities
//!
//! Shared test infrastructure for the Inkwell workspace:
//! - Proptest generators for cache keys, partitions and pipeline enums
//! - Fixtures that wire a cache manager or API client to in-memory doubles
//! - Tracing setup for tests

// Re-export test doubles from their source crates
pub use inkwell_client::{MockReply, MockTransport};
pub use inkwell_storage::MemoryStore;

// Re-export core types for convenience
pub use inkwell_core::{
    ApiError, ApiResult, ErrorCategory, HttpMethod, ManualClock, Priority, SharedClock,
};
pub use inkwell_storage::{CacheConfig, CacheManager, DurableStorage, EvictionStrategy, Partition};

pub use fixtures::*;
pub use generators::*;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Inkwell domain values.

    use super::*;
    use proptest::prelude::*;

    /// Cache keys shaped like the ones the dashboard issues.
    ///
    /// Keys never start with a partition prefix, so they stay valid under
    /// any [`Partition`].
    pub fn arb_cache_key() -> impl Strategy<Value = String> {
        let head = prop_oneof![
            Just("store-info"),
            Just("quota"),
            Just("posts"),
            Just("post"),
            Just("analytics"),
        ];
        (head, prop::collection::vec("[a-z0-9]{1,6}", 0..3)).prop_map(|(head, tail)| {
            let mut key = head.to_string();
            for segment in tail {
                key.push(':');
                key.push_str(&segment);
            }
            key
        })
    }

    pub fn arb_eviction_strategy() -> impl Strategy<Value = EvictionStrategy> {
        prop_oneof![
            Just(EvictionStrategy::Ttl),
            Just(EvictionStrategy::Lru),
            Just(EvictionStrategy::Lfu),
            Just(EvictionStrategy::Fifo),
        ]
    }

    pub fn arb_partition() -> impl Strategy<Value = Partition> {
        let id = "[a-z0-9]{1,6}";
        prop_oneof![
            Just(Partition::Global),
            id.prop_map(Partition::User),
            id.prop_map(Partition::Session),
            id.prop_map(Partition::Tenant),
        ]
    }

    pub fn arb_priority() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Medium),
            Just(Priority::High),
            Just(Priority::Critical),
        ]
    }

    pub fn arb_http_method() -> impl Strategy<Value = HttpMethod> {
        prop_oneof![
            Just(HttpMethod::Get),
            Just(HttpMethod::Post),
            Just(HttpMethod::Put),
            Just(HttpMethod::Patch),
            Just(HttpMethod::Delete),
        ]
    }

    pub fn arb_error_category() -> impl Strategy<Value = ErrorCategory> {
        prop::sample::select(ErrorCategory::ALL.to_vec())
    }

    /// Non-2xx HTTP status codes, weighted towards the ones servers send.
    pub fn arb_error_status() -> impl Strategy<Value = u16> {
        prop_oneof![
            3 => prop::sample::select(vec![400u16, 401, 403, 404, 409, 422, 429, 500, 502, 503]),
            1 => 300u16..600,
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-wired components for tests.

    use super::*;
    use std::sync::{Arc, Once};
    use std::time::Duration;

    use inkwell_client::{ApiClient, NetworkMonitor, PipelineConfig, RetryPolicy};

    pub const TEST_BASE_URL: &str = "https://blog.example.com/";

    /// A minimal config file accepted by `ClientConfig::from_toml`.
    pub const MINIMAL_CLIENT_TOML: &str = r#"
        api_base_url = "https://blog.example.com/"
        client_version = "1.0.0-test"

        [auth]
        bearer_token = "test-token"
    "#;

    /// Pipeline settings with jitter disabled so retry timing is exact.
    pub fn pipeline_config() -> PipelineConfig {
        PipelineConfig::new(TEST_BASE_URL)
            .with_bearer_token("test-token")
            .with_client_version("1.0.0-test")
            .with_retry(RetryPolicy::default().with_jitter(Duration::ZERO))
    }

    /// A cache manager over a fresh [`MemoryStore`], driven by a manual clock.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn create_test_cache(config: CacheConfig) -> (CacheManager, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryStore::new());
        let cache = CacheManager::create(
            config,
            DurableStorage::from_store(store.clone()),
            clock.shared(),
            None,
        )
        .expect("test cache config must be valid");
        (cache, clock, store)
    }

    /// An online client talking to a [`MockTransport`].
    ///
    /// Must be called inside a Tokio runtime.
    pub fn create_test_client(config: PipelineConfig) -> (ApiClient, Arc<MockTransport>, NetworkMonitor) {
        let transport = Arc::new(MockTransport::new());
        let network = NetworkMonitor::new(true);
        let client = ApiClient::create(config, transport.clone(), network.clone())
            .expect("test pipeline config must be valid");
        (client, transport, network)
    }

    /// Install a test-friendly tracing subscriber once per process.
    ///
    /// Honors `RUST_LOG`, defaulting to `warn`.
    pub fn init_tracing() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_test_writer()
                .try_init();
        });
    }
}
