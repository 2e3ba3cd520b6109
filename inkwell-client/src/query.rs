//! Cached queries: the layered cache in front of a fetcher.
//!
//! [`CachedQuery::fetch`] serves a query from the [`CacheManager`] when it
//! can and runs the fetcher when it cannot. Entries older than the query's
//! stale time are still served while stale-while-revalidate is on, and a
//! background refresh replaces them; refresh failures are logged and
//! dropped. Concurrent fetches of one key share a single fetcher run.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use inkwell_core::{ApiError, ApiResult, TaskGroup};
use inkwell_storage::{join_segments, CacheManager};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::client::ApiClient;
use crate::dedup::{Deduplicator, SharedOutcome};
use crate::request::RequestOptions;

/// Age after which a cached query is refreshed in the background.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);

/// A cache key built from `:`-joined segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(String);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(join_segments(segments))
    }

    pub fn store_info(shop: &str) -> Self {
        Self::new(["store-info", shop])
    }

    pub fn quota(shop: &str) -> Self {
        Self::new(["quota", shop])
    }

    pub fn posts(shop: &str, page: u32) -> Self {
        Self::new(["posts", shop, &page.to_string()])
    }

    pub fn post(shop: &str, post_id: &str) -> Self {
        Self::new(["post", shop, post_id])
    }

    pub fn analytics(shop: &str, range: &str) -> Self {
        Self::new(["analytics", shop, range])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueryKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// `None` uses the cache's default TTL.
    pub ttl: Option<Duration>,
    pub stale_time: Duration,
    pub stale_while_revalidate: bool,
    /// Keys invalidated together with this one.
    pub dependencies: Vec<String>,
    /// Skip the cache read and fetch now.
    pub force_refresh: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            stale_time: DEFAULT_STALE_TIME,
            stale_while_revalidate: true,
            dependencies: Vec::new(),
            force_refresh: false,
        }
    }
}

impl QueryOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn without_revalidation(mut self) -> Self {
        self.stale_while_revalidate = false;
        self
    }

    pub fn with_dependency(mut self, key: impl AsRef<str>) -> Self {
        self.dependencies.push(key.as_ref().to_string());
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CachedQuery {
    cache: CacheManager,
    inflight: Deduplicator<ApiResult<Value>>,
    tasks: Arc<TaskGroup>,
}

impl CachedQuery {
    pub fn new(cache: CacheManager) -> Self {
        Self {
            cache,
            inflight: Deduplicator::new(Duration::ZERO),
            tasks: Arc::new(TaskGroup::new()),
        }
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Cancel pending background refreshes. Fetches still running when this
    /// is called fail as cancelled and leave the cache untouched.
    pub fn dispose(&self) {
        self.tasks.shutdown();
    }

    /// Serve `key` from the cache, or run `fetcher` and cache its result.
    ///
    /// Fetch errors are returned and never cached.
    pub async fn fetch<T, F, Fut>(&self, key: &QueryKey, options: QueryOptions, fetcher: F) -> ApiResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
    {
        if !options.force_refresh {
            let hit = self.cache.get_with_metadata::<T>(key.as_str()).await;
            if let Some(hit) = hit {
                let stale = hit.age(self.cache.now()) >= options.stale_time;
                if stale
                    && options.stale_while_revalidate
                    && self.cache.config().stale_while_revalidate
                {
                    tracing::debug!(key = %key, "Serving stale query, refreshing in background");
                    self.revalidate(key, &options, fetcher);
                }
                return Ok(hit.value);
            }
        }

        let value = self.load(key, &options, fetcher).await?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::unknown(format!("Failed to decode query '{}': {}", key, e)))
    }

    /// [`fetch`](Self::fetch) with a pipeline request as the fetcher.
    pub async fn fetch_request<T>(
        &self,
        client: &ApiClient,
        key: &QueryKey,
        options: QueryOptions,
        request: RequestOptions,
    ) -> ApiResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let client = client.clone();
        self.fetch(key, options, move || async move { client.request::<T>(request).await })
            .await
    }

    /// Write a value directly, as if a fetch had returned it.
    pub async fn set_query_data<T: Serialize>(&self, key: &QueryKey, value: &T, options: &QueryOptions) -> bool {
        self.cache
            .set_with_dependencies(key.as_str(), value, options.ttl, &options.dependencies)
            .await
    }

    /// Drop a query and its dependencies from the cache.
    pub async fn invalidate(&self, key: &QueryKey) -> usize {
        self.cache.invalidate(key.as_str()).await
    }

    fn load<T, F, Fut>(&self, key: &QueryKey, options: &QueryOptions, fetcher: F) -> SharedOutcome<ApiResult<Value>>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
    {
        let cache = self.cache.clone();
        let cache_key = key.as_str().to_string();
        let ttl = options.ttl;
        let dependencies = options.dependencies.clone();
        let lifecycle = self.tasks.token();

        let (outcome, _) = self.inflight.join_or_start(key.as_str(), move || {
            async move {
                if lifecycle.is_cancelled() {
                    return Err(ApiError::cancelled());
                }
                let value = tokio::select! {
                    fetched = fetcher() => fetched?,
                    _ = lifecycle.cancelled() => return Err(ApiError::cancelled()),
                };
                let value = serde_json::to_value(&value).map_err(|e| {
                    ApiError::unknown(format!("Failed to encode query '{}': {}", cache_key, e))
                })?;
                if lifecycle.is_cancelled() {
                    tracing::debug!(key = %cache_key, "Query disposed, result not cached");
                    return Err(ApiError::cancelled());
                }
                cache
                    .set_with_dependencies(&cache_key, &value, ttl, &dependencies)
                    .await;
                Ok(value)
            }
            .boxed()
        });
        outcome
    }

    fn revalidate<T, F, Fut>(&self, key: &QueryKey, options: &QueryOptions, fetcher: F)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
    {
        let refresh = self.load(key, options, fetcher);
        let key = key.clone();
        self.tasks.spawn("query-revalidate", async move {
            if let Err(err) = refresh.await {
                tracing::warn!(key = %key, error = %err, "Background revalidation failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::offline::NetworkMonitor;
    use crate::transport::{MockReply, MockTransport};
    use inkwell_core::{ErrorCategory, ManualClock};
    use inkwell_storage::{CacheConfig, DurableStorage};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn query(clock: &ManualClock) -> CachedQuery {
        let cache = CacheManager::create(
            CacheConfig::new().with_cross_tab(false),
            DurableStorage::memory_only(),
            clock.shared(),
            None,
        )
        .unwrap();
        CachedQuery::new(cache)
    }

    fn counting_fetcher(
        calls: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> futures_util::future::BoxFuture<'static, ApiResult<u32>> + Send + 'static
    {
        let calls = Arc::clone(calls);
        move || {
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) as u32 + 1;
                Ok(n)
            }
            .boxed()
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_query_keys() {
        assert_eq!(QueryKey::store_info("acme").as_str(), "store-info:acme");
        assert_eq!(QueryKey::posts("acme", 2).as_str(), "posts:acme:2");
        assert_eq!(QueryKey::analytics("acme", "30d").to_string(), "analytics:acme:30d");
        assert_eq!(QueryKey::new(["a", "b", "c"]).as_str(), "a:b:c");
    }

    #[tokio::test]
    async fn test_fresh_hit_skips_fetcher() {
        let clock = ManualClock::starting_now();
        let query = query(&clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::quota("acme");

        let first: u32 = query.fetch(&key, QueryOptions::default(), counting_fetcher(&calls)).await.unwrap();
        let second: u32 = query.fetch(&key, QueryOptions::default(), counting_fetcher(&calls)).await.unwrap();
        assert_eq!((first, second), (1, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_served_then_refreshed() {
        let clock = ManualClock::starting_now();
        let query = query(&clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::store_info("acme");
        let options = QueryOptions::default().with_stale_time(Duration::from_secs(60));

        let _: u32 = query.fetch(&key, options.clone(), counting_fetcher(&calls)).await.unwrap();
        clock.advance(Duration::from_secs(61));

        let stale: u32 = query.fetch(&key, options.clone(), counting_fetcher(&calls)).await.unwrap();
        assert_eq!(stale, 1);

        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(query.cache().get::<u32>(key.as_str()).await, Some(2));
    }

    #[tokio::test]
    async fn test_stale_entry_without_revalidation_is_served_as_is() {
        let clock = ManualClock::starting_now();
        let query = query(&clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::quota("acme");
        let options = QueryOptions::default()
            .with_stale_time(Duration::from_secs(1))
            .without_revalidation();

        let _: u32 = query.fetch(&key, options.clone(), counting_fetcher(&calls)).await.unwrap();
        clock.advance(Duration::from_secs(5));
        let value: u32 = query.fetch(&key, options, counting_fetcher(&calls)).await.unwrap();
        settle().await;

        assert_eq!(value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_revalidation_keeps_stale_value() {
        let clock = ManualClock::starting_now();
        let query = query(&clock);
        let key = QueryKey::quota("acme");
        let options = QueryOptions::default().with_stale_time(Duration::from_secs(1));

        let _: u32 = query.fetch(&key, options.clone(), || async { Ok(7u32) }).await.unwrap();
        clock.advance(Duration::from_secs(2));

        let value: u32 = query
            .fetch(&key, options, || async { Err::<u32, _>(ApiError::server("down")) })
            .await
            .unwrap();
        settle().await;

        assert_eq!(value, 7);
        assert_eq!(query.cache().get::<u32>(key.as_str()).await, Some(7));
    }

    #[tokio::test]
    async fn test_dispose_discards_refresh_in_flight() {
        let clock = ManualClock::starting_now();
        let query = query(&clock);
        let key = QueryKey::quota("acme");
        let options = QueryOptions::default().with_stale_time(Duration::from_secs(1));

        let _: u32 = query.fetch(&key, options.clone(), || async { Ok(7u32) }).await.unwrap();
        clock.advance(Duration::from_secs(2));

        let (release, released) = tokio::sync::oneshot::channel::<()>();
        let value: u32 = query
            .fetch(&key, options, move || async move {
                let _ = released.await;
                Ok(8u32)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        settle().await;

        query.dispose();
        let _ = release.send(());
        settle().await;

        assert_eq!(query.cache().get::<u32>(key.as_str()).await, Some(7));
    }

    #[tokio::test]
    async fn test_disposed_query_does_not_fetch() {
        let clock = ManualClock::starting_now();
        let query = query(&clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::store_info("acme");
        query.dispose();

        let err = query
            .fetch::<u32, _, _>(&key, QueryOptions::default(), counting_fetcher(&calls))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(query.cache().get::<u32>(key.as_str()).await, None);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let clock = ManualClock::starting_now();
        let query = query(&clock);
        let key = QueryKey::posts("acme", 1);

        let err = query
            .fetch(&key, QueryOptions::default(), || async {
                Err::<u32, _>(ApiError::network("offline"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(query.cache().is_empty());
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let clock = ManualClock::starting_now();
        let query = query(&clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::quota("acme");

        let _: u32 = query.fetch(&key, QueryOptions::default(), counting_fetcher(&calls)).await.unwrap();
        let value: u32 = query
            .fetch(&key, QueryOptions::default().force_refresh(), counting_fetcher(&calls))
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_share_one_run() {
        let clock = ManualClock::starting_now();
        let query = query(&clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::analytics("acme", "7d");

        let slow = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!({"views": 10}))
            }
        };

        let (a, b) = tokio::join!(
            query.fetch::<Value, _, _>(&key, QueryOptions::default(), slow(calls.clone())),
            query.fetch::<Value, _, _>(&key, QueryOptions::default(), slow(calls.clone())),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_follows_dependencies() {
        let clock = ManualClock::starting_now();
        let query = query(&clock);
        let posts = QueryKey::posts("acme", 1);
        let quota = QueryKey::quota("acme");

        let _: u32 = query.fetch(&posts, QueryOptions::default(), || async { Ok(1u32) }).await.unwrap();
        let _: u32 = query
            .fetch(&quota, QueryOptions::default().with_dependency(&posts), || async { Ok(2u32) })
            .await
            .unwrap();

        assert_eq!(query.invalidate(&quota).await, 2);
        assert!(query.cache().is_empty());
    }

    #[tokio::test]
    async fn test_set_query_data() {
        let clock = ManualClock::starting_now();
        let query = query(&clock);
        let key = QueryKey::store_info("acme");
        assert!(query.set_query_data(&key, &json!({"plan": "pro"}), &QueryOptions::default()).await);

        let value: Value = query
            .fetch(&key, QueryOptions::default(), || async { Ok(json!(null)) })
            .await
            .unwrap();
        assert_eq!(value, json!({"plan": "pro"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_request_goes_through_pipeline() {
        let clock = ManualClock::starting_now();
        let query = query(&clock);
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(MockReply::enveloped(json!({"remaining": 4})));
        let client = ApiClient::create(
            PipelineConfig::new("https://blog.example.com/"),
            mock.clone(),
            NetworkMonitor::new(true),
        )
        .unwrap();
        let key = QueryKey::quota("acme");

        for _ in 0..2 {
            let value: Value = query
                .fetch_request(&client, &key, QueryOptions::default(), RequestOptions::get("/api-router/quota"))
                .await
                .unwrap();
            assert_eq!(value, json!({"remaining": 4}));
        }
        assert_eq!(mock.call_count(), 1);
    }
}
