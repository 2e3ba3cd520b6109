use std::sync::Arc;
use std::time::Duration;

use inkwell_core::ManualClock;
use inkwell_storage::{CacheConfig, CacheManager, DurableStorage, MemoryStore, Partition};
use inkwell_test_utils::{arb_cache_key, arb_eviction_strategy, arb_partition};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn create_cache(config: CacheConfig, store: Arc<MemoryStore>, clock: &ManualClock) -> CacheManager {
    CacheManager::create(config, DurableStorage::from_store(store), clock.shared(), None)
        .expect("valid config")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn eviction_never_exceeds_budget(
        strategy in arb_eviction_strategy(),
        max_size in 64u64..512,
        writes in prop::collection::vec((arb_cache_key(), 2usize..200, 1u64..30), 1..60),
        reads in prop::collection::vec(arb_cache_key(), 0..20),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let clock = ManualClock::starting_now();
            let store = Arc::new(MemoryStore::new());
            let config = CacheConfig::new().with_strategy(strategy).with_max_size(max_size);
            let cache = create_cache(config, store, &clock);

            for (i, (key, len, ttl_secs)) in writes.iter().enumerate() {
                let payload = "x".repeat(*len);
                cache.set(key, &payload, Some(Duration::from_secs(*ttl_secs))).await;
                clock.advance(Duration::from_millis(700));
                if let Some(read) = reads.get(i) {
                    let _ = cache.get::<String>(read).await;
                }
                prop_assert!(cache.size() <= max_size);
                prop_assert_eq!(cache.metrics().total_size, cache.size());
            }
            Ok(())
        })?;
    }

    #[test]
    fn set_then_get_round_trips_before_expiry(
        key in arb_cache_key(),
        title in "[a-zA-Z0-9 ]{0,40}",
        views in any::<u32>(),
        ttl_secs in 1u64..3600,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let clock = ManualClock::starting_now();
            let cache = create_cache(CacheConfig::new(), Arc::new(MemoryStore::new()), &clock);
            let data = serde_json::json!({ "title": title, "views": views });

            prop_assert!(cache.set(&key, &data, Some(Duration::from_secs(ttl_secs))).await);
            clock.advance(Duration::from_secs(ttl_secs - 1));
            prop_assert_eq!(cache.get::<serde_json::Value>(&key).await, Some(data));

            clock.advance(Duration::from_secs(1));
            prop_assert!(cache.get::<serde_json::Value>(&key).await.is_none());
            Ok(())
        })?;
    }

    #[test]
    fn partitions_never_see_each_other(
        a in arb_partition(),
        b in arb_partition(),
        key in arb_cache_key(),
    ) {
        prop_assume!(a != b);
        let rt = runtime();
        rt.block_on(async {
            let clock = ManualClock::starting_now();
            let store = Arc::new(MemoryStore::new());
            let first = create_cache(CacheConfig::new().with_partition(a.clone()), store.clone(), &clock);
            let second = create_cache(CacheConfig::new().with_partition(b.clone()), store, &clock);

            first.set(&key, &1u8, None).await;
            prop_assert_eq!(second.get::<u8>(&key).await, None);
            prop_assert_eq!(first.get::<u8>(&key).await, Some(1));
            Ok(())
        })?;
    }

    #[test]
    fn partitioned_key_strips_back_to_local(partition in arb_partition(), key in arb_cache_key()) {
        let scoped = partition.key(&key);
        prop_assert_eq!(scoped.local(), key.as_str());
        prop_assert!(partition.owns(scoped.as_str()));
        if partition != Partition::Global {
            prop_assert!(!Partition::Global.owns(scoped.as_str()));
        }
    }
}
