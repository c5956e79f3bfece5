//! Durable Tier Degradation Tests
//!
//! **Property: Degradation**
//!
//! With the durable backend unreachable, `get_or_produce` keeps returning
//! correct values through the ephemeral tier and direct production, and no
//! storage error reaches the caller.

use std::sync::Arc;
use std::time::Duration;

use cachified_test_utils::{
    CacheEntry, CacheMetadata, Cachified, Clock, DurableStore, FailingStore, ManualClock,
    SequencedProducer, Ttl,
};

fn degraded_cache(store: &Arc<FailingStore>, clock: &Arc<ManualClock>) -> Cachified {
    let store: Arc<dyn DurableStore> = store.clone();
    let clock: Arc<dyn Clock> = clock.clone();
    Cachified::builder()
        .store(store)
        .clock(clock)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_values_served_while_durable_tier_is_down() {
    let store = Arc::new(FailingStore::new());
    let clock = Arc::new(ManualClock::at_millis(0));
    let cache = degraded_cache(&store, &clock);
    let producer = SequencedProducer::new(vec!["v1".to_string(), "v2".to_string()]);
    let policy = || producer.policy().with_ttl(Duration::from_secs(60));

    assert_eq!(cache.get_or_produce("k", policy()).await.unwrap(), "v1");
    assert!(cache.durable().is_degraded());
    assert!(cache.stats().durable_degraded);

    // ephemeral tier still answers
    assert_eq!(cache.get_or_produce("k", policy()).await.unwrap(), "v1");
    assert_eq!(producer.calls(), 1);

    // once expired, production continues without the durable tier
    clock.set_millis(120_000);
    assert_eq!(cache.get_or_produce("k", policy()).await.unwrap(), "v2");
    assert_eq!(producer.calls(), 2);
}

#[tokio::test]
async fn test_recovery_clears_degraded_flag() {
    let store = Arc::new(FailingStore::new());
    let clock = Arc::new(ManualClock::at_millis(0));
    let cache = degraded_cache(&store, &clock);

    let entry = CacheEntry::new(
        "v".to_string(),
        CacheMetadata::new(cache.now(), Ttl::Infinite, Duration::ZERO),
    );
    cache.set_entry("k", entry).await;
    assert!(cache.durable().is_degraded());

    store.set_failing(false);
    cache.set_entry(
        "k",
        CacheEntry::new(
            "v".to_string(),
            CacheMetadata::new(cache.now(), Ttl::Infinite, Duration::ZERO),
        ),
    )
    .await;
    assert!(!cache.durable().is_degraded());
    assert_eq!(cache.list_keys(10).await.unwrap(), vec!["k".to_string()]);
}

#[tokio::test]
async fn test_operator_listing_reports_backend_errors() {
    let store = Arc::new(FailingStore::new());
    let clock = Arc::new(ManualClock::at_millis(0));
    let cache = degraded_cache(&store, &clock);

    assert!(cache.list_keys(10).await.is_err());
    assert!(cache.search_keys("k", 10).await.is_err());
}

#[tokio::test]
async fn test_delete_and_get_entry_survive_outage() {
    let store = Arc::new(FailingStore::new());
    let clock = Arc::new(ManualClock::at_millis(0));
    let cache = degraded_cache(&store, &clock);

    cache
        .set_entry(
            "k",
            CacheEntry::new(7u32, CacheMetadata::new(cache.now(), Ttl::Infinite, Duration::ZERO)),
        )
        .await;
    assert_eq!(cache.get_entry::<u32>("k").await.unwrap().value, 7);

    cache.delete("k").await;
    assert!(cache.get_entry::<u32>("k").await.is_none());
    assert!(store.attempts() >= 3);
}
