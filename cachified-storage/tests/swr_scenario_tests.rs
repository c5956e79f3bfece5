//! Stale-While-Revalidate Lifecycle Tests
//!
//! **Property: Freshness windows**
//!
//! - Before `created_at + ttl` the stored value is returned without calling
//!   the producer.
//! - Inside the stale window the stored value is returned immediately and at
//!   most one background refresh runs per key.
//! - After `created_at + ttl + swr` the caller waits for the producer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cachified_test_utils::{
    arb_cache_key, failing_policy, Cachified, CachePolicy, Clock, ManualClock, SequencedProducer,
    Ttl,
};
use proptest::prelude::*;

fn cache_with_clock(clock: &Arc<ManualClock>) -> Cachified {
    let clock: Arc<dyn Clock> = clock.clone();
    Cachified::builder()
        .ephemeral_capacity(64)
        .clock(clock)
        .build()
        .unwrap()
}

fn scenario_policy(producer: &SequencedProducer<String>) -> CachePolicy<String> {
    producer
        .policy()
        .with_ttl(Duration::from_millis(1000))
        .with_swr(Duration::from_millis(4000))
}

// ============================================================================
// SCENARIO
// ============================================================================

#[tokio::test]
async fn test_ttl_1000_swr_4000_lifecycle() {
    let clock = Arc::new(ManualClock::at_millis(0));
    let cache = cache_with_clock(&clock);
    let producer = SequencedProducer::new(vec![
        "v1".to_string(),
        "v2".to_string(),
        "v3".to_string(),
    ]);

    // t=0: produced
    let value = cache.get_or_produce("k", scenario_policy(&producer)).await.unwrap();
    assert_eq!(value, "v1");
    assert_eq!(producer.calls(), 1);

    // t=500: fresh, no producer call
    clock.set_millis(500);
    let value = cache.get_or_produce("k", scenario_policy(&producer)).await.unwrap();
    assert_eq!(value, "v1");
    assert_eq!(producer.calls(), 1);

    // t=1500: stale value served, refresh in the background
    clock.set_millis(1500);
    let value = cache.get_or_produce("k", scenario_policy(&producer)).await.unwrap();
    assert_eq!(value, "v1");
    cache.drain_background().await;
    assert_eq!(producer.calls(), 2);

    // t=1600: the refreshed value
    clock.set_millis(1600);
    let value = cache.get_or_produce("k", scenario_policy(&producer)).await.unwrap();
    assert_eq!(value, "v2");
    assert_eq!(producer.calls(), 2);

    // v2 was created at 1500 and is fully expired from 6500 on
    clock.set_millis(6500);
    let value = cache.get_or_produce("k", scenario_policy(&producer)).await.unwrap();
    assert_eq!(value, "v3");
    assert_eq!(producer.calls(), 3);

    let stats = cache.stats();
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.ephemeral_hits, 2);
    assert_eq!(stats.stale_served, 1);
    assert_eq!(stats.refreshes_started, 1);
}

#[tokio::test(start_paused = true)]
async fn test_one_refresh_per_stale_window() {
    let clock = Arc::new(ManualClock::at_millis(0));
    let cache = cache_with_clock(&clock);
    let producer = SequencedProducer::new(vec!["v1".to_string(), "v2".to_string()])
        .with_delay(Duration::from_millis(100));

    cache.get_or_produce("k", scenario_policy(&producer)).await.unwrap();
    clock.set_millis(2000);

    for _ in 0..5 {
        let value = cache.get_or_produce("k", scenario_policy(&producer)).await.unwrap();
        assert_eq!(value, "v1");
    }
    cache.drain_background().await;

    assert_eq!(producer.calls(), 2);
    let stats = cache.stats();
    assert_eq!(stats.refreshes_started, 1);
    assert_eq!(stats.refreshes_skipped, 4);
    assert_eq!(stats.stale_served, 5);
}

#[tokio::test]
async fn test_failed_refresh_keeps_serving_stale() {
    let clock = Arc::new(ManualClock::at_millis(0));
    let cache = cache_with_clock(&clock);
    let producer = SequencedProducer::new(vec!["v1".to_string()]);
    cache.get_or_produce("k", scenario_policy(&producer)).await.unwrap();

    clock.set_millis(1500);
    let calls = Arc::new(AtomicUsize::new(0));
    let failing = failing_policy::<String>("upstream down", Arc::clone(&calls))
        .with_ttl(Duration::from_millis(1000))
        .with_swr(Duration::from_millis(4000));
    let value = cache.get_or_produce("k", failing.clone()).await.unwrap();
    assert_eq!(value, "v1");
    cache.drain_background().await;
    assert_eq!(cache.stats().refresh_failures, 1);

    // still inside the stale window of the original entry
    clock.set_millis(2000);
    assert_eq!(cache.get_or_produce("k", failing).await.unwrap(), "v1");
    cache.drain_background().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_infinite_ttl_never_refreshes() {
    let clock = Arc::new(ManualClock::at_millis(0));
    let cache = cache_with_clock(&clock);
    let producer = SequencedProducer::new(vec![1u64, 2]);

    let policy = || producer.policy().with_ttl(Ttl::Infinite);
    assert_eq!(cache.get_or_produce("k", policy()).await.unwrap(), 1);
    // ten years later
    clock.set_millis(315_360_000_000);
    assert_eq!(cache.get_or_produce("k", policy()).await.unwrap(), 1);
    assert_eq!(producer.calls(), 1);
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_window_decides_producer_calls(
        key in arb_cache_key(),
        ttl in 1u64..10_000,
        swr in 0u64..10_000,
        elapsed in 0u64..25_000,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TestCaseError::fail(e.to_string()))?;

        runtime.block_on(async {
            let clock = Arc::new(ManualClock::at_millis(0));
            let cache = cache_with_clock(&clock);
            let producer = SequencedProducer::new(vec!["first".to_string(), "second".to_string()]);
            let policy = || {
                producer
                    .policy()
                    .with_ttl(Duration::from_millis(ttl))
                    .with_swr(Duration::from_millis(swr))
            };

            cache.get_or_produce(&key, policy()).await.unwrap();
            clock.set_millis(elapsed as i64);
            let value = cache.get_or_produce(&key, policy()).await.unwrap();
            let calls_before_drain = producer.calls();
            cache.drain_background().await;

            if elapsed < ttl {
                prop_assert_eq!(value, "first");
                prop_assert_eq!(producer.calls(), 1);
            } else if elapsed < ttl + swr {
                prop_assert_eq!(value, "first");
                prop_assert_eq!(producer.calls(), 2);
            } else {
                prop_assert_eq!(value, "second");
                prop_assert_eq!(calls_before_drain, 2);
                prop_assert_eq!(producer.calls(), 2);
            }
            Ok(())
        })?;
    }
}
