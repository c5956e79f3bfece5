//! Concurrency Tests
//!
//! Per-key population is single-flight within a process, and the deadline
//! variant hands back the fallback without cancelling the lookup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cachified_test_utils::{
    failing_policy, CacheError, Cachified, ManualClock, SequencedProducer,
};

fn cache() -> Cachified {
    Cachified::builder()
        .clock(Arc::new(ManualClock::at_millis(0)))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_share_one_production() {
    let cache = cache();
    let producer = SequencedProducer::new(vec!["v1".to_string(), "v2".to_string()])
        .with_delay(Duration::from_millis(50));
    let policy = || producer.policy().with_ttl(Duration::from_secs(60));

    let (a, b, c) = tokio::join!(
        cache.get_or_produce("k", policy()),
        cache.get_or_produce("k", policy()),
        cache.get_or_produce("k", policy()),
    );

    assert_eq!(a.unwrap(), "v1");
    assert_eq!(b.unwrap(), "v1");
    assert_eq!(c.unwrap(), "v1");
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_reuse_value_that_is_born_stale() {
    let cache = cache();
    let producer = SequencedProducer::new(vec!["v1".to_string(), "v2".to_string()])
        .with_delay(Duration::from_millis(50));
    let policy = || {
        producer
            .policy()
            .with_ttl(Duration::ZERO)
            .with_swr(Duration::from_secs(60))
    };

    let (a, b, c) = tokio::join!(
        cache.get_or_produce("k", policy()),
        cache.get_or_produce("k", policy()),
        cache.get_or_produce("k", policy()),
    );

    assert_eq!(a.unwrap(), "v1");
    assert_eq!(b.unwrap(), "v1");
    assert_eq!(c.unwrap(), "v1");
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_different_keys_produce_independently() {
    let cache = cache();
    let producer =
        SequencedProducer::new(vec![1u32, 2, 3]).with_delay(Duration::from_millis(50));
    let policy = || producer.policy().with_ttl(Duration::from_secs(60));

    let (a, b) = tokio::join!(
        cache.get_or_produce("a", policy()),
        cache.get_or_produce("b", policy()),
    );

    let mut values = vec![a.unwrap(), b.unwrap()];
    values.sort_unstable();
    assert_eq!(values, vec![1, 2]);
    assert_eq!(producer.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_spawned_callers_see_one_value() {
    let cache = cache();
    let producer = SequencedProducer::new((0..64).map(|i| format!("v{}", i)).collect())
        .with_delay(Duration::from_millis(20));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        let policy = producer.policy().with_ttl(Duration::from_secs(60));
        handles.push(tokio::spawn(async move {
            cache.get_or_produce("shared", policy).await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "v0");
    }
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_producer_error_reaches_every_caller() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = || failing_policy::<String>("upstream down", Arc::clone(&calls));

    let (a, b) = tokio::join!(
        cache.get_or_produce("k", policy()),
        cache.get_or_produce("k", policy()),
    );

    assert!(matches!(a, Err(CacheError::Producer { .. })));
    assert!(matches!(b, Err(CacheError::Producer { .. })));
    // failures are not cached, so the waiter retries
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().producer_errors, 2);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_after_deadline_still_fills_cache() {
    let cache = cache();
    let producer = SequencedProducer::new(vec!["slow".to_string()])
        .with_delay(Duration::from_secs(10));

    let value = cache
        .get_or_fallback(
            "k",
            producer.policy().with_ttl(Duration::from_secs(600)),
            Duration::from_secs(1),
            "fallback".to_string(),
        )
        .await
        .unwrap();
    assert_eq!(value, "fallback");

    cache.drain_background().await;
    let entry = cache.get_entry::<String>("k").await.unwrap();
    assert_eq!(entry.value, "slow");
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fast_lookup_beats_deadline() {
    let cache = cache();
    let producer = SequencedProducer::new(vec!["quick".to_string()])
        .with_delay(Duration::from_millis(10));

    let value = cache
        .get_or_fallback(
            "k",
            producer.policy(),
            Duration::from_secs(1),
            "fallback".to_string(),
        )
        .await
        .unwrap();
    assert_eq!(value, "quick");
}

#[tokio::test(start_paused = true)]
async fn test_deadline_variant_propagates_errors() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = cache
        .get_or_fallback(
            "k",
            failing_policy::<String>("boom", Arc::clone(&calls)),
            Duration::from_secs(1),
            "fallback".to_string(),
        )
        .await;
    assert!(matches!(result, Err(CacheError::Producer { .. })));
}
