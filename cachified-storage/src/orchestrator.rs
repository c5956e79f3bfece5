//! The cache orchestrator.
//!
//! [`Cachified`] owns the read/refresh/write protocol over both tiers:
//!
//! 1. Force-fresh gate: when it fires, skip straight to production.
//! 2. Ephemeral tier: a fresh, valid entry is returned.
//! 3. Durable tier: a fresh, valid entry is copied into the ephemeral tier
//!    and returned. The newest stale entry of either tier is returned
//!    immediately and refreshed in the background.
//! 4. Otherwise the producer runs, its result is validated and written to
//!    both tiers.
//!
//! Only producer and validation failures reach the caller. Durable tier
//! failures degrade to ephemeral-only caching.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cachified_core::{
    CacheEntry, CacheError, CacheMetadata, CachePolicy, CacheResult, CacheValue, Clock,
    EntryState, Timings, Ttl,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, warn};

use crate::cluster::InstanceInfo;
use crate::durable::DurableTier;
use crate::ephemeral::EphemeralTier;
use crate::forwarder::ForwardedWrite;
use crate::gate::ForceFreshGate;
use crate::lock::mutex_lock;
use crate::stats::{CacheStats, Counter, StatsRecorder};

const SOURCE: &str = "cachified::orchestrator";

const LABEL_EPHEMERAL: &str = "cache:ephemeral";
const LABEL_DURABLE: &str = "cache:durable";
const LABEL_PRODUCE: &str = "produce";

/// Two-tier stale-while-revalidate cache.
///
/// Construct once at startup (see [`Cachified::builder`] and
/// [`Cachified::from_config`]) and pass clones to every component that
/// caches; clones share all state. Call [`Cachified::shutdown`] before exit.
#[derive(Clone)]
pub struct Cachified {
    inner: Arc<Inner>,
}

struct Inner {
    ephemeral: EphemeralTier,
    durable: DurableTier,
    gate: ForceFreshGate,
    clock: Arc<dyn Clock>,
    stats: StatsRecorder,
    /// Keys with a background refresh in flight.
    refreshing: Mutex<HashSet<String>>,
    /// Per-key population locks.
    populating: DashMap<String, Arc<AsyncMutex<()>>>,
    tasks: Mutex<JoinSet<()>>,
}

/// Clears a key's in-flight refresh marker when the refresh task ends.
struct RefreshGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        mutex_lock(&self.inner.refreshing, SOURCE, "refresh_guard.drop").remove(&self.key);
    }
}

impl Cachified {
    pub(crate) fn from_parts(
        ephemeral: EphemeralTier,
        durable: DurableTier,
        gate: ForceFreshGate,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ephemeral,
                durable,
                gate,
                clock,
                stats: StatsRecorder::default(),
                refreshing: Mutex::new(HashSet::new()),
                populating: DashMap::new(),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn ephemeral(&self) -> &EphemeralTier {
        &self.inner.ephemeral
    }

    pub fn durable(&self) -> &DurableTier {
        &self.inner.durable
    }

    pub fn gate(&self) -> &ForceFreshGate {
        &self.inner.gate
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Return the value for `key`, producing it when no usable entry exists.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Producer`] when the producer fails
    /// - [`CacheError::Validation`] when the produced value is rejected
    pub async fn get_or_produce<T: CacheValue>(
        &self,
        key: &str,
        policy: CachePolicy<T>,
    ) -> CacheResult<T> {
        let timings = policy.timings().cloned();

        if self
            .inner
            .gate
            .should_force_fresh(policy.request(), key, policy.force_fresh())
        {
            self.inner.stats.incr(Counter::ForcedFresh);
            debug!(key, "Force-fresh requested, bypassing cached entries");
            return self.populate(key, &policy, None).await;
        }

        let requested_at = self.now();
        let mut stale: Option<CacheEntry<T>> = None;

        let cached = timed_sync(timings.as_ref(), LABEL_EPHEMERAL, key, || {
            self.inner.ephemeral.get::<T>(key, requested_at)
        });
        if let Some(entry) = cached {
            if !policy.is_valid(&entry.value) {
                self.inner.stats.incr(Counter::ValidationFailure);
                debug!(key, tier = "ephemeral", "Cached value failed validation");
            } else {
                match entry.state(requested_at) {
                    EntryState::Fresh => {
                        self.inner.stats.incr(Counter::EphemeralHit);
                        debug!(key, tier = "ephemeral", "Cache hit");
                        return Ok(entry.value);
                    }
                    EntryState::Stale => stale = Some(entry),
                    EntryState::Expired => {}
                }
            }
        }

        let stored = timed(
            timings.as_ref(),
            LABEL_DURABLE,
            key,
            self.inner.durable.get::<T>(key),
        )
        .await;
        if let Some(entry) = stored {
            if !policy.is_valid(&entry.value) {
                self.inner.stats.incr(Counter::ValidationFailure);
                debug!(key, tier = "durable", "Cached value failed validation");
            } else {
                match entry.state(requested_at) {
                    EntryState::Fresh => {
                        self.inner.ephemeral.set(key, entry.clone());
                        self.inner.stats.incr(Counter::DurableHit);
                        debug!(key, tier = "durable", "Cache hit");
                        return Ok(entry.value);
                    }
                    EntryState::Stale => {
                        let newer = stale
                            .as_ref()
                            .map_or(true, |s| entry.metadata.created_at > s.metadata.created_at);
                        if newer {
                            self.inner.ephemeral.set(key, entry.clone());
                            stale = Some(entry);
                        }
                    }
                    EntryState::Expired => {}
                }
            }
        }

        if let Some(entry) = stale {
            self.inner.stats.incr(Counter::StaleServed);
            debug!(key, "Serving stale value");
            self.schedule_refresh(key, policy);
            return Ok(entry.value);
        }

        self.inner.stats.incr(Counter::Miss);
        debug!(key, "Cache miss");
        self.populate(key, &policy, Some(requested_at)).await
    }

    /// Like [`get_or_produce`](Self::get_or_produce), but gives up after
    /// `deadline` and returns `fallback`.
    ///
    /// The lookup keeps running in the background after the deadline and
    /// still fills both tiers when it completes.
    pub async fn get_or_fallback<T: CacheValue>(
        &self,
        key: &str,
        policy: CachePolicy<T>,
        deadline: Duration,
        fallback: T,
    ) -> CacheResult<T> {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        let owned_key = key.to_string();
        self.spawn_tracked(async move {
            let result = this.get_or_produce(&owned_key, policy).await;
            // the caller may have given up already
            let _ = tx.send(result);
        });

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                warn!(key, "Lookup task ended without a result, using fallback");
                Ok(fallback)
            }
            Err(_) => {
                debug!(key, deadline_ms = deadline.as_millis() as u64, "Deadline elapsed, using fallback");
                Ok(fallback)
            }
        }
    }

    /// Read an entry from either tier without producing. Expired entries are
    /// not returned.
    pub async fn get_entry<T: CacheValue>(&self, key: &str) -> Option<CacheEntry<T>> {
        let now = self.now();
        if let Some(entry) = self.inner.ephemeral.get::<T>(key, now) {
            return Some(entry);
        }
        let entry = self.inner.durable.get::<T>(key).await?;
        if !entry.state(now).is_usable() {
            return None;
        }
        self.inner.ephemeral.set(key, entry.clone());
        Some(entry)
    }

    /// Write an entry to both tiers. On a replica of a single-writer store the
    /// durable write is forwarded in the background.
    pub async fn set_entry<T: CacheValue>(&self, key: &str, entry: CacheEntry<T>) {
        self.inner.ephemeral.set(key, entry.clone());
        self.inner.durable.set(key, &entry).await;
    }

    /// Remove `key` from both tiers.
    pub async fn delete(&self, key: &str) {
        self.inner.ephemeral.delete(key);
        self.inner.durable.delete(key).await;
    }

    /// Apply a write forwarded by a replica and drop this instance's
    /// ephemeral copy of the key.
    pub async fn apply_forwarded(&self, write: ForwardedWrite) -> CacheResult<()> {
        let key = write.key().to_string();
        self.inner.durable.apply_forwarded(write).await?;
        self.inner.ephemeral.delete(&key);
        debug!(key = %key, "Applied forwarded write");
        Ok(())
    }

    pub async fn list_keys(&self, limit: usize) -> CacheResult<Vec<String>> {
        self.inner.durable.list_keys(limit).await
    }

    pub async fn search_keys(&self, query: &str, limit: usize) -> CacheResult<Vec<String>> {
        self.inner.durable.search_keys(query, limit).await
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.inner.stats.snapshot();
        stats.ephemeral_entries = self.inner.ephemeral.len() as u64;
        stats.evictions = self.inner.ephemeral.evictions();
        stats.forward_failures = self
            .inner
            .durable
            .forwarder()
            .map_or(0, |forwarder| forwarder.failures());
        stats.durable_degraded = self.inner.durable.is_degraded();
        stats
    }

    pub async fn instance_info(&self) -> CacheResult<InstanceInfo> {
        self.inner.durable.instance_info().await
    }

    /// Wait for every background task spawned so far, including tasks they
    /// spawn while draining.
    pub async fn drain_background(&self) {
        loop {
            let mut tasks =
                std::mem::take(&mut *mutex_lock(&self.inner.tasks, SOURCE, "drain_background"));
            if tasks.is_empty() {
                break;
            }
            while let Some(result) = tasks.join_next().await {
                log_task_result(result);
            }
        }
    }

    /// Finish background refreshes, drain forwarded writes, close the store.
    pub async fn shutdown(&self) -> CacheResult<()> {
        self.drain_background().await;
        self.inner.durable.close().await
    }

    /// Run the producer under the key's population lock.
    ///
    /// With `requested_at` set, a value produced by a concurrent call after
    /// that instant is reused instead of producing again.
    async fn populate<T: CacheValue>(
        &self,
        key: &str,
        policy: &CachePolicy<T>,
        requested_at: Option<DateTime<Utc>>,
    ) -> CacheResult<T> {
        let lock = self
            .inner
            .populating
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            match requested_at.and_then(|since| self.produced_since(key, since, policy)) {
                Some(value) => {
                    debug!(key, "Reusing value produced by a concurrent call");
                    Ok(value)
                }
                None => self.produce_and_store(key, policy).await,
            }
        };

        // map + this handle; anything more means another caller is waiting
        self.inner
            .populating
            .remove_if(key, |_, current| Arc::strong_count(current) <= 2);
        result
    }

    fn produced_since<T: CacheValue>(
        &self,
        key: &str,
        since: DateTime<Utc>,
        policy: &CachePolicy<T>,
    ) -> Option<T> {
        let now = self.now();
        let entry = self.inner.ephemeral.get::<T>(key, now)?;
        let reusable = entry.metadata.created_at >= since
            && entry.state(now).is_usable()
            && policy.is_valid(&entry.value);
        reusable.then_some(entry.value)
    }

    async fn produce_and_store<T: CacheValue>(
        &self,
        key: &str,
        policy: &CachePolicy<T>,
    ) -> CacheResult<T> {
        let produced = match timed(policy.timings(), LABEL_PRODUCE, key, policy.produce()).await {
            Ok(produced) => produced,
            Err(e) => {
                self.inner.stats.incr(Counter::ProducerError);
                return Err(CacheError::producer(key, e));
            }
        };

        let missing = produced.is_missing();
        let value = produced.into_inner();
        if !policy.is_valid(&value) {
            self.inner.stats.incr(Counter::ValidationFailure);
            return Err(CacheError::Validation {
                key: key.to_string(),
                reason: "produced value was rejected by the validator".to_string(),
            });
        }

        let created_at = self.now();
        if missing {
            self.store_missing(key, policy, created_at, &value).await;
        } else {
            let entry = CacheEntry::new(
                value.clone(),
                CacheMetadata::new(created_at, policy.ttl(), policy.swr()),
            );
            self.inner.ephemeral.set(key, entry.clone());
            timed(
                policy.timings(),
                LABEL_DURABLE,
                key,
                self.inner.durable.set(key, &entry),
            )
            .await;
        }
        Ok(value)
    }

    /// Negative results never reach the durable tier. They stay in the
    /// ephemeral tier for the negative window only.
    async fn store_missing<T: CacheValue>(
        &self,
        key: &str,
        policy: &CachePolicy<T>,
        created_at: DateTime<Utc>,
        value: &T,
    ) {
        if policy.negative_ttl().is_zero() && policy.negative_swr().is_zero() {
            self.inner.ephemeral.delete(key);
        } else {
            let metadata = CacheMetadata::new(
                created_at,
                Ttl::from_duration(policy.negative_ttl()),
                policy.negative_swr(),
            );
            self.inner
                .ephemeral
                .set(key, CacheEntry::new(value.clone(), metadata));
        }
        timed(
            policy.timings(),
            LABEL_DURABLE,
            key,
            self.inner.durable.delete(key),
        )
        .await;
        debug!(key, "Producer reported no value, durable record removed");
    }

    fn schedule_refresh<T: CacheValue>(&self, key: &str, policy: CachePolicy<T>) {
        let inserted =
            mutex_lock(&self.inner.refreshing, SOURCE, "schedule_refresh").insert(key.to_string());
        if !inserted {
            self.inner.stats.incr(Counter::RefreshSkipped);
            debug!(key, "Refresh already in flight");
            return;
        }
        self.inner.stats.incr(Counter::RefreshStarted);

        let this = self.clone();
        let key = key.to_string();
        let policy = policy.without_timings();
        self.spawn_tracked(async move {
            let _guard = RefreshGuard {
                inner: Arc::clone(&this.inner),
                key: key.clone(),
            };
            match this.populate(&key, &policy, None).await {
                Ok(_) => debug!(key = %key, "Background refresh complete"),
                Err(e) => {
                    this.inner.stats.incr(Counter::RefreshFailure);
                    error!(key = %key, error = %e, "Background refresh failed");
                }
            }
        });
    }

    fn spawn_tracked<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = mutex_lock(&self.inner.tasks, SOURCE, "spawn_tracked");
        while let Some(result) = tasks.try_join_next() {
            log_task_result(result);
        }
        tasks.spawn(fut);
    }
}

impl std::fmt::Debug for Cachified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cachified")
            .field("ephemeral", &self.inner.ephemeral)
            .field("durable", &self.inner.durable)
            .field("gate", &self.inner.gate)
            .finish_non_exhaustive()
    }
}

fn log_task_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Background cache task panicked");
        }
    }
}

async fn timed<F: Future>(timings: Option<&Timings>, label: &str, key: &str, fut: F) -> F::Output {
    match timings {
        Some(timings) => timings.time(label, Some(key), fut).await,
        None => fut.await,
    }
}

fn timed_sync<R>(timings: Option<&Timings>, label: &str, key: &str, f: impl FnOnce() -> R) -> R {
    match timings {
        Some(timings) => timings.time_sync(label, Some(key), f),
        None => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticMembership;
    use crate::durable::MemoryStore;
    use cachified_core::{BoxError, Produced, SystemClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> Cachified {
        Cachified::from_parts(
            EphemeralTier::with_capacity(16),
            DurableTier::new(
                Arc::new(MemoryStore::new()),
                Arc::new(StaticMembership::primary("solo")),
                None,
            ),
            ForceFreshGate::default(),
            Arc::new(SystemClock),
        )
    }

    fn counting(calls: &Arc<AtomicUsize>, value: &'static str) -> CachePolicy<String> {
        let calls = Arc::clone(calls);
        CachePolicy::new(move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(value.to_string())
            }
        })
        .with_ttl(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_second_call_is_an_ephemeral_hit() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        assert_eq!(cache.get_or_produce("k", counting(&calls, "v")).await.unwrap(), "v");
        assert_eq!(cache.get_or_produce("k", counting(&calls, "v")).await.unwrap(), "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.ephemeral_hits, 1);
        assert_eq!(stats.ephemeral_entries, 1);
    }

    #[tokio::test]
    async fn test_durable_hit_repopulates_ephemeral() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.get_or_produce("k", counting(&calls, "v")).await.unwrap();
        cache.ephemeral().clear();

        assert_eq!(cache.get_or_produce("k", counting(&calls, "v")).await.unwrap(), "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().durable_hits, 1);
        assert_eq!(cache.ephemeral().len(), 1);
    }

    #[tokio::test]
    async fn test_producer_error_is_propagated_and_not_cached() {
        let cache = cache();
        let policy: CachePolicy<String> =
            CachePolicy::new(|| async { Err::<String, _>(std::io::Error::other("upstream down")) });
        let err = cache.get_or_produce("k", policy).await.unwrap_err();
        assert!(err.is_producer());
        assert!(err.to_string().contains("upstream down"));
        assert!(cache.get_entry::<String>("k").await.is_none());
        assert_eq!(cache.stats().producer_errors, 1);
    }

    #[tokio::test]
    async fn test_invalid_produced_value_is_a_validation_error() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = counting(&calls, "").with_validator(|v: &String| !v.is_empty());
        let err = cache.get_or_produce("k", policy).await.unwrap_err();
        assert!(matches!(err, CacheError::Validation { .. }));
        assert!(cache.ephemeral().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_cached_value_triggers_production() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.get_or_produce("k", counting(&calls, "old")).await.unwrap();

        let policy = counting(&calls, "new").with_validator(|v: &String| v == "new");
        assert_eq!(cache.get_or_produce("k", policy).await.unwrap(), "new");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().validation_failures, 2);
    }

    #[tokio::test]
    async fn test_missing_result_is_not_persisted() {
        let cache = cache();
        let policy: CachePolicy<Vec<String>> =
            CachePolicy::new(|| async { Ok::<_, BoxError>(Produced::Missing(Vec::new())) })
                .with_ttl(Duration::from_secs(3600));
        assert!(cache.get_or_produce("k", policy).await.unwrap().is_empty());
        assert!(cache.ephemeral().is_empty());
        assert!(cache.durable().read("k").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_result_kept_for_negative_window() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let make = || {
            let calls = Arc::clone(&calls);
            CachePolicy::<Option<String>>::new(move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(Produced::Missing(None::<String>))
                }
            })
            .with_negative_ttl(Duration::from_secs(30))
        };
        assert_eq!(cache.get_or_produce("k", make()).await.unwrap(), None);
        assert_eq!(cache.get_or_produce("k", make()).await.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.durable().read("k").await.is_none());
    }

    #[tokio::test]
    async fn test_set_entry_then_get_entry() {
        let cache = cache();
        let entry = CacheEntry::new(
            42u64,
            CacheMetadata::new(cache.now(), Ttl::Infinite, Duration::ZERO),
        );
        cache.set_entry("k", entry.clone()).await;
        assert_eq!(cache.get_entry::<u64>("k").await, Some(entry));

        cache.delete("k").await;
        assert!(cache.get_entry::<u64>("k").await.is_none());
    }

    #[tokio::test]
    async fn test_timings_are_recorded() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let timings = Timings::new();
        cache
            .get_or_produce("k", counting(&calls, "v").with_timings(timings.clone()))
            .await
            .unwrap();
        assert_eq!(
            timings.labels(),
            vec![LABEL_EPHEMERAL, LABEL_DURABLE, LABEL_PRODUCE]
        );
        assert_eq!(timings.samples(LABEL_DURABLE).len(), 2);
        assert!(timings.to_header().contains("produce;desc=\"k\""));
    }

    #[tokio::test]
    async fn test_shutdown_closes_store() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.get_or_produce("k", counting(&calls, "v")).await.unwrap();
        cache.shutdown().await.unwrap();
    }
}
