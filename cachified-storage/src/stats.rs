//! Cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time statistics about one [`Cachified`](crate::Cachified) instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Fresh values served from the ephemeral tier.
    pub ephemeral_hits: u64,
    /// Fresh values served from the durable tier.
    pub durable_hits: u64,
    /// Stale values served while a refresh was scheduled.
    pub stale_served: u64,
    /// Calls that had to produce synchronously.
    pub misses: u64,
    /// Calls that bypassed cached data via force-fresh.
    pub forced_fresh: u64,
    /// Background refreshes started.
    pub refreshes_started: u64,
    /// Refreshes not started because one was already in flight for the key.
    pub refreshes_skipped: u64,
    /// Background refreshes whose producer failed.
    pub refresh_failures: u64,
    pub producer_errors: u64,
    /// Cached or produced values rejected by a validator.
    pub validation_failures: u64,
    /// Number of entries currently in the ephemeral tier.
    pub ephemeral_entries: u64,
    /// Number of ephemeral evictions due to capacity.
    pub evictions: u64,
    /// Forwarded writes that failed or were dropped.
    pub forward_failures: u64,
    pub durable_degraded: bool,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.ephemeral_hits + self.durable_hits + self.stale_served
    }

    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    EphemeralHit,
    DurableHit,
    StaleServed,
    Miss,
    ForcedFresh,
    RefreshStarted,
    RefreshSkipped,
    RefreshFailure,
    ProducerError,
    ValidationFailure,
}

/// Lock-free counters behind [`CacheStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    counters: [AtomicU64; 10],
}

impl StatsRecorder {
    pub(crate) fn incr(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// Snapshot the counters. Tier-level gauges are filled in by the caller.
    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            ephemeral_hits: self.get(Counter::EphemeralHit),
            durable_hits: self.get(Counter::DurableHit),
            stale_served: self.get(Counter::StaleServed),
            misses: self.get(Counter::Miss),
            forced_fresh: self.get(Counter::ForcedFresh),
            refreshes_started: self.get(Counter::RefreshStarted),
            refreshes_skipped: self.get(Counter::RefreshSkipped),
            refresh_failures: self.get(Counter::RefreshFailure),
            producer_errors: self.get(Counter::ProducerError),
            validation_failures: self.get(Counter::ValidationFailure),
            ..Default::default()
        }
    }
}
