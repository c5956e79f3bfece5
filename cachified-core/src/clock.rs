//! Wall-clock source used for freshness decisions.

use chrono::{DateTime, Utc};

/// Source of "now" for the cache.
///
/// Production code uses [`SystemClock`]; tests substitute a manual clock so
/// freshness windows can be crossed deterministically.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
