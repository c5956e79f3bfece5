//! Cache entries, their metadata, and the durable record format.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{decode_value, encode_value};
use crate::error::CodecError;

/// Time-to-live of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<u64>", into = "Option<u64>")]
pub enum Ttl {
    /// Fresh for this many milliseconds after creation.
    Finite(u64),
    /// Never becomes stale.
    Infinite,
}

impl Ttl {
    pub fn from_duration(duration: Duration) -> Self {
        Self::Finite(duration_millis(duration))
    }

    pub fn as_millis(&self) -> Option<u64> {
        match self {
            Self::Finite(ms) => Some(*ms),
            Self::Infinite => None,
        }
    }
}

impl From<Duration> for Ttl {
    fn from(duration: Duration) -> Self {
        Self::from_duration(duration)
    }
}

impl From<Option<u64>> for Ttl {
    fn from(ms: Option<u64>) -> Self {
        ms.map_or(Self::Infinite, Self::Finite)
    }
}

impl From<Ttl> for Option<u64> {
    fn from(ttl: Ttl) -> Self {
        ttl.as_millis()
    }
}

/// Where an entry sits in its lifecycle at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// `now < created_at + ttl`
    Fresh,
    /// `created_at + ttl <= now < created_at + ttl + swr`
    Stale,
    /// Past the stale window; must not be served without a refresh.
    Expired,
}

impl EntryState {
    /// Fresh or stale entries may be returned to a caller.
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Expired)
    }
}

/// Freshness bookkeeping stored alongside every cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    #[serde(rename = "createdTime", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub ttl: Ttl,
    #[serde(rename = "swr")]
    pub swr_ms: u64,
}

impl CacheMetadata {
    pub fn new(created_at: DateTime<Utc>, ttl: Ttl, swr: Duration) -> Self {
        Self {
            created_at,
            ttl,
            swr_ms: duration_millis(swr),
        }
    }

    /// Classify the entry at `now`.
    ///
    /// A `created_at` in the future (clock skew between instances) counts as fresh.
    pub fn state(&self, now: DateTime<Utc>) -> EntryState {
        let ttl_ms = match self.ttl {
            Ttl::Infinite => return EntryState::Fresh,
            Ttl::Finite(ms) => ms,
        };
        let age_ms = (now - self.created_at).num_milliseconds();
        if age_ms < 0 {
            return EntryState::Fresh;
        }
        let age_ms = age_ms as u64;
        if age_ms < ttl_ms {
            EntryState::Fresh
        } else if age_ms < ttl_ms.saturating_add(self.swr_ms) {
            EntryState::Stale
        } else {
            EntryState::Expired
        }
    }

    /// Instant after which the entry is expired, if it ever is.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl_ms = self.ttl.as_millis()?;
        let window = ttl_ms.saturating_add(self.swr_ms);
        let window = i64::try_from(window).ok()?;
        self.created_at
            .checked_add_signed(chrono::Duration::milliseconds(window))
    }
}

/// A value together with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub metadata: CacheMetadata,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, metadata: CacheMetadata) -> Self {
        Self { value, metadata }
    }

    pub fn state(&self, now: DateTime<Utc>) -> EntryState {
        self.metadata.state(now)
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// On-disk / remote representation of a [`CacheEntry`].
///
/// Mirrors the `(key TEXT PRIMARY KEY, metadata TEXT, value TEXT)` table
/// layout: both payload columns are JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub key: String,
    pub value: String,
    pub metadata: String,
}

impl DurableRecord {
    /// Encode an entry for storage under `key`.
    pub fn encode<T: Serialize>(
        key: impl Into<String>,
        entry: &CacheEntry<T>,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            key: key.into(),
            value: encode_value(&entry.value)?,
            metadata: encode_value(&entry.metadata)?,
        })
    }

    /// Decode only the metadata column.
    pub fn decode_metadata(&self) -> Result<CacheMetadata, CodecError> {
        decode_value(&self.metadata)
    }

    /// Decode the full entry.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<CacheEntry<T>, CodecError> {
        Ok(CacheEntry {
            value: decode_value(&self.value)?,
            metadata: self.decode_metadata()?,
        })
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Binary;
    use proptest::prelude::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_state_windows() {
        let meta = CacheMetadata::new(at(0), Ttl::Finite(1000), Duration::from_millis(4000));
        assert_eq!(meta.state(at(0)), EntryState::Fresh);
        assert_eq!(meta.state(at(999)), EntryState::Fresh);
        assert_eq!(meta.state(at(1000)), EntryState::Stale);
        assert_eq!(meta.state(at(4999)), EntryState::Stale);
        assert_eq!(meta.state(at(5000)), EntryState::Expired);
        assert!(!meta.state(at(6000)).is_usable());
    }

    #[test]
    fn test_zero_ttl_zero_swr_is_immediately_expired() {
        let meta = CacheMetadata::new(at(0), Ttl::Finite(0), Duration::ZERO);
        assert_eq!(meta.state(at(0)), EntryState::Expired);
    }

    #[test]
    fn test_infinite_ttl_never_expires() {
        let meta = CacheMetadata::new(at(0), Ttl::Infinite, Duration::ZERO);
        assert_eq!(meta.state(at(i64::MAX / 2)), EntryState::Fresh);
        assert_eq!(meta.expires_at(), None);
    }

    #[test]
    fn test_future_created_at_is_fresh() {
        let meta = CacheMetadata::new(at(10_000), Ttl::Finite(10), Duration::ZERO);
        assert_eq!(meta.state(at(0)), EntryState::Fresh);
    }

    #[test]
    fn test_expires_at() {
        let meta = CacheMetadata::new(at(1_000), Ttl::Finite(1000), Duration::from_millis(500));
        assert_eq!(meta.expires_at(), Some(at(2_500)));
    }

    #[test]
    fn test_metadata_wire_format() {
        let meta = CacheMetadata::new(at(1_700_000_000_000), Ttl::Finite(60_000), Duration::from_secs(1));
        let json = serde_json::to_value(meta).unwrap();
        assert_eq!(json["createdTime"], 1_700_000_000_000i64);
        assert_eq!(json["ttl"], 60_000);
        assert_eq!(json["swr"], 1_000);

        let infinite = CacheMetadata::new(at(0), Ttl::Infinite, Duration::ZERO);
        let json = serde_json::to_value(infinite).unwrap();
        assert!(json["ttl"].is_null());
        let back: CacheMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back.ttl, Ttl::Infinite);
    }

    #[test]
    fn test_record_round_trip_with_binary() {
        let entry = CacheEntry::new(
            Binary::new(vec![0xde, 0xad, 0xbe, 0xef]),
            CacheMetadata::new(at(42), Ttl::Finite(5), Duration::from_millis(7)),
        );
        let record = DurableRecord::encode("podcast:audio:1", &entry).unwrap();
        assert_eq!(record.key, "podcast:audio:1");
        let decoded: CacheEntry<Binary> = record.decode().unwrap();
        assert_eq!(decoded, entry);
    }

    proptest! {
        #[test]
        fn prop_exactly_one_state(created in 0i64..1_000_000, ttl in 0u64..100_000, swr in 0u64..100_000, offset in 0i64..300_000) {
            let meta = CacheMetadata::new(at(created), Ttl::Finite(ttl), Duration::from_millis(swr));
            let now = at(created + offset);
            let age = offset as u64;
            let expected = if age < ttl {
                EntryState::Fresh
            } else if age < ttl + swr {
                EntryState::Stale
            } else {
                EntryState::Expired
            };
            prop_assert_eq!(meta.state(now), expected);
        }
    }
}
