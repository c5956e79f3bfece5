//! Per-call caching policy.
//!
//! A [`CachePolicy`] is built by the caller for one `get_or_produce`
//! invocation and never stored. It carries the freshness windows, the value
//! producer, an optional validator, and the force-fresh inputs.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::entry::Ttl;
use crate::error::BoxError;
use crate::request::RequestContext;
use crate::timing::Timings;

/// Values the engine can cache: cloneable, shareable, and serializable to
/// the durable tier's text format.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Outcome of a producer call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Produced<T> {
    /// A positive result, cached for the policy's `ttl` + `swr`.
    Value(T),
    /// "No value right now" (an empty listing, a 404 upstream). Not persisted
    /// to the durable tier; kept in-process only for the negative window.
    Missing(T),
}

impl<T> Produced<T> {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Value(v) | Self::Missing(v) => v,
        }
    }
}

impl<T> From<T> for Produced<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}

/// Explicit, programmatic force-fresh override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceFresh {
    /// Applies to every key.
    Flag(bool),
    /// Applies only to the listed keys.
    Keys(Vec<String>),
}

impl ForceFresh {
    pub fn flag(force: bool) -> Self {
        Self::Flag(force)
    }

    /// Parse a comma-separated key list such as `"blog:a,blog:b"`.
    pub fn keys(list: &str) -> Self {
        Self::Keys(split_key_list(list))
    }

    pub fn applies_to(&self, key: &str) -> bool {
        match self {
            Self::Flag(force) => *force,
            Self::Keys(keys) => keys.iter().any(|k| k == key),
        }
    }
}

/// Split a comma-separated key list, trimming whitespace and dropping empties.
pub fn split_key_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

/// Boxed future returned by a producer.
pub type ProduceFuture<T> = BoxFuture<'static, Result<Produced<T>, BoxError>>;

type ProduceFn<T> = Arc<dyn Fn() -> ProduceFuture<T> + Send + Sync>;
type ValidateFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Caching contract for one call.
///
/// Defaults: infinite TTL, no stale window, no negative window, every value valid.
pub struct CachePolicy<T> {
    ttl: Ttl,
    swr: Duration,
    negative_ttl: Duration,
    negative_swr: Duration,
    validate: Option<ValidateFn<T>>,
    produce: ProduceFn<T>,
    force_fresh: Option<ForceFresh>,
    request: Option<RequestContext>,
    timings: Option<Timings>,
}

impl<T: Send + 'static> CachePolicy<T> {
    /// Create a policy around `produce`.
    ///
    /// The producer may return `T` directly or a [`Produced<T>`] to flag a
    /// negative result. It may be called more than once concurrently for the
    /// same key across processes, so it must be idempotent-safe.
    pub fn new<F, Fut, R, E>(produce: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Into<Produced<T>> + 'static,
        E: Into<BoxError> + 'static,
    {
        let produce: ProduceFn<T> = Arc::new(move || -> ProduceFuture<T> {
            let fut = produce();
            async move {
                let output: Result<Produced<T>, BoxError> =
                    fut.await.map(Into::into).map_err(Into::into);
                output
            }
            .boxed()
        });
        Self {
            ttl: Ttl::Infinite,
            swr: Duration::ZERO,
            negative_ttl: Duration::ZERO,
            negative_swr: Duration::ZERO,
            validate: None,
            produce,
            force_fresh: None,
            request: None,
            timings: None,
        }
    }
}

impl<T> CachePolicy<T> {
    pub fn with_ttl(mut self, ttl: impl Into<Ttl>) -> Self {
        self.ttl = ttl.into();
        self
    }

    pub fn with_swr(mut self, swr: Duration) -> Self {
        self.swr = swr;
        self
    }

    /// Freshness window applied to [`Produced::Missing`] results.
    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = ttl;
        self
    }

    /// Stale window applied to [`Produced::Missing`] results.
    pub fn with_negative_swr(mut self, swr: Duration) -> Self {
        self.negative_swr = swr;
        self
    }

    /// Reject cached or produced values for which `validate` returns false.
    pub fn with_validator<F>(mut self, validate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    pub fn with_force_fresh(mut self, force_fresh: ForceFresh) -> Self {
        self.force_fresh = Some(force_fresh);
        self
    }

    pub fn with_request(mut self, request: RequestContext) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = Some(timings);
        self
    }

    /// Drop the timing handle, e.g. for work that outlives the request.
    pub fn without_timings(mut self) -> Self {
        self.timings = None;
        self
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    pub fn swr(&self) -> Duration {
        self.swr
    }

    pub fn negative_ttl(&self) -> Duration {
        self.negative_ttl
    }

    pub fn negative_swr(&self) -> Duration {
        self.negative_swr
    }

    pub fn force_fresh(&self) -> Option<&ForceFresh> {
        self.force_fresh.as_ref()
    }

    pub fn request(&self) -> Option<&RequestContext> {
        self.request.as_ref()
    }

    pub fn timings(&self) -> Option<&Timings> {
        self.timings.as_ref()
    }

    /// Run the validator; values are valid when none is set.
    pub fn is_valid(&self, value: &T) -> bool {
        self.validate.as_ref().map_or(true, |validate| validate(value))
    }

    /// Start one producer invocation.
    pub fn produce(&self) -> ProduceFuture<T> {
        (self.produce)()
    }
}

impl<T> Clone for CachePolicy<T> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            swr: self.swr,
            negative_ttl: self.negative_ttl,
            negative_swr: self.negative_swr,
            validate: self.validate.clone(),
            produce: Arc::clone(&self.produce),
            force_fresh: self.force_fresh.clone(),
            request: self.request.clone(),
            timings: self.timings.clone(),
        }
    }
}

impl<T> fmt::Debug for CachePolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("ttl", &self.ttl)
            .field("swr", &self.swr)
            .field("negative_ttl", &self.negative_ttl)
            .field("negative_swr", &self.negative_swr)
            .field("has_validator", &self.validate.is_some())
            .field("force_fresh", &self.force_fresh)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_fresh_keys() {
        let force = ForceFresh::keys("a, b,,c");
        assert_eq!(
            force,
            ForceFresh::Keys(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert!(force.applies_to("b"));
        assert!(!force.applies_to("d"));
        assert!(!ForceFresh::keys("").applies_to(""));
    }

    #[test]
    fn test_force_fresh_flag() {
        assert!(ForceFresh::flag(true).applies_to("anything"));
        assert!(!ForceFresh::flag(false).applies_to("anything"));
    }

    #[test]
    fn test_policy_defaults() {
        let policy: CachePolicy<String> =
            CachePolicy::new(|| async { Ok::<_, BoxError>("v".to_string()) });
        assert_eq!(policy.ttl(), Ttl::Infinite);
        assert_eq!(policy.swr(), Duration::ZERO);
        assert_eq!(policy.negative_ttl(), Duration::ZERO);
        assert!(policy.is_valid(&"anything".to_string()));
        assert!(policy.force_fresh().is_none());
        assert!(policy.request().is_none());
    }

    #[test]
    fn test_policy_builder() {
        let policy: CachePolicy<Vec<u32>> =
            CachePolicy::new(|| async { Ok::<_, BoxError>(vec![1]) })
                .with_ttl(Duration::from_secs(60))
                .with_swr(Duration::from_secs(3600))
                .with_negative_ttl(Duration::from_secs(5))
                .with_validator(|v: &Vec<u32>| !v.is_empty())
                .with_force_fresh(ForceFresh::flag(true));

        assert_eq!(policy.ttl(), Ttl::Finite(60_000));
        assert_eq!(policy.swr(), Duration::from_secs(3600));
        assert_eq!(policy.negative_ttl(), Duration::from_secs(5));
        assert!(policy.is_valid(&vec![1]));
        assert!(!policy.is_valid(&vec![]));
        assert!(format!("{:?}", policy).contains("has_validator: true"));
    }

    #[tokio::test]
    async fn test_produce_wraps_plain_values_and_missing() {
        let policy: CachePolicy<u32> = CachePolicy::new(|| async { Ok::<_, BoxError>(7u32) });
        assert_eq!(policy.produce().await.unwrap(), Produced::Value(7));

        let policy: CachePolicy<Option<u32>> =
            CachePolicy::new(|| async { Ok::<_, BoxError>(Produced::Missing(None::<u32>)) });
        let produced = policy.produce().await.unwrap();
        assert!(produced.is_missing());
        assert_eq!(produced.into_inner(), None);
    }

    #[tokio::test]
    async fn test_produce_error_is_boxed() {
        let policy: CachePolicy<u32> =
            CachePolicy::new(|| async { Err::<u32, _>(std::io::Error::other("offline")) });
        let err = policy.produce().await.unwrap_err();
        assert_eq!(err.to_string(), "offline");
    }
}
