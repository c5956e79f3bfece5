//! Per-request timing recorder rendered as a `Server-Timing` header.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// One measured duration under a label.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingSample {
    pub description: Option<String>,
    pub duration: Duration,
}

/// Accumulates named duration samples for one in-flight request.
///
/// Cloning is cheap and clones share the same accumulator, so a handle can be
/// passed into every cache call made while serving the request. Labels keep
/// first-insertion order; samples under one label are summed when rendered.
#[derive(Debug, Clone, Default)]
pub struct Timings {
    inner: Arc<Mutex<Vec<(String, Vec<TimingSample>)>>>,
}

impl Timings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample under `label`.
    pub fn record(&self, label: impl Into<String>, description: Option<String>, duration: Duration) {
        let label = label.into();
        let sample = TimingSample {
            description,
            duration,
        };
        let mut entries = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.iter_mut().find(|(existing, _)| *existing == label) {
            Some((_, samples)) => samples.push(sample),
            None => entries.push((label, vec![sample])),
        }
    }

    /// Await `fut`, recording its wall-clock duration. The output, including
    /// any error it carries, is returned untouched.
    pub async fn time<F>(&self, label: &str, description: Option<&str>, fut: F) -> F::Output
    where
        F: Future,
    {
        let start = Instant::now();
        let output = fut.await;
        self.record(label, description.map(str::to_string), start.elapsed());
        output
    }

    /// Synchronous counterpart of [`Timings::time`].
    pub fn time_sync<R>(&self, label: &str, description: Option<&str>, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let output = f();
        self.record(label, description.map(str::to_string), start.elapsed());
        output
    }

    /// Samples recorded under `label`, in recording order.
    pub fn samples(&self, label: &str) -> Vec<TimingSample> {
        let entries = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .find(|(existing, _)| existing == label)
            .map(|(_, samples)| samples.clone())
            .unwrap_or_default()
    }

    /// Sum of all samples under `label`.
    pub fn total(&self, label: &str) -> Option<Duration> {
        let samples = self.samples(label);
        if samples.is_empty() {
            None
        } else {
            Some(samples.iter().map(|s| s.duration).sum())
        }
    }

    pub fn labels(&self) -> Vec<String> {
        let entries = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|(label, _)| label.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Render as a `Server-Timing` header value.
    ///
    /// Format: `name;desc="a & b";dur=12.3`, entries separated by commas.
    /// Names have `: @=;,` and spaces replaced by `_`.
    pub fn to_header(&self) -> String {
        let entries = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|(label, samples)| render_entry(label, samples))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn render_entry(label: &str, samples: &[TimingSample]) -> String {
    let total: Duration = samples.iter().map(|s| s.duration).sum();
    let descriptions: Vec<&str> = samples
        .iter()
        .filter_map(|s| s.description.as_deref())
        .filter(|d| !d.is_empty())
        .collect();

    let mut parts = vec![sanitize_name(label)];
    if !descriptions.is_empty() {
        let desc = descriptions.join(" & ");
        // JSON string quoting keeps embedded quotes and backslashes header-safe.
        let quoted = serde_json::to_string(&desc).unwrap_or_else(|_| format!("\"{}\"", desc));
        parts.push(format!("desc={}", quoted));
    }
    parts.push(format!("dur={:.1}", total.as_secs_f64() * 1000.0));
    parts.join(";")
}

fn sanitize_name(label: &str) -> String {
    label
        .chars()
        .map(|c| match c {
            ':' | ' ' | '@' | '=' | ';' | ',' => '_',
            c if c.is_ascii_graphic() => c,
            _ => '_',
        })
        .collect()
}

/// Merge two `Server-Timing` header values.
pub fn combine_server_timings(first: &str, second: &str) -> String {
    [first.trim(), second.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_are_summed_per_label() {
        let timings = Timings::new();
        timings.record("cache:durable", Some("read a".to_string()), Duration::from_millis(2));
        timings.record("cache:durable", Some("read b".to_string()), Duration::from_millis(3));
        timings.record("produce", None, Duration::from_micros(1500));

        assert_eq!(timings.total("cache:durable"), Some(Duration::from_millis(5)));
        assert_eq!(timings.samples("cache:durable").len(), 2);
        assert_eq!(timings.labels(), vec!["cache:durable", "produce"]);
        assert_eq!(
            timings.to_header(),
            r#"cache_durable;desc="read a & read b";dur=5.0,produce;dur=1.5"#
        );
    }

    #[test]
    fn test_empty_header() {
        let timings = Timings::new();
        assert!(timings.is_empty());
        assert_eq!(timings.to_header(), "");
        assert_eq!(timings.total("missing"), None);
    }

    #[test]
    fn test_description_is_quoted_safely() {
        let timings = Timings::new();
        timings.record("x", Some(r#"say "hi""#.to_string()), Duration::ZERO);
        assert_eq!(timings.to_header(), r#"x;desc="say \"hi\"";dur=0.0"#);
    }

    #[test]
    fn test_clones_share_samples() {
        let timings = Timings::new();
        let handle = timings.clone();
        handle.record("a", None, Duration::from_millis(1));
        assert_eq!(timings.total("a"), Some(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn test_time_passes_errors_through() {
        let timings = Timings::new();
        let result: Result<(), &str> = timings
            .time("produce", Some("blog:posts"), async { Err("boom") })
            .await;
        assert_eq!(result, Err("boom"));
        assert_eq!(timings.samples("produce").len(), 1);
    }

    #[test]
    fn test_time_sync_records() {
        let timings = Timings::new();
        let value = timings.time_sync("lru", None, || 7);
        assert_eq!(value, 7);
        assert!(timings.total("lru").is_some());
    }

    #[test]
    fn test_combine_server_timings() {
        assert_eq!(combine_server_timings("a;dur=1", "b;dur=2"), "a;dur=1,b;dur=2");
        assert_eq!(combine_server_timings("", "b;dur=2"), "b;dur=2");
        assert_eq!(combine_server_timings("a;dur=1", " "), "a;dur=1");
    }
}
