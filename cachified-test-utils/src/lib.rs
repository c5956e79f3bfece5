//! cachified Test Utilities
//!
//! Shared test infrastructure for the cachified workspace:
//! - A manual clock for crossing freshness windows deterministically
//! - Producers that count calls and return scripted values
//! - A durable store that fails on demand
//! - Fake HTTP servers: a remote KV service and a designated writer
//! - Proptest generators

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};

// Re-export the types most tests need
pub use cachified_core::{
    Binary, BoxError, CacheEntry, CacheError, CacheMetadata, CachePolicy, Clock, DurableRecord,
    EngineConfig, ForceFresh, ForwardingConfig, Principal, Produced, RemoteKvConfig,
    RequestContext, StorageError, Timings, Ttl,
};
pub use cachified_storage::{
    BackendKind, Cachified, CachifiedBuilder, DurableStore, ForwardedWrite, LmdbStore,
    MemoryStore, StaticMembership,
};

// ============================================================================
// CLOCK
// ============================================================================

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn at_millis(ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(ms),
        }
    }

    pub fn set_millis(&self, ms: i64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis()).unwrap_or_default()
    }
}

/// Timestamp helper for metadata fixtures.
pub fn at_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// ============================================================================
// PRODUCERS
// ============================================================================

/// Producer returning scripted values in order, repeating the last one.
#[derive(Debug, Clone)]
pub struct SequencedProducer<T> {
    values: Arc<Vec<T>>,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl<T> SequencedProducer<T>
where
    T: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(values: Vec<T>) -> Self {
        assert!(!values.is_empty(), "SequencedProducer needs at least one value");
        Self {
            values: Arc::new(values),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: None,
        }
    }

    /// Sleep (Tokio time) before returning each value.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// A policy whose producer is this sequence.
    pub fn policy(&self) -> CachePolicy<T> {
        let values = Arc::clone(&self.values);
        let calls = Arc::clone(&self.calls);
        let delay = self.delay;
        CachePolicy::new(move || {
            let values = Arc::clone(&values);
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let value = values[call.min(values.len() - 1)].clone();
                Ok::<T, BoxError>(value)
            }
        })
    }
}

/// A policy whose producer always fails with `message`, counting calls.
pub fn failing_policy<T>(message: &'static str, calls: Arc<AtomicUsize>) -> CachePolicy<T>
where
    T: Send + 'static,
{
    CachePolicy::new(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Err::<T, BoxError>(message.into()) }
    })
}

// ============================================================================
// DURABLE STORES
// ============================================================================

/// In-memory store that fails every operation while `failing` is set.
#[derive(Debug)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl FailingStore {
    /// A store that starts out failing.
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Operations attempted, failed or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::RequestFailed {
                backend: "failing".to_string(),
                status: 503,
                message: "backend unreachable".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only LMDB store in `dir`, as a replica sees the designated writer's
/// file once it has been replicated. The environment is created first if
/// the directory is empty.
pub fn replica_lmdb_store(dir: impl AsRef<std::path::Path>) -> Result<LmdbStore, StorageError> {
    let dir = dir.as_ref();
    drop(LmdbStore::open(dir, 16)?);
    LmdbStore::open_read_only(dir, 16)
}

#[async_trait]
impl DurableStore for FailingStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<DurableRecord>, StorageError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, record: DurableRecord) -> Result<(), StorageError> {
        self.check()?;
        self.inner.set(record).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn list_keys(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        self.check()?;
        self.inner.list_keys(limit).await
    }

    async fn search_keys(&self, query: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        self.check()?;
        self.inner.search_keys(query, limit).await
    }
}

// ============================================================================
// FAKE REMOTE KV SERVER
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredValue {
    pub metadata: String,
    pub value: String,
}

#[derive(Clone)]
struct KvState {
    records: Arc<RwLock<BTreeMap<String, StoredValue>>>,
    token: Option<String>,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
struct KeysQuery {
    prefix: Option<String>,
    limit: Option<usize>,
    cursor: Option<String>,
}

/// In-process implementation of the remote KV REST contract.
pub struct FakeKvServer {
    pub base_url: String,
    records: Arc<RwLock<BTreeMap<String, StoredValue>>>,
}

impl FakeKvServer {
    /// Start on an ephemeral port. `page_size` caps keys per listing page.
    pub async fn spawn(token: Option<&str>, page_size: usize) -> std::io::Result<Self> {
        let records = Arc::new(RwLock::new(BTreeMap::new()));
        let state = KvState {
            records: Arc::clone(&records),
            token: token.map(str::to_string),
            page_size: page_size.max(1),
        };
        let app = Router::new()
            .route(
                "/values/:key",
                get(kv_get).put(kv_put).delete(kv_delete),
            )
            .route("/keys", get(kv_keys))
            .with_state(state);
        let addr = serve(app).await?;
        Ok(Self {
            base_url: format!("http://{}", addr),
            records,
        })
    }

    pub fn config(&self, token: Option<&str>, namespace: &str) -> RemoteKvConfig {
        RemoteKvConfig {
            base_url: self.base_url.clone(),
            token: token.map(str::to_string),
            namespace: namespace.to_string(),
        }
    }

    /// Raw (namespaced) keys currently stored.
    pub fn raw_keys(&self) -> Vec<String> {
        self.records
            .read()
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn raw_get(&self, namespaced_key: &str) -> Option<StoredValue> {
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(namespaced_key).cloned())
    }
}

fn authorized(state: &KvState, headers: &HeaderMap) -> bool {
    let Some(token) = &state.token else {
        return true;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", token))
}

async fn kv_get(
    State(state): State<KvState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let found = state
        .records
        .read()
        .ok()
        .and_then(|records| records.get(&key).cloned());
    match found {
        Some(value) => Json(value).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn kv_put(
    State(state): State<KvState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(value): Json<StoredValue>,
) -> StatusCode {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    if let Ok(mut records) = state.records.write() {
        records.insert(key, value);
    }
    StatusCode::NO_CONTENT
}

async fn kv_delete(
    State(state): State<KvState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> StatusCode {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let removed = state
        .records
        .write()
        .ok()
        .and_then(|mut records| records.remove(&key));
    match removed {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

async fn kv_keys(
    State(state): State<KvState>,
    headers: HeaderMap,
    Query(query): Query<KeysQuery>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let prefix = query.prefix.unwrap_or_default();
    let limit = query.limit.unwrap_or(state.page_size).min(state.page_size);
    let records = match state.records.read() {
        Ok(records) => records,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    let mut matching = records
        .keys()
        .filter(|k| k.starts_with(&prefix))
        .filter(|k| query.cursor.as_ref().map_or(true, |c| k.as_str() > c.as_str()));
    let keys: Vec<String> = matching.by_ref().take(limit).cloned().collect();
    let cursor = if matching.next().is_some() {
        keys.last().cloned()
    } else {
        None
    };
    Json(serde_json::json!({ "keys": keys, "cursor": cursor })).into_response()
}

// ============================================================================
// RECORDING WRITER SERVER
// ============================================================================

/// One forwarded write as received by [`RecordingWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedWrite {
    pub instance: String,
    pub authorization: Option<String>,
    pub write: ForwardedWrite,
}

/// Designated-writer stand-in that records forwarded writes.
pub struct RecordingWriter {
    pub base_url: String,
    received: Arc<Mutex<Vec<ReceivedWrite>>>,
}

impl RecordingWriter {
    pub async fn spawn() -> std::io::Result<Self> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/:instance/internal/cache", post(record_write))
            .with_state(Arc::clone(&received));
        let addr = serve(app).await?;
        Ok(Self {
            base_url: format!("http://{}", addr),
            received,
        })
    }

    /// Writer URL template routing every instance to this server.
    pub fn url_template(&self) -> String {
        format!("{}/{{instance}}", self.base_url)
    }

    pub fn received(&self) -> Vec<ReceivedWrite> {
        self.received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

async fn record_write(
    State(received): State<Arc<Mutex<Vec<ReceivedWrite>>>>,
    Path(instance): Path<String>,
    headers: HeaderMap,
    Json(write): Json<ForwardedWrite>,
) -> StatusCode {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Ok(mut received) = received.lock() {
        received.push(ReceivedWrite {
            instance,
            authorization,
            write,
        });
    }
    StatusCode::NO_CONTENT
}

/// Writer URL template nothing listens on.
pub fn unreachable_writer_template() -> String {
    "http://127.0.0.1:1/{instance}".to_string()
}

async fn serve(app: Router) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

/// Cache keys in the `domain:entity:id` convention.
pub fn arb_cache_key() -> impl Strategy<Value = String> {
    ("[a-z]{1,8}", "[a-z]{1,8}", "[a-z0-9-]{1,12}")
        .prop_map(|(domain, entity, id)| format!("{}:{}:{}", domain, entity, id))
}

/// Arbitrary binary payloads, including empty ones.
pub fn arb_binary() -> impl Strategy<Value = Binary> {
    prop::collection::vec(any::<u8>(), 0..512).prop_map(Binary::new)
}

/// Metadata with finite windows under a day.
pub fn arb_metadata() -> impl Strategy<Value = CacheMetadata> {
    (0i64..4_000_000_000_000, 0u64..86_400_000, 0u64..86_400_000).prop_map(
        |(created, ttl, swr)| {
            CacheMetadata::new(at_millis(created), Ttl::Finite(ttl), Duration::from_millis(swr))
        },
    )
}
