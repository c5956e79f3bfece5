//! Write forwarder for replicas of a single-writer durable store.
//!
//! Replicas hand `set`/`delete` operations to a background worker that POSTs
//! them to the designated writer. Callers never wait on the network; failed
//! forwards are logged with the key and target instance and then dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cachified_core::{CacheError, CacheResult, DurableRecord, ForwardingConfig};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::lock::mutex_lock;

const SOURCE: &str = "cachified::forwarder";

/// Path on the writer that accepts forwarded writes.
pub const FORWARD_PATH: &str = "/internal/cache";

/// A durable write forwarded to the designated writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ForwardedWrite {
    Set {
        key: String,
        value: String,
        metadata: String,
    },
    Delete {
        key: String,
    },
}

impl ForwardedWrite {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }
}

impl From<DurableRecord> for ForwardedWrite {
    fn from(record: DurableRecord) -> Self {
        Self::Set {
            key: record.key,
            value: record.value,
            metadata: record.metadata,
        }
    }
}

struct ForwardJob {
    target: String,
    url: String,
    write: ForwardedWrite,
}

#[derive(Debug, Default)]
struct ForwardCounters {
    sent: AtomicU64,
    failed: AtomicU64,
}

/// Background sender of forwarded writes.
pub struct WriteForwarder {
    config: ForwardingConfig,
    sender: Mutex<Option<mpsc::UnboundedSender<ForwardJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<ForwardCounters>,
}

impl WriteForwarder {
    /// Start the forwarding worker on the current Tokio runtime.
    pub fn spawn(client: Client, config: ForwardingConfig) -> CacheResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            CacheError::BackendUnavailable {
                backend: "forwarder".to_string(),
                reason: e.to_string(),
            }
        })?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(ForwardCounters::default());
        let worker = runtime.spawn(run_worker(
            client,
            config.internal_token.clone(),
            config.timeout,
            receiver,
            Arc::clone(&counters),
        ));

        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            counters,
        })
    }

    /// Queue `write` for the instance `target`. Never blocks.
    pub fn forward(&self, target: &str, write: ForwardedWrite) {
        let url = format!("{}{}", self.config.writer_url(target), FORWARD_PATH);
        let job = ForwardJob {
            target: target.to_string(),
            url,
            write,
        };
        let sender = mutex_lock(&self.sender, SOURCE, "forward");
        match sender.as_ref() {
            Some(sender) => {
                if let Err(mpsc::error::SendError(job)) = sender.send(job) {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = job.write.key(), target = %job.target, "Forwarding worker stopped, write dropped");
                }
            }
            None => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(key = job.write.key(), target = %job.target, "Forwarder closed, write dropped");
            }
        }
    }

    /// Writes delivered successfully.
    pub fn sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    /// Writes that failed or were dropped.
    pub fn failures(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Stop accepting writes and wait for queued ones to be attempted.
    pub async fn close(&self) {
        mutex_lock(&self.sender, SOURCE, "close").take();
        let worker = mutex_lock(&self.worker, SOURCE, "close").take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Forwarding worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for WriteForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteForwarder")
            .field("writer_url_template", &self.config.writer_url_template)
            .field("sent", &self.sent())
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}

async fn run_worker(
    client: Client,
    token: String,
    timeout: std::time::Duration,
    mut receiver: mpsc::UnboundedReceiver<ForwardJob>,
    counters: Arc<ForwardCounters>,
) {
    while let Some(job) = receiver.recv().await {
        let result = client
            .post(&job.url)
            .bearer_auth(&token)
            .timeout(timeout)
            .json(&job.write)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match result {
            Ok(_) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
                debug!(key = job.write.key(), target = %job.target, "Forwarded cache write");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                let failure = CacheError::ForwardFailure {
                    key: job.write.key().to_string(),
                    target: job.target.clone(),
                    reason: e.to_string(),
                };
                error!(key = job.write.key(), target = %job.target, url = %job.url, error = %failure, "Failed to forward cache write");
            }
        }
    }
}
