//! The durable tier as seen by the orchestrator.
//!
//! Wraps one [`DurableStore`] and adds what the hot path needs: typed
//! encode/decode, routing of writes to the designated writer for
//! single-writer stores, and degradation. Hot-path reads and writes never
//! fail; errors are logged and turned into a miss or a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cachified_core::{CacheEntry, CacheError, CacheResult, DurableRecord, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::traits::{BackendKind, DurableStore};
use crate::cluster::{ClusterMembership, InstanceInfo};
use crate::forwarder::{ForwardedWrite, WriteForwarder};

/// Where a write for the current instance should go.
enum WriteRoute {
    Local,
    Forward(String),
    Skip,
}

pub struct DurableTier {
    store: Arc<dyn DurableStore>,
    membership: Arc<dyn ClusterMembership>,
    forwarder: Option<WriteForwarder>,
    degraded: AtomicBool,
}

impl DurableTier {
    pub fn new(
        store: Arc<dyn DurableStore>,
        membership: Arc<dyn ClusterMembership>,
        forwarder: Option<WriteForwarder>,
    ) -> Self {
        Self {
            store,
            membership,
            forwarder,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.store.kind()
    }

    /// Whether the last hot-path operation against the store failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn forwarder(&self) -> Option<&WriteForwarder> {
        self.forwarder.as_ref()
    }

    pub async fn instance_info(&self) -> CacheResult<InstanceInfo> {
        self.membership.instance_info().await
    }

    /// Raw read. Errors are logged and reported as a miss.
    pub async fn read(&self, key: &str) -> Option<DurableRecord> {
        match self.store.get(key).await {
            Ok(record) => {
                self.mark_healthy();
                record
            }
            Err(e) => {
                self.mark_failed("read", key, &e);
                None
            }
        }
    }

    /// Raw write, forwarded to the designated writer when required.
    pub async fn write(&self, record: DurableRecord) {
        match self.route(&record.key).await {
            WriteRoute::Local => {
                let key = record.key.clone();
                match self.store.set(record).await {
                    Ok(()) => self.mark_healthy(),
                    Err(e) => self.mark_failed("write", &key, &e),
                }
            }
            WriteRoute::Forward(target) => self.forward(&target, record.into()),
            WriteRoute::Skip => {}
        }
    }

    /// Raw delete, forwarded to the designated writer when required.
    pub async fn remove(&self, key: &str) {
        match self.route(key).await {
            WriteRoute::Local => match self.store.delete(key).await {
                Ok(()) => self.mark_healthy(),
                Err(e) => self.mark_failed("delete", key, &e),
            },
            WriteRoute::Forward(target) => self.forward(
                &target,
                ForwardedWrite::Delete {
                    key: key.to_string(),
                },
            ),
            WriteRoute::Skip => {}
        }
    }

    /// Typed read. Undecodable records are treated as a miss and left in place.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let record = self.read(key).await?;
        match record.decode::<T>() {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(key, backend = %self.kind(), error = %e, "Ignoring undecodable durable record");
                None
            }
        }
    }

    /// Typed write.
    pub async fn set<T: Serialize>(&self, key: &str, entry: &CacheEntry<T>) {
        match DurableRecord::encode(key, entry) {
            Ok(record) => self.write(record).await,
            Err(e) => warn!(key, error = %e, "Failed to encode cache entry, durable write skipped"),
        }
    }

    pub async fn delete(&self, key: &str) {
        self.remove(key).await
    }

    /// Operator key listing. Errors are returned, not swallowed.
    pub async fn list_keys(&self, limit: usize) -> CacheResult<Vec<String>> {
        Ok(self.store.list_keys(limit).await?)
    }

    pub async fn search_keys(&self, query: &str, limit: usize) -> CacheResult<Vec<String>> {
        Ok(self.store.search_keys(query, limit).await?)
    }

    /// Apply a write forwarded from a replica. Only the designated writer of
    /// a single-writer store accepts these.
    pub async fn apply_forwarded(&self, write: ForwardedWrite) -> CacheResult<()> {
        if self.store.is_single_writer() {
            let info = self.membership.instance_info().await?;
            if !info.current_is_primary {
                return Err(StorageError::ReadOnly {
                    backend: self.kind().to_string(),
                }
                .into());
            }
        }
        match write {
            ForwardedWrite::Set {
                key,
                value,
                metadata,
            } => {
                let record = DurableRecord {
                    key,
                    value,
                    metadata,
                };
                // reject garbage before it lands in the shared store
                record.decode_metadata()?;
                self.store.set(record).await?;
            }
            ForwardedWrite::Delete { key } => self.store.delete(&key).await?,
        }
        Ok(())
    }

    /// Drain pending forwards, then close the store.
    pub async fn close(&self) -> CacheResult<()> {
        if let Some(forwarder) = &self.forwarder {
            forwarder.close().await;
        }
        self.store.close().await?;
        Ok(())
    }

    async fn route(&self, key: &str) -> WriteRoute {
        if !self.store.is_single_writer() {
            return WriteRoute::Local;
        }
        let info = match self.membership.instance_info().await {
            Ok(info) => info,
            Err(e) => {
                warn!(key, error = %e, "Cannot resolve designated writer, durable write skipped");
                return WriteRoute::Skip;
            }
        };
        if info.current_is_primary {
            return WriteRoute::Local;
        }
        if self.forwarder.is_none() {
            let e = StorageError::ReadOnly {
                backend: self.kind().to_string(),
            };
            warn!(key, primary = %info.primary_instance, error = %e, "No forwarder configured, durable write skipped");
            return WriteRoute::Skip;
        }
        WriteRoute::Forward(info.primary_instance)
    }

    fn forward(&self, target: &str, write: ForwardedWrite) {
        if let Some(forwarder) = &self.forwarder {
            forwarder.forward(target, write);
        }
    }

    fn mark_failed(&self, op: &'static str, key: &str, e: &StorageError) {
        let unavailable = CacheError::BackendUnavailable {
            backend: self.kind().to_string(),
            reason: e.to_string(),
        };
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(op, key, error = %unavailable, "Durable tier failing, continuing with ephemeral tier");
        } else {
            debug!(op, key, error = %unavailable, "Durable tier still failing");
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!(backend = %self.kind(), "Durable tier recovered");
        }
    }
}

impl std::fmt::Debug for DurableTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableTier")
            .field("kind", &self.kind())
            .field("degraded", &self.is_degraded())
            .field("forwarder", &self.forwarder)
            .finish_non_exhaustive()
    }
}
