//! Durable store trait.
//!
//! Backends persist [`DurableRecord`]s as opaque JSON text; typing and
//! freshness decisions happen above this layer.

use std::fmt;

use async_trait::async_trait;
use cachified_core::{DurableRecord, StorageError};
use serde::{Deserialize, Serialize};

/// Which backend implementation is behind a [`DurableStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Lmdb,
    RemoteKv,
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lmdb => "lmdb",
            Self::RemoteKv => "remote-kv",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent key-value storage for cache records.
///
/// Implementations must be safe for concurrent use from many in-flight
/// requests. Writes are last-write-wins; no history is kept.
#[async_trait]
pub trait DurableStore: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether only the designated writer may call `set`/`delete`.
    fn is_single_writer(&self) -> bool {
        false
    }

    async fn get(&self, key: &str) -> Result<Option<DurableRecord>, StorageError>;

    async fn set(&self, record: DurableRecord) -> Result<(), StorageError>;

    /// Remove `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Up to `limit` keys in backend order.
    async fn list_keys(&self, limit: usize) -> Result<Vec<String>, StorageError>;

    /// Up to `limit` keys containing `query`.
    async fn search_keys(&self, query: &str, limit: usize) -> Result<Vec<String>, StorageError>;

    /// Flush and release backend resources.
    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_names() {
        assert_eq!(BackendKind::Lmdb.to_string(), "lmdb");
        assert_eq!(BackendKind::RemoteKv.as_str(), "remote-kv");
        assert_eq!(
            serde_json::to_string(&BackendKind::RemoteKv).unwrap(),
            "\"remote-kv\""
        );
    }
}
