//! In-memory durable store.
//!
//! Process-local and non-persistent. Used when no real backend is configured
//! so the durable tier always answers.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use cachified_core::{DurableRecord, StorageError};

use super::traits::{BackendKind, DurableStore};
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "cachified::durable::memory";

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, DurableRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.records, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<DurableRecord>, StorageError> {
        Ok(rw_read(&self.records, SOURCE, "get").get(key).cloned())
    }

    async fn set(&self, record: DurableRecord) -> Result<(), StorageError> {
        rw_write(&self.records, SOURCE, "set").insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        rw_write(&self.records, SOURCE, "delete").remove(key);
        Ok(())
    }

    async fn list_keys(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        Ok(rw_read(&self.records, SOURCE, "list_keys")
            .keys()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn search_keys(&self, query: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        Ok(rw_read(&self.records, SOURCE, "search_keys")
            .keys()
            .filter(|key| key.contains(query))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, value: &str) -> DurableRecord {
        DurableRecord {
            key: key.to_string(),
            value: value.to_string(),
            metadata: r#"{"createdTime":0,"ttl":null,"swr":0}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let store = MemoryStore::new();
        store.set(record("k", "\"v1\"")).await.unwrap();
        store.set(record("k", "\"v2\"")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().value, "\"v2\"");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_absent_key_is_ok() {
        let store = MemoryStore::new();
        store.delete("missing").await.unwrap();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_and_search() {
        let store = MemoryStore::new();
        for key in ["blog:a", "blog:b", "podcast:a"] {
            store.set(record(key, "1")).await.unwrap();
        }
        assert_eq!(store.list_keys(2).await.unwrap(), vec!["blog:a", "blog:b"]);
        assert_eq!(
            store.search_keys(":a", 10).await.unwrap(),
            vec!["blog:a", "podcast:a"]
        );
        assert!(store.search_keys("zzz", 10).await.unwrap().is_empty());
    }
}
