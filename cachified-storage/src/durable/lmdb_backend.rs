//! LMDB-backed single-writer durable store.
//!
//! Uses the heed crate (Rust bindings for LMDB). Each record is one row in a
//! named database: the cache key maps to a JSON object holding the
//! `metadata` and `value` text columns.
//!
//! # Single writer
//!
//! The environment file may be replicated to other instances by an external
//! mechanism. Only the designated writer opens it with [`LmdbStore::open`];
//! every other instance uses [`LmdbStore::open_read_only`], whose environment
//! never starts a write transaction. Routing writes to the designated writer
//! is the job of [`DurableTier`](super::DurableTier).
//!
//! # Blocking
//!
//! LMDB transactions are synchronous, so every operation runs on the blocking
//! thread pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cachified_core::{DurableRecord, StorageError};
use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use serde::{Deserialize, Serialize};

use super::traits::{BackendKind, DurableStore};

const DB_NAME: &str = "cache";

#[derive(Serialize, Deserialize)]
struct Row {
    metadata: String,
    value: String,
}

/// LMDB durable store.
#[derive(Clone)]
pub struct LmdbStore {
    env: Env,
    db: Database<Str, Str>,
    path: PathBuf,
    writable: bool,
    closed: Arc<AtomicBool>,
}

impl LmdbStore {
    /// Open (creating if needed) the store in directory `path` for writing.
    /// Only the designated writer may call this.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `map_size_mb` - Maximum size of the database in megabytes
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, StorageError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| open_failed(e.to_string()))?;

        let mut options = EnvOpenOptions::new();
        options
            .map_size(map_size_mb.saturating_mul(1024 * 1024))
            .max_dbs(1);
        // SAFETY: the environment is opened once per path by this process and
        // the memory map is never accessed outside heed's transactions.
        let env = unsafe { options.open(path) }.map_err(|e| open_failed(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_failed)?;
        let db: Database<Str, Str> = env
            .create_database(&mut wtxn, Some(DB_NAME))
            .map_err(|e| open_failed(e.to_string()))?;
        wtxn.commit().map_err(txn_failed)?;

        Ok(Self::from_env(env, db, path, true))
    }

    /// Open an existing store without write access, as a replica does.
    ///
    /// Fails when the environment or its database does not exist yet, i.e.
    /// before the designated writer's file has been replicated here.
    pub fn open_read_only<P: AsRef<Path>>(
        path: P,
        map_size_mb: usize,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref();

        let mut options = EnvOpenOptions::new();
        options
            .map_size(map_size_mb.saturating_mul(1024 * 1024))
            .max_dbs(1);
        // SAFETY: as in `open`; READ_ONLY only narrows what the map allows.
        let env = unsafe {
            options.flags(EnvFlags::READ_ONLY);
            options.open(path)
        }
        .map_err(|e| open_failed(e.to_string()))?;

        let rtxn = env.read_txn().map_err(txn_failed)?;
        let db: Database<Str, Str> = env
            .open_database(&rtxn, Some(DB_NAME))
            .map_err(|e| open_failed(e.to_string()))?
            .ok_or_else(|| {
                open_failed(format!("database '{}' not found in {}", DB_NAME, path.display()))
            })?;
        // keeps the database handle valid after the transaction ends
        rtxn.commit().map_err(txn_failed)?;

        Ok(Self::from_env(env, db, path, false))
    }

    fn from_env(env: Env, db: Database<Str, Str>, path: &Path, writable: bool) -> Self {
        Self {
            env,
            db,
            path: path.to_path_buf(),
            writable,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle was opened by the designated writer.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Number of records currently stored.
    pub fn len(&self) -> Result<u64, StorageError> {
        let rtxn = self.env.read_txn().map_err(txn_failed)?;
        self.db.len(&rtxn).map_err(txn_failed)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    fn ensure_writable(&self) -> Result<(), StorageError> {
        if !self.writable {
            return Err(StorageError::ReadOnly {
                backend: BackendKind::Lmdb.to_string(),
            });
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::TransactionFailed {
                reason: format!("LMDB store at {} is closed", self.path.display()),
            });
        }
        Ok(())
    }

    async fn run_blocking<R, F>(&self, op: F) -> Result<R, StorageError>
    where
        R: Send + 'static,
        F: FnOnce(Env, Database<Str, Str>) -> Result<R, StorageError> + Send + 'static,
    {
        self.ensure_open()?;
        let env = self.env.clone();
        let db = self.db;
        tokio::task::spawn_blocking(move || op(env, db))
            .await
            .map_err(|e| StorageError::TransactionFailed {
                reason: format!("LMDB task failed: {}", e),
            })?
    }

    fn collect_keys<F>(
        env: &Env,
        db: Database<Str, Str>,
        limit: usize,
        matches: F,
    ) -> Result<Vec<String>, StorageError>
    where
        F: Fn(&str) -> bool,
    {
        let rtxn = env.read_txn().map_err(txn_failed)?;
        let mut keys = Vec::new();
        for result in db.iter(&rtxn).map_err(txn_failed)? {
            if keys.len() >= limit {
                break;
            }
            let (key, _) = result.map_err(txn_failed)?;
            if matches(key) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for LmdbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbStore")
            .field("path", &self.path)
            .field("writable", &self.writable)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DurableStore for LmdbStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Lmdb
    }

    fn is_single_writer(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<DurableRecord>, StorageError> {
        let key = key.to_string();
        self.run_blocking(move |env, db| {
            let rtxn = env.read_txn().map_err(txn_failed)?;
            let Some(raw) = db.get(&rtxn, &key).map_err(txn_failed)? else {
                return Ok(None);
            };
            let row: Row =
                serde_json::from_str(raw).map_err(|e| StorageError::TransactionFailed {
                    reason: format!("corrupt row for {}: {}", key, e),
                })?;
            Ok(Some(DurableRecord {
                key,
                value: row.value,
                metadata: row.metadata,
            }))
        })
        .await
    }

    async fn set(&self, record: DurableRecord) -> Result<(), StorageError> {
        self.ensure_writable()?;
        self.run_blocking(move |env, db| {
            let row = serde_json::to_string(&Row {
                metadata: record.metadata,
                value: record.value,
            })
            .map_err(|e| StorageError::TransactionFailed {
                reason: e.to_string(),
            })?;
            let mut wtxn = env.write_txn().map_err(txn_failed)?;
            db.put(&mut wtxn, &record.key, &row).map_err(txn_failed)?;
            wtxn.commit().map_err(txn_failed)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_writable()?;
        let key = key.to_string();
        self.run_blocking(move |env, db| {
            let mut wtxn = env.write_txn().map_err(txn_failed)?;
            db.delete(&mut wtxn, &key).map_err(txn_failed)?;
            wtxn.commit().map_err(txn_failed)
        })
        .await
    }

    async fn list_keys(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        self.run_blocking(move |env, db| Self::collect_keys(&env, db, limit, |_| true))
            .await
    }

    async fn search_keys(&self, query: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        let query = query.to_string();
        self.run_blocking(move |env, db| {
            Self::collect_keys(&env, db, limit, |key| key.contains(query.as_str()))
        })
        .await
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) || !self.writable {
            return Ok(());
        }
        let env = self.env.clone();
        tokio::task::spawn_blocking(move || env.force_sync().map_err(txn_failed))
            .await
            .map_err(|e| StorageError::TransactionFailed {
                reason: format!("LMDB task failed: {}", e),
            })?
    }
}

fn open_failed(reason: String) -> StorageError {
    StorageError::OpenFailed {
        backend: BackendKind::Lmdb.to_string(),
        reason,
    }
}

fn txn_failed(e: heed::Error) -> StorageError {
    StorageError::TransactionFailed {
        reason: e.to_string(),
    }
}
