//! Cluster membership: which instance is the durable tier's designated writer.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use cachified_core::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};

/// Identity of this instance and of the current primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub current_instance: String,
    pub primary_instance: String,
    pub current_is_primary: bool,
}

impl InstanceInfo {
    pub fn new(current: impl Into<String>, primary: impl Into<String>) -> Self {
        let current_instance = current.into();
        let primary_instance = primary.into();
        Self {
            current_is_primary: current_instance == primary_instance,
            current_instance,
            primary_instance,
        }
    }
}

/// Resolves the designated writer. Consulted on every durable write, so
/// implementations should be cheap.
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    async fn instance_info(&self) -> CacheResult<InstanceInfo>;
}

/// Fixed membership, for single-instance deployments and tests.
#[derive(Debug, Clone)]
pub struct StaticMembership {
    info: InstanceInfo,
}

impl StaticMembership {
    pub fn new(current: impl Into<String>, primary: impl Into<String>) -> Self {
        Self {
            info: InstanceInfo::new(current, primary),
        }
    }

    /// This instance is the primary.
    pub fn primary(instance: impl Into<String>) -> Self {
        let instance = instance.into();
        Self::new(instance.clone(), instance)
    }
}

#[async_trait]
impl ClusterMembership for StaticMembership {
    async fn instance_info(&self) -> CacheResult<InstanceInfo> {
        Ok(self.info.clone())
    }
}

/// Membership read from a primary file, as written by replicated-SQLite style
/// filesystems: the file exists only on replicas and contains the primary's
/// instance id.
#[derive(Debug, Clone)]
pub struct PrimaryFileMembership {
    current: String,
    path: PathBuf,
}

impl PrimaryFileMembership {
    pub fn new(current: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            current: current.into(),
            path: path.into(),
        }
    }

    /// Resolve membership without a runtime, for choosing how to open the
    /// durable store at startup.
    pub fn instance_info_blocking(&self) -> CacheResult<InstanceInfo> {
        self.resolve(std::fs::read_to_string(&self.path))
    }

    fn resolve(&self, read: std::io::Result<String>) -> CacheResult<InstanceInfo> {
        match read {
            Ok(contents) => {
                let primary = contents.trim();
                if primary.is_empty() {
                    return Err(CacheError::Membership {
                        reason: format!("primary file {} is empty", self.path.display()),
                    });
                }
                Ok(InstanceInfo::new(self.current.clone(), primary))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Ok(InstanceInfo::new(self.current.clone(), self.current.clone()))
            }
            Err(e) => Err(CacheError::Membership {
                reason: format!("failed to read {}: {}", self.path.display(), e),
            }),
        }
    }
}

#[async_trait]
impl ClusterMembership for PrimaryFileMembership {
    async fn instance_info(&self) -> CacheResult<InstanceInfo> {
        self.resolve(tokio::fs::read_to_string(&self.path).await)
    }
}
