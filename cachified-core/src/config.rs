//! Engine configuration.
//!
//! Configuration is loaded from environment variables with defaults suited
//! to a single local instance. Which durable backend is active is decided
//! from what is configured here: an LMDB path wins over a remote KV URL, and
//! with neither the engine falls back to an in-memory durable tier.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Placeholder in [`ForwardingConfig::writer_url_template`] replaced with the
/// designated writer's instance id.
pub const INSTANCE_PLACEHOLDER: &str = "{instance}";

/// Remote key-value service connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKvConfig {
    /// Base URL, e.g. `https://kv.internal/v1/namespaces/site`.
    pub base_url: String,
    /// Bearer token, if the service requires one.
    pub token: Option<String>,
    /// Prefix applied to every key.
    pub namespace: String,
}

/// How to reach the designated writer when this instance is a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingConfig {
    /// URL template containing `{instance}`, e.g.
    /// `http://{instance}.vm.site.internal:8080`.
    pub writer_url_template: String,
    /// Shared secret sent as a bearer token.
    pub internal_token: String,
    /// Per-request timeout for forwarded writes.
    pub timeout: Duration,
}

impl ForwardingConfig {
    /// Base URL of `instance`.
    pub fn writer_url(&self, instance: &str) -> String {
        self.writer_url_template
            .replace(INSTANCE_PLACEHOLDER, instance)
            .trim_end_matches('/')
            .to_string()
    }
}

/// Configuration for one cache engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of entries in the ephemeral tier.
    pub ephemeral_capacity: usize,
    /// Directory for the LMDB single-writer store.
    pub lmdb_path: Option<PathBuf>,
    /// LMDB map size in megabytes.
    pub lmdb_map_size_mb: usize,
    pub remote_kv: Option<RemoteKvConfig>,
    /// This instance's identity in the cluster.
    pub instance_id: String,
    /// File naming the current primary; absent file means this instance is primary.
    pub primary_file: Option<PathBuf>,
    pub forwarding: Option<ForwardingConfig>,
    /// Query parameter inspected by the force-fresh gate.
    pub force_fresh_param: String,
    /// Role that may force fresh values.
    pub admin_role: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ephemeral_capacity: 5000,
            lmdb_path: None,
            lmdb_map_size_mb: 512,
            remote_kv: None,
            instance_id: "localhost".to_string(),
            primary_file: None,
            forwarding: None,
            force_fresh_param: "fresh".to_string(),
            admin_role: "ADMIN".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an EngineConfig from environment variables.
    ///
    /// Environment variables:
    /// - `CACHIFIED_EPHEMERAL_CAPACITY`: max ephemeral entries (default: 5000)
    /// - `CACHIFIED_LMDB_PATH`: enables the LMDB store in this directory
    /// - `CACHIFIED_LMDB_MAP_SIZE_MB`: LMDB map size (default: 512)
    /// - `CACHIFIED_REMOTE_KV_URL`: enables the remote KV store
    /// - `CACHIFIED_REMOTE_KV_TOKEN`: bearer token for the remote KV store
    /// - `CACHIFIED_REMOTE_KV_NAMESPACE`: key prefix (default: "cache:")
    /// - `CACHIFIED_INSTANCE_ID`: instance id (default: `HOSTNAME`, then "localhost")
    /// - `CACHIFIED_PRIMARY_FILE`: file naming the primary instance
    /// - `CACHIFIED_WRITER_URL_TEMPLATE`: writer base URL containing `{instance}`
    /// - `CACHIFIED_INTERNAL_TOKEN`: shared secret for forwarded writes
    /// - `CACHIFIED_FORWARD_TIMEOUT_MS`: forward request timeout (default: 5000)
    /// - `CACHIFIED_FORCE_FRESH_PARAM`: query parameter name (default: "fresh")
    /// - `CACHIFIED_ADMIN_ROLE`: role allowed to force fresh values (default: "ADMIN")
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ephemeral_capacity = env_parse("CACHIFIED_EPHEMERAL_CAPACITY")
            .unwrap_or(defaults.ephemeral_capacity);

        let lmdb_path = env_string("CACHIFIED_LMDB_PATH").map(PathBuf::from);

        let lmdb_map_size_mb =
            env_parse("CACHIFIED_LMDB_MAP_SIZE_MB").unwrap_or(defaults.lmdb_map_size_mb);

        let remote_kv = env_string("CACHIFIED_REMOTE_KV_URL").map(|base_url| RemoteKvConfig {
            base_url,
            token: env_string("CACHIFIED_REMOTE_KV_TOKEN"),
            namespace: env_string("CACHIFIED_REMOTE_KV_NAMESPACE")
                .unwrap_or_else(|| "cache:".to_string()),
        });

        let instance_id = env_string("CACHIFIED_INSTANCE_ID")
            .or_else(|| env_string("HOSTNAME"))
            .unwrap_or(defaults.instance_id);

        let primary_file = env_string("CACHIFIED_PRIMARY_FILE").map(PathBuf::from);

        let forwarding = env_string("CACHIFIED_WRITER_URL_TEMPLATE").map(|writer_url_template| {
            ForwardingConfig {
                writer_url_template,
                internal_token: env_string("CACHIFIED_INTERNAL_TOKEN").unwrap_or_default(),
                timeout: Duration::from_millis(
                    env_parse("CACHIFIED_FORWARD_TIMEOUT_MS").unwrap_or(5000),
                ),
            }
        });

        let force_fresh_param =
            env_string("CACHIFIED_FORCE_FRESH_PARAM").unwrap_or(defaults.force_fresh_param);
        let admin_role = env_string("CACHIFIED_ADMIN_ROLE").unwrap_or(defaults.admin_role);

        Self {
            ephemeral_capacity,
            lmdb_path,
            lmdb_map_size_mb,
            remote_kv,
            instance_id,
            primary_file,
            forwarding,
            force_fresh_param,
            admin_role,
        }
    }

    pub fn with_ephemeral_capacity(mut self, capacity: usize) -> Self {
        self.ephemeral_capacity = capacity;
        self
    }

    pub fn with_lmdb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lmdb_path = Some(path.into());
        self
    }

    pub fn with_remote_kv(mut self, remote_kv: RemoteKvConfig) -> Self {
        self.remote_kv = Some(remote_kv);
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_primary_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.primary_file = Some(path.into());
        self
    }

    pub fn with_forwarding(mut self, forwarding: ForwardingConfig) -> Self {
        self.forwarding = Some(forwarding);
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - ephemeral_capacity > 0
    /// - lmdb_map_size_mb > 0 when an LMDB path is set
    /// - instance_id and force_fresh_param are non-empty
    /// - the writer URL template contains `{instance}` and a token is set
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ephemeral_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ephemeral_capacity".to_string(),
                value: "0".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.lmdb_path.is_some() && self.lmdb_map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lmdb_map_size_mb".to_string(),
                value: "0".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "instance_id".to_string(),
            });
        }

        if self.force_fresh_param.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "force_fresh_param".to_string(),
            });
        }

        if let Some(remote) = &self.remote_kv {
            if remote.base_url.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "remote_kv.base_url".to_string(),
                });
            }
        }

        if let Some(forwarding) = &self.forwarding {
            if !forwarding.writer_url_template.contains(INSTANCE_PLACEHOLDER) {
                return Err(ConfigError::InvalidValue {
                    field: "writer_url_template".to_string(),
                    value: forwarding.writer_url_template.clone(),
                    reason: format!("must contain {}", INSTANCE_PLACEHOLDER),
                });
            }
            if forwarding.internal_token.is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "internal_token".to_string(),
                });
            }
            if forwarding.timeout.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "forward_timeout".to_string(),
                    value: "0".to_string(),
                    reason: "must be greater than 0".to_string(),
                });
            }
        }

        if self.forwarding.is_some() && self.lmdb_path.is_none() {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "writer_url_template".to_string(),
                option_b: "no lmdb_path (forwarding only applies to the single-writer store)"
                    .to_string(),
            });
        }

        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarding() -> ForwardingConfig {
        ForwardingConfig {
            writer_url_template: "http://{instance}.vm.site.internal:8080/".to_string(),
            internal_token: "secret".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.ephemeral_capacity, 5000);
        assert_eq!(config.force_fresh_param, "fresh");
        assert_eq!(config.admin_role, "ADMIN");
        assert!(config.lmdb_path.is_none());
        assert!(config.remote_kv.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_writer_url() {
        assert_eq!(
            forwarding().writer_url("abc123"),
            "http://abc123.vm.site.internal:8080"
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = EngineConfig::new().with_ephemeral_capacity(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "ephemeral_capacity"
        ));
    }

    #[test]
    fn test_template_requires_placeholder() {
        let mut fwd = forwarding();
        fwd.writer_url_template = "http://writer:8080".to_string();
        let config = EngineConfig::new()
            .with_lmdb_path("/tmp/cache")
            .with_forwarding(fwd);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_forwarding_requires_single_writer_store() {
        let config = EngineConfig::new().with_forwarding(forwarding());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompatibleOptions { .. })
        ));

        let config = config.with_lmdb_path("/tmp/cache");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_forwarding_requires_token() {
        let mut fwd = forwarding();
        fwd.internal_token.clear();
        let config = EngineConfig::new()
            .with_lmdb_path("/tmp/cache")
            .with_forwarding(fwd);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired { field }) if field == "internal_token"
        ));
    }
}
