//! Constructing a [`Cachified`] instance.

use std::sync::Arc;

use cachified_core::{
    CacheError, CacheResult, Clock, EngineConfig, ForwardingConfig, SystemClock,
};
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterMembership, PrimaryFileMembership, StaticMembership};
use crate::durable::{DurableStore, DurableTier, LmdbStore, MemoryStore, RemoteKvStore};
use crate::ephemeral::EphemeralTier;
use crate::forwarder::WriteForwarder;
use crate::gate::{Authorizer, ForceFreshGate, RoleAuthorizer};
use crate::orchestrator::Cachified;

/// Builder for [`Cachified`].
///
/// Anything not set falls back to: 5000 ephemeral entries, an in-memory
/// durable store, this instance as primary, the `fresh` query parameter
/// gated on the `ADMIN` role, and the system clock.
pub struct CachifiedBuilder {
    ephemeral_capacity: usize,
    store: Option<Arc<dyn DurableStore>>,
    membership: Option<Arc<dyn ClusterMembership>>,
    forwarding: Option<ForwardingConfig>,
    http_client: Option<Client>,
    instance_id: String,
    force_fresh_param: String,
    admin_role: String,
    authorizer: Option<Arc<dyn Authorizer>>,
    clock: Arc<dyn Clock>,
}

impl Default for CachifiedBuilder {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            ephemeral_capacity: defaults.ephemeral_capacity,
            store: None,
            membership: None,
            forwarding: None,
            http_client: None,
            instance_id: defaults.instance_id,
            force_fresh_param: defaults.force_fresh_param,
            admin_role: defaults.admin_role,
            authorizer: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl CachifiedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ephemeral_capacity(mut self, capacity: usize) -> Self {
        self.ephemeral_capacity = capacity;
        self
    }

    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn membership(mut self, membership: Arc<dyn ClusterMembership>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Forward writes from replicas. Ignored unless the store is single-writer.
    pub fn forwarding(mut self, forwarding: ForwardingConfig) -> Self {
        self.forwarding = Some(forwarding);
        self
    }

    pub fn http_client(mut self, client: Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn force_fresh_param(mut self, param: impl Into<String>) -> Self {
        self.force_fresh_param = param.into();
        self
    }

    pub fn admin_role(mut self, role: impl Into<String>) -> Self {
        self.admin_role = role.into();
        self
    }

    /// Replace the role-based admin check.
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the cache. Must be called within a Tokio runtime when
    /// forwarding is enabled.
    pub fn build(self) -> CacheResult<Cachified> {
        let store = self.store.unwrap_or_else(|| {
            warn!("No durable backend configured, using in-memory durable store");
            Arc::new(MemoryStore::new())
        });

        let membership = self
            .membership
            .unwrap_or_else(|| Arc::new(StaticMembership::primary(self.instance_id.clone())));

        let forwarder = match self.forwarding {
            Some(forwarding) if store.is_single_writer() => {
                let client = self.http_client.unwrap_or_default();
                Some(WriteForwarder::spawn(client, forwarding)?)
            }
            Some(_) => {
                debug!(backend = %store.kind(), "Backend accepts writes from every instance, forwarding disabled");
                None
            }
            None => None,
        };

        let authorizer = self
            .authorizer
            .unwrap_or_else(|| Arc::new(RoleAuthorizer::new(self.admin_role.clone())));

        info!(
            backend = %store.kind(),
            instance = %self.instance_id,
            ephemeral_capacity = self.ephemeral_capacity,
            forwarding = forwarder.is_some(),
            "Cache initialised"
        );

        Ok(Cachified::from_parts(
            EphemeralTier::with_capacity(self.ephemeral_capacity),
            DurableTier::new(store, membership, forwarder),
            ForceFreshGate::new(self.force_fresh_param, authorizer),
            self.clock,
        ))
    }
}

impl Cachified {
    pub fn builder() -> CachifiedBuilder {
        CachifiedBuilder::new()
    }

    /// Build from validated configuration.
    ///
    /// Backend selection: an LMDB path wins over a remote KV URL; with
    /// neither, or when the selected backend cannot be opened, the in-memory
    /// store is used and a warning is logged.
    pub fn from_config(config: &EngineConfig) -> CacheResult<Self> {
        config.validate()?;
        Self::builder_from_config(config).build()
    }

    /// Like [`from_config`](Self::from_config), returning the builder for
    /// further customisation (clock, authorizer, HTTP client).
    pub fn builder_from_config(config: &EngineConfig) -> CachifiedBuilder {
        let mut builder = CachifiedBuilder::new()
            .ephemeral_capacity(config.ephemeral_capacity)
            .instance_id(config.instance_id.clone())
            .force_fresh_param(config.force_fresh_param.clone())
            .admin_role(config.admin_role.clone());

        if let Some(store) = open_store(config) {
            builder = builder.store(store);
        }

        if let Some(path) = &config.primary_file {
            builder = builder.membership(Arc::new(PrimaryFileMembership::new(
                config.instance_id.clone(),
                path.clone(),
            )));
        }

        if let Some(forwarding) = &config.forwarding {
            builder = builder.forwarding(forwarding.clone());
        }

        builder
    }
}

/// Whether this instance may open the single-writer store for writes.
/// Unreadable membership counts as a replica.
fn is_designated_writer(config: &EngineConfig) -> bool {
    let Some(path) = &config.primary_file else {
        return true;
    };
    match PrimaryFileMembership::new(config.instance_id.clone(), path.clone())
        .instance_info_blocking()
    {
        Ok(info) => info.current_is_primary,
        Err(e) => {
            warn!(error = %e, "Membership unknown at startup, opening LMDB read-only");
            false
        }
    }
}

fn open_store(config: &EngineConfig) -> Option<Arc<dyn DurableStore>> {
    if let Some(path) = &config.lmdb_path {
        let opened = if is_designated_writer(config) {
            LmdbStore::open(path, config.lmdb_map_size_mb)
        } else {
            debug!(path = %path.display(), "Opening LMDB read-only as a replica");
            LmdbStore::open_read_only(path, config.lmdb_map_size_mb)
        };
        return match opened {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                let unavailable = CacheError::BackendUnavailable {
                    backend: "lmdb".to_string(),
                    reason: e.to_string(),
                };
                warn!(path = %path.display(), error = %unavailable, "Falling back to in-memory durable store");
                None
            }
        };
    }

    if let Some(remote) = &config.remote_kv {
        return match RemoteKvStore::new(remote) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                let unavailable = CacheError::BackendUnavailable {
                    backend: "remote-kv".to_string(),
                    reason: e.to_string(),
                };
                warn!(url = %remote.base_url, error = %unavailable, "Falling back to in-memory durable store");
                None
            }
        };
    }

    None
}
