//! cachified Storage - Cache Tiers and Orchestrator
//!
//! The ephemeral LRU tier, the pluggable durable tier with its backends,
//! write forwarding for single-writer deployments, the force-fresh gate, and
//! the [`Cachified`] orchestrator that ties them together.

pub mod builder;
pub mod cluster;
pub mod durable;
pub mod ephemeral;
pub mod forwarder;
pub mod gate;
mod lock;
pub mod orchestrator;
pub mod stats;

pub use builder::CachifiedBuilder;
pub use cluster::{ClusterMembership, InstanceInfo, PrimaryFileMembership, StaticMembership};
pub use durable::{
    BackendKind, DurableStore, DurableTier, LmdbStore, MemoryStore, RemoteKvStore,
};
pub use ephemeral::EphemeralTier;
pub use forwarder::{ForwardedWrite, WriteForwarder, FORWARD_PATH};
pub use gate::{Authorizer, ForceFreshGate, RoleAuthorizer};
pub use orchestrator::Cachified;
pub use stats::CacheStats;
